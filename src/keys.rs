use sha2::{Digest, Sha256};

// Key used when a caller sends no x-api-key header
pub const DEFAULT_KEY: &str = "global";

// Short, stable stand-in for an API key in logs and metrics (never log the key)
pub fn fingerprint(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..12].to_string()
}
