//! Quota-gated gateway for hosted LLM backends.
//!
//! The heart of the crate is [`governor::Governor`]: per-key
//! requests-per-minute and requests-per-day windows, atomic admission, and
//! exponential-backoff retry around upstream calls. The rest is the axum
//! surface that exposes it.

pub mod backoff;
pub mod clock;
pub mod config;
pub mod error;
pub mod governor;
pub mod handlers;
pub mod keys;
pub mod metrics;
pub mod models;
pub mod rate_limit;
pub mod state;
pub mod upstream;

pub use config::{Args, GovernorConfig};
pub use error::{GovernorError, UpstreamError};
pub use governor::{Governed, Governor};
pub use rate_limit::{AdmitResult, RejectReason, UsageSnapshot};
