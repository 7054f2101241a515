use crate::governor::Governor;
use crate::upstream::UpstreamClient;

// app's shared state
pub struct AppState {
    pub governor: Governor,
    pub upstream: UpstreamClient,
}
