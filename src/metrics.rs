use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, Histogram, register_counter, register_counter_vec, register_gauge,
    register_histogram,
};

// Registration only fails on duplicate names, which is a programming error
lazy_static! {
    pub static ref REQUEST_TOTAL: Counter =
        register_counter!("gateway_requests_total", "Total number of generate requests").unwrap();
    pub static ref ADMITTED_TOTAL: Counter = register_counter!(
        "gateway_admitted_total",
        "Requests admitted by the quota governor"
    )
    .unwrap();
    pub static ref REJECTED_TOTAL: CounterVec = register_counter_vec!(
        "gateway_rejected_total",
        "Requests rejected by the quota governor",
        &["reason"]
    )
    .unwrap();
    pub static ref UPSTREAM_RETRIES_TOTAL: Counter = register_counter!(
        "gateway_upstream_retries_total",
        "Upstream attempts retried after a transient failure"
    )
    .unwrap();
    pub static ref RETRIES_EXHAUSTED_TOTAL: Counter = register_counter!(
        "gateway_retries_exhausted_total",
        "Calls that failed after every retry"
    )
    .unwrap();
    pub static ref REQUEST_LATENCY: Histogram = register_histogram!(
        "gateway_request_latency_seconds",
        "Request latency in seconds, retries included"
    )
    .unwrap();
    pub static ref TRACKED_KEYS: Gauge =
        register_gauge!("gateway_tracked_keys", "API keys with a usage record").unwrap();
}
