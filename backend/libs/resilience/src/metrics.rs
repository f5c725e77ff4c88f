/// Prometheus metrics for retries
#[cfg(feature = "metrics")]
use prometheus::{register_histogram_vec, HistogramVec};

#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;

#[cfg(feature = "metrics")]
static RETRY_ATTEMPTS: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "resilience_retry_attempts",
        "Number of attempts before success, exhaustion or a permanent failure",
        &["result"],
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 8.0, 10.0]
    )
    .expect("Failed to register retry attempts metric")
});

/// Metrics collector for retries
#[cfg(feature = "metrics")]
pub struct RetryMetrics;

#[cfg(feature = "metrics")]
impl RetryMetrics {
    pub fn record_attempts(result: &str, attempts: u32) {
        RETRY_ATTEMPTS
            .with_label_values(&[result])
            .observe(attempts as f64);
    }
}

// No-op implementation when metrics feature is disabled
#[cfg(not(feature = "metrics"))]
pub struct RetryMetrics;

#[cfg(not(feature = "metrics"))]
impl RetryMetrics {
    pub fn record_attempts(_result: &str, _attempts: u32) {}
}
