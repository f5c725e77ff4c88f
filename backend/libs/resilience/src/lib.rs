/// Retry with bounded exponential backoff
///
/// Broker calls fail in two ways: transiently (connection loss, request timeout)
/// and permanently (a record that can never be serialized, a bad topic name).
/// This library retries only the first kind:
/// - **Retryable**: errors classify themselves as transient or permanent
/// - **Backoff**: exponential with a ceiling and optional ±30% jitter
/// - **Bounded**: capped attempts plus an optional total elapsed budget
/// - **Metrics**: attempt histograms when the `metrics` feature is enabled
///
/// # Example: publish with retry
///
/// ```rust,no_run
/// use resilience::{with_retry, RetryConfig, Retryable};
///
/// #[derive(Debug)]
/// struct SendError;
///
/// impl std::fmt::Display for SendError {
///     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
///         write!(f, "broker unavailable")
///     }
/// }
///
/// impl Retryable for SendError {
///     fn is_retryable(&self) -> bool {
///         true
///     }
/// }
///
/// #[tokio::main]
/// async fn main() {
///     let config = RetryConfig::default();
///
///     let result = with_retry(&config, || async {
///         // Your broker call here
///         Ok::<_, SendError>(())
///     })
///     .await;
/// }
/// ```

pub mod metrics;
pub mod retry;

// Re-export main types for convenience
pub use retry::{with_retry, RetryConfig, RetryError, Retryable};
