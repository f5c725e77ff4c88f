use resilience::RetryConfig;
use serde::Deserialize;
use std::time::Duration;

/// Process-level settings shared by both binaries.
///
/// Broker and consumer group settings live in `ticket_stream::StreamConfig`.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Port of the /metrics, /health and /ready endpoints
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    #[serde(default = "default_metrics_namespace")]
    pub metrics_namespace: String,

    /// Tickets generated per second by the producer
    #[serde(default = "default_produce_rate_per_sec")]
    pub produce_rate_per_sec: u32,

    /// Number of distinct order ids the producer cycles through. Unset means
    /// every ticket gets its own order id.
    #[serde(default)]
    pub order_key_cardinality: Option<i64>,

    /// Consecutive failed consume attempts before the consumer gives up
    #[serde(default = "default_reconnect_max_retries")]
    pub reconnect_max_retries: u32,
}

fn default_metrics_port() -> u16 {
    2112
}

fn default_metrics_namespace() -> String {
    "ticket_processor".to_string()
}

fn default_produce_rate_per_sec() -> u32 {
    100
}

fn default_reconnect_max_retries() -> u32 {
    10
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            metrics_port: default_metrics_port(),
            metrics_namespace: default_metrics_namespace(),
            produce_rate_per_sec: default_produce_rate_per_sec(),
            order_key_cardinality: None,
            reconnect_max_retries: default_reconnect_max_retries(),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env::<ServiceConfig>()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.produce_rate_per_sec == 0 {
            anyhow::bail!("PRODUCE_RATE_PER_SEC must be greater than zero");
        }
        if matches!(self.order_key_cardinality, Some(n) if n <= 0) {
            anyhow::bail!("ORDER_KEY_CARDINALITY must be positive when set");
        }
        if self.metrics_namespace.is_empty() {
            anyhow::bail!("METRICS_NAMESPACE cannot be empty");
        }
        Ok(())
    }

    /// Interval between two generated tickets.
    pub fn produce_interval(&self) -> Duration {
        Duration::from_secs(1) / self.produce_rate_per_sec.max(1)
    }

    /// Backoff between consume attempts after a transient failure.
    pub fn reconnect_backoff(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.reconnect_max_retries,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            max_elapsed: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_pairs(pairs: &[(&str, &str)]) -> ServiceConfig {
        envy::from_iter(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string())),
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = from_pairs(&[]);
        assert_eq!(config.metrics_port, 2112);
        assert_eq!(config.metrics_namespace, "ticket_processor");
        assert_eq!(config.produce_rate_per_sec, 100);
        assert_eq!(config.order_key_cardinality, None);
        assert_eq!(config.produce_interval(), Duration::from_millis(10));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_overrides() {
        let config = from_pairs(&[
            ("METRICS_PORT", "9100"),
            ("PRODUCE_RATE_PER_SEC", "4"),
            ("ORDER_KEY_CARDINALITY", "16"),
        ]);
        assert_eq!(config.metrics_port, 9100);
        assert_eq!(config.order_key_cardinality, Some(16));
        assert_eq!(config.produce_interval(), Duration::from_millis(250));
    }

    #[test]
    fn test_validation() {
        let zero_rate = ServiceConfig {
            produce_rate_per_sec: 0,
            ..Default::default()
        };
        assert!(zero_rate.validate().is_err());

        let bad_cardinality = ServiceConfig {
            order_key_cardinality: Some(0),
            ..Default::default()
        };
        assert!(bad_cardinality.validate().is_err());
    }
}
