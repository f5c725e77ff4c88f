/// Configuration for the ticket stream, read from the environment
use resilience::RetryConfig;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{StreamError, StreamResult};
use crate::member::{CommitPolicy, MemberConfig};

#[derive(Debug, Clone, Deserialize)]
pub struct StreamConfig {
    /// Comma-separated bootstrap servers
    #[serde(default = "default_brokers")]
    pub kafka_brokers: String,

    #[serde(default = "default_topic")]
    pub kafka_topic: String,

    #[serde(default = "default_group_id")]
    pub kafka_group_id: String,

    /// Max records handed to the member per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Upper bound on a single publish, including client retries
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u64,

    #[serde(default = "default_publish_max_retries")]
    pub publish_max_retries: u32,

    #[serde(default = "default_retry_initial_interval_ms")]
    pub retry_initial_interval_ms: u64,

    #[serde(default = "default_retry_max_interval_ms")]
    pub retry_max_interval_ms: u64,

    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    #[serde(default = "default_handler_max_retries")]
    pub handler_max_retries: u32,

    #[serde(default)]
    pub commit_policy: CommitPolicy,
}

fn default_brokers() -> String {
    "localhost:9092".to_string()
}

fn default_topic() -> String {
    "tickets".to_string()
}

fn default_group_id() -> String {
    "ticket-processor".to_string()
}

fn default_batch_size() -> usize {
    100
}

fn default_session_timeout_ms() -> u64 {
    10_000
}

fn default_heartbeat_interval_ms() -> u64 {
    3_000
}

fn default_message_timeout_ms() -> u64 {
    30_000
}

fn default_publish_max_retries() -> u32 {
    5
}

fn default_retry_initial_interval_ms() -> u64 {
    100
}

fn default_retry_max_interval_ms() -> u64 {
    2_000
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_handler_max_retries() -> u32 {
    3
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            kafka_brokers: default_brokers(),
            kafka_topic: default_topic(),
            kafka_group_id: default_group_id(),
            batch_size: default_batch_size(),
            session_timeout_ms: default_session_timeout_ms(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            message_timeout_ms: default_message_timeout_ms(),
            publish_max_retries: default_publish_max_retries(),
            retry_initial_interval_ms: default_retry_initial_interval_ms(),
            retry_max_interval_ms: default_retry_max_interval_ms(),
            retry_multiplier: default_retry_multiplier(),
            handler_max_retries: default_handler_max_retries(),
            commit_policy: CommitPolicy::default(),
        }
    }
}

impl StreamConfig {
    /// Load from the process environment, after `.env` if present.
    pub fn from_env() -> Result<Self, envy::Error> {
        dotenvy::dotenv().ok();
        envy::from_env()
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.brokers().is_empty() {
            return Err(StreamError::Config("KAFKA_BROKERS is empty".to_string()));
        }
        if self.kafka_topic.trim().is_empty() {
            return Err(StreamError::Config("KAFKA_TOPIC is empty".to_string()));
        }
        if self.kafka_group_id.trim().is_empty() {
            return Err(StreamError::Config("KAFKA_GROUP_ID is empty".to_string()));
        }
        if self.batch_size == 0 {
            return Err(StreamError::Config("BATCH_SIZE must be positive".to_string()));
        }
        if self.heartbeat_interval_ms >= self.session_timeout_ms {
            return Err(StreamError::Config(format!(
                "HEARTBEAT_INTERVAL_MS ({}) must be below SESSION_TIMEOUT_MS ({})",
                self.heartbeat_interval_ms, self.session_timeout_ms
            )));
        }
        if self.retry_multiplier < 1.0 {
            return Err(StreamError::Config(
                "RETRY_MULTIPLIER must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn brokers(&self) -> Vec<String> {
        self.kafka_brokers
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect()
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }

    /// Caller-side publish retry, bounded by attempts and by
    /// `max_retries * max_interval` of elapsed time.
    pub fn publish_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.publish_max_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_interval_ms),
            max_backoff: Duration::from_millis(self.retry_max_interval_ms),
            backoff_multiplier: self.retry_multiplier,
            jitter: true,
            max_elapsed: None,
        }
        .with_derived_max_elapsed()
    }

    /// Retry applied to a failing record handler before the member gives up.
    pub fn handler_retry(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.handler_max_retries,
            initial_backoff: Duration::from_millis(self.retry_initial_interval_ms),
            max_backoff: Duration::from_millis(self.retry_max_interval_ms),
            backoff_multiplier: self.retry_multiplier,
            jitter: true,
            max_elapsed: None,
        }
    }

    pub fn member_config(&self) -> MemberConfig {
        MemberConfig {
            poll_timeout: self.heartbeat_interval(),
            commit_policy: self.commit_policy,
            handler_retry: self.handler_retry(),
        }
    }
}
