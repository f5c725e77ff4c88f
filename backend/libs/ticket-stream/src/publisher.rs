//! Keyed publishing with full acknowledgment.

use resilience::{with_retry, RetryConfig, RetryError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::broker::{DeliveryReport, LogProducer, OutboundRecord};
use crate::codec;
use crate::error::{StreamError, StreamResult};
use crate::metrics::StreamMetrics;
use crate::partitioner::{EmptyKeyPolicy, HashPartitioner};
use crate::record::Record;

/// Publishes records to one topic, routing each by its order key.
///
/// `publish` makes a single attempt beyond the client's own retries;
/// `publish_with_retry` adds bounded caller-side backoff for transient
/// failures. Safe to share between tasks.
pub struct Publisher {
    producer: Arc<dyn LogProducer>,
    topic: String,
    partitioner: HashPartitioner,
    partitions: OnceCell<i32>,
    metrics: Option<StreamMetrics>,
}

impl Publisher {
    pub fn new(producer: Arc<dyn LogProducer>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
            partitioner: HashPartitioner::default(),
            partitions: OnceCell::new(),
            metrics: None,
        }
    }

    pub fn with_empty_key_policy(mut self, policy: EmptyKeyPolicy) -> Self {
        self.partitioner = HashPartitioner::new(policy);
        self
    }

    pub fn with_metrics(mut self, metrics: StreamMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub async fn publish(&self, record: &Record) -> StreamResult<DeliveryReport> {
        let result = self.try_publish(record).await;

        match &result {
            Ok(report) => {
                debug!(
                    record_id = %record.id,
                    order_key = %record.order_key,
                    partition = report.partition,
                    offset = report.offset,
                    duplicate = report.duplicate,
                    "Record published"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_produced();
                }
            }
            Err(e) => {
                debug!(record_id = %record.id, error = %e, "Publish attempt failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(e.kind());
                }
            }
        }

        result
    }

    /// Publish, retrying transient broker errors with bounded backoff.
    pub async fn publish_with_retry(
        &self,
        record: &Record,
        retry: &RetryConfig,
    ) -> StreamResult<DeliveryReport> {
        with_retry(retry, || self.publish(record))
            .await
            .map_err(|e| {
                match &e {
                    RetryError::Exhausted { attempts, last } => error!(
                        record_id = %record.id,
                        attempts = attempts,
                        error = %last,
                        "Giving up on record after retries"
                    ),
                    RetryError::Permanent(err) => error!(
                        record_id = %record.id,
                        error = %err,
                        "Record rejected"
                    ),
                }
                e.into_inner()
            })
    }

    pub async fn flush(&self, timeout: Duration) -> StreamResult<()> {
        self.producer.flush(timeout).await
    }

    async fn try_publish(&self, record: &Record) -> StreamResult<DeliveryReport> {
        let payload = codec::encode(record)?;

        let partitions = *self
            .partitions
            .get_or_try_init(|| self.lookup_partitions())
            .await?;
        let partition = self.partitioner.partition_for(&record.order_key, partitions)?;

        let outbound = OutboundRecord {
            key: record.order_key.as_key_bytes().into_owned(),
            payload,
            timestamp: record.created_at,
            idempotency_key: record.id.clone(),
        };

        self.producer.send(&self.topic, partition, outbound).await
    }

    /// Only a positive count is cached; a topic still being created is retried.
    async fn lookup_partitions(&self) -> StreamResult<i32> {
        let count = self.producer.partition_count(&self.topic).await?;
        if count <= 0 {
            return Err(StreamError::BrokerUnavailable(format!(
                "no partitions visible yet for topic {}",
                self.topic
            )));
        }
        Ok(count)
    }
}
