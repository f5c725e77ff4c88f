//! Idempotent handler wrapper.
//!
//! Remembers the ids of records it has seen acknowledged, so a redelivery after
//! a crash or rebalance is acknowledged again without re-running side effects.
//! The memory is bounded and time-limited, and local to the process: it narrows
//! the duplicate window but does not replace idempotent side effects.

use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use tracing::debug;

use crate::error::HandlerError;
use crate::member::{Acked, Delivery, RecordHandler};
use crate::metrics::StreamMetrics;

const DEFAULT_CAPACITY: u64 = 100_000;
const DEFAULT_TTL: Duration = Duration::from_secs(3600);

pub struct IdempotentHandler<H> {
    inner: H,
    processed: Cache<String, ()>,
    metrics: Option<StreamMetrics>,
}

impl<H: RecordHandler> IdempotentHandler<H> {
    pub fn new(inner: H) -> Self {
        Self::with_capacity(inner, DEFAULT_CAPACITY, DEFAULT_TTL)
    }

    pub fn with_capacity(inner: H, max_capacity: u64, ttl: Duration) -> Self {
        Self {
            inner,
            processed: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(ttl)
                .build(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: StreamMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &H {
        &self.inner
    }
}

#[async_trait]
impl<H: RecordHandler> RecordHandler for IdempotentHandler<H> {
    async fn handle(&self, delivery: &Delivery) -> Result<Acked, HandlerError> {
        if self.processed.contains_key(&delivery.record.id) {
            debug!(
                record_id = %delivery.record.id,
                partition = delivery.partition,
                offset = delivery.offset,
                "Duplicate delivery, acknowledging without processing"
            );
            if let Some(metrics) = &self.metrics {
                metrics.record_duplicate();
            }
            return Ok(delivery.ack());
        }

        let acked = self.inner.handle(delivery).await?;
        self.processed.insert(delivery.record.id.clone(), ()).await;
        Ok(acked)
    }
}
