//! Prometheus metrics shared by the publisher and the group member.

use prometheus::{Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use std::time::Duration;
use tracing::warn;

use crate::error::ErrorKind;

const PROCESSING_BUCKETS: [f64; 9] = [0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0];

/// Cheap to clone; clones share the underlying collectors.
#[derive(Clone)]
pub struct StreamMetrics {
    pub messages_produced: IntCounter,
    pub messages_consumed: IntCounter,
    pub errors: IntCounterVec,
    pub malformed_records: IntCounter,
    pub duplicates_skipped: IntCounter,
    pub rebalances: IntCounter,
    pub processing_duration: Histogram,
    pub consumer_lag: Gauge,
}

impl StreamMetrics {
    /// Create the collectors under `namespace` and register them with `registry`.
    ///
    /// Registration failures (e.g. a second instance on the same registry) are
    /// logged; the returned collectors still work but are not exported.
    pub fn new(registry: &Registry, namespace: &str) -> prometheus::Result<Self> {
        let messages_produced = IntCounter::with_opts(
            Opts::new("messages_produced_total", "Total number of messages produced")
                .namespace(namespace),
        )?;
        let messages_consumed = IntCounter::with_opts(
            Opts::new("messages_consumed_total", "Total number of messages consumed")
                .namespace(namespace),
        )?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Total number of errors by kind").namespace(namespace),
            &["kind"],
        )?;
        let malformed_records = IntCounter::with_opts(
            Opts::new(
                "malformed_records_total",
                "Records skipped because they could not be decoded",
            )
            .namespace(namespace),
        )?;
        let duplicates_skipped = IntCounter::with_opts(
            Opts::new(
                "duplicates_skipped_total",
                "Redelivered records acknowledged without reprocessing",
            )
            .namespace(namespace),
        )?;
        let rebalances = IntCounter::with_opts(
            Opts::new("rebalances_total", "Partition revocations observed").namespace(namespace),
        )?;
        let processing_duration = Histogram::with_opts(
            HistogramOpts::new(
                "message_processing_duration_seconds",
                "Time spent processing messages",
            )
            .namespace(namespace)
            .buckets(PROCESSING_BUCKETS.to_vec()),
        )?;
        let consumer_lag = Gauge::with_opts(
            Opts::new(
                "consumer_lag_seconds",
                "Age of the last processed record at processing time",
            )
            .namespace(namespace),
        )?;

        for collector in [
            Box::new(messages_produced.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(messages_consumed.clone()),
            Box::new(errors.clone()),
            Box::new(malformed_records.clone()),
            Box::new(duplicates_skipped.clone()),
            Box::new(rebalances.clone()),
            Box::new(processing_duration.clone()),
            Box::new(consumer_lag.clone()),
        ] {
            if let Err(e) = registry.register(collector) {
                warn!(namespace = namespace, error = %e, "Failed to register stream metric");
            }
        }

        Ok(Self {
            messages_produced,
            messages_consumed,
            errors,
            malformed_records,
            duplicates_skipped,
            rebalances,
            processing_duration,
            consumer_lag,
        })
    }

    /// Register with the process-wide default registry.
    pub fn register_default(namespace: &str) -> prometheus::Result<Self> {
        Self::new(prometheus::default_registry(), namespace)
    }

    pub fn record_produced(&self) {
        self.messages_produced.inc();
    }

    pub fn record_consumed(&self, processing: Duration, lag: Duration) {
        self.messages_consumed.inc();
        self.processing_duration.observe(processing.as_secs_f64());
        self.consumer_lag.set(lag.as_secs_f64());
    }

    pub fn record_error(&self, kind: ErrorKind) {
        self.errors.with_label_values(&[kind.as_str()]).inc();
    }

    pub fn record_malformed(&self) {
        self.malformed_records.inc();
        self.record_error(ErrorKind::MalformedRecord);
    }

    pub fn record_duplicate(&self) {
        self.duplicates_skipped.inc();
    }

    pub fn record_rebalance(&self) {
        self.rebalances.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_exported_under_namespace() {
        let registry = Registry::new();
        let metrics = StreamMetrics::new(&registry, "ticket_processor").unwrap();

        metrics.record_produced();
        metrics.record_consumed(Duration::from_millis(3), Duration::from_millis(1500));
        metrics.record_malformed();

        let names: Vec<String> = registry
            .gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect();

        for expected in [
            "ticket_processor_messages_produced_total",
            "ticket_processor_messages_consumed_total",
            "ticket_processor_errors_total",
            "ticket_processor_malformed_records_total",
            "ticket_processor_message_processing_duration_seconds",
            "ticket_processor_consumer_lag_seconds",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {}", expected);
        }

        assert_eq!(metrics.messages_produced.get(), 1);
        assert_eq!(metrics.messages_consumed.get(), 1);
        assert_eq!(
            metrics
                .errors
                .with_label_values(&[ErrorKind::MalformedRecord.as_str()])
                .get(),
            1
        );
        assert!((metrics.consumer_lag.get() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_double_registration_does_not_fail() {
        let registry = Registry::new();
        let first = StreamMetrics::new(&registry, "dup").unwrap();
        let second = StreamMetrics::new(&registry, "dup").unwrap();

        second.record_produced();
        assert_eq!(first.messages_produced.get(), 0);
        assert_eq!(second.messages_produced.get(), 1);
    }

    #[test]
    fn test_invalid_namespace_is_an_error() {
        let registry = Registry::new();
        assert!(StreamMetrics::new(&registry, "not a namespace").is_err());
    }
}
