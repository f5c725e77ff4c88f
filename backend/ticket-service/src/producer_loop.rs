//! Rate-limited ticket generator.
//!
//! One ticket per tick. The counter that numbers tickets only advances once a
//! ticket is durably published, so a failed publish is followed by a fresh
//! ticket for the same order on the next tick.

use resilience::RetryConfig;
use std::time::Duration;
use ticket_stream::Publisher;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::ticket::Ticket;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProducerStats {
    pub published: u64,
    pub failed: u64,
}

/// Order id of the `counter`-th ticket.
pub fn order_id_for(counter: i64, cardinality: Option<i64>) -> i64 {
    match cardinality {
        Some(n) if n > 0 => counter % n,
        _ => counter,
    }
}

/// Generate and publish tickets every `interval` until `shutdown` is cancelled.
pub async fn run(
    publisher: &Publisher,
    retry: &RetryConfig,
    interval: Duration,
    cardinality: Option<i64>,
    shutdown: CancellationToken,
) -> ProducerStats {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut counter: i64 = 0;
    let mut stats = ProducerStats::default();

    info!(topic = publisher.topic(), interval = ?interval, "Producer loop started");

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let ticket = Ticket::new(
            order_id_for(counter, cardinality),
            format!("Ticket #{}", counter),
        );
        let record = match ticket.to_record() {
            Ok(record) => record,
            Err(e) => {
                error!(ticket_id = %ticket.id, error = %e, "Failed to encode ticket");
                stats.failed += 1;
                continue;
            }
        };

        match publisher.publish_with_retry(&record, retry).await {
            Ok(report) => {
                debug!(
                    ticket_id = %ticket.id,
                    order_id = ticket.order_id,
                    partition = report.partition,
                    offset = report.offset,
                    "Ticket published"
                );
                counter += 1;
                stats.published += 1;
            }
            Err(e) => {
                debug!(ticket_id = %ticket.id, error = %e, "Ticket not published");
                stats.failed += 1;
            }
        }
    }

    info!(
        published = stats.published,
        failed = stats.failed,
        "Producer loop stopped"
    );
    stats
}
