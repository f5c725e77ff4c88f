//! Reconnecting consume loop.
//!
//! Every attempt builds a new consumer and a new [`GroupMember`], and installs
//! that member's state as the readiness source. Attempts that end in a
//! transient broker error or a lost membership are retried with backoff;
//! anything else is returned to the caller. An attempt that got as far as
//! holding partitions resets the failure count.

use resilience::RetryConfig;
use ticket_stream::{
    GroupConsumer, GroupMember, MemberConfig, RecordHandler, StreamMetrics, StreamResult,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::monitoring::{Readiness, ReadinessProbe};

pub struct ConsumerLoop<'a> {
    pub topic: &'a str,
    pub member: MemberConfig,
    pub backoff: RetryConfig,
    pub readiness: ReadinessProbe,
    pub metrics: Option<StreamMetrics>,
}

impl ConsumerLoop<'_> {
    /// Consume with consumers from `connect` until `shutdown` is cancelled.
    pub async fn run<C, F, H>(
        &self,
        mut connect: F,
        handler: &H,
        shutdown: CancellationToken,
    ) -> StreamResult<()>
    where
        C: GroupConsumer,
        F: FnMut() -> StreamResult<C>,
        H: RecordHandler + ?Sized,
    {
        let mut failures: u32 = 0;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let (result, was_ready) = match connect() {
                Ok(consumer) => self.attempt(consumer, handler, &shutdown).await,
                Err(e) => (Err(e), false),
            };

            let err = match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() || e.is_rebalance() => e,
                Err(e) => {
                    error!(error = %e, "Consumer stopped on non-recoverable error");
                    return Err(e);
                }
            };

            if was_ready {
                failures = 0;
            }
            failures += 1;
            if failures > self.backoff.max_retries {
                error!(attempts = failures, error = %err, "Giving up on consumer");
                return Err(err);
            }

            let delay = self.backoff.backoff_for(failures);
            warn!(
                attempt = failures,
                error = %err,
                "Consumer attempt failed, reconnecting in {:?}",
                delay
            );

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    async fn attempt<C, H>(
        &self,
        consumer: C,
        handler: &H,
        shutdown: &CancellationToken,
    ) -> (StreamResult<()>, bool)
    where
        C: GroupConsumer,
        H: RecordHandler + ?Sized,
    {
        let mut member = GroupMember::new(consumer, self.topic, self.member.clone());
        if let Some(metrics) = &self.metrics {
            member = member.with_metrics(metrics.clone());
        }

        info!(member_id = %member.member_id(), topic = self.topic, "Starting group member");
        let mut state = member.subscribe_state();
        self.readiness.set(Readiness::Member(member.subscribe_state()));

        let run = member.run(handler, shutdown.clone());
        tokio::pin!(run);

        let became_ready = async { state.wait_for(|s| s.is_ready()).await.is_ok() };

        let mut was_ready = false;
        let result = tokio::select! {
            result = &mut run => result,
            ready = became_ready => {
                was_ready = ready;
                run.await
            }
        };

        self.readiness.set(Readiness::NotReady);
        (result, was_ready)
    }
}
