//! Consumer group member: ordered delivery per partition, commit after ack.
//!
//! ```text
//! Joining -> AwaitingAssignment -> Assigned -> Consuming
//!                 ^                    |           |
//!                 +---- Rebalancing <--+-----------+
//!
//! any live state -> ShuttingDown -> Stopped
//! ```
//!
//! The member drives a single [`GroupConsumer`] from one task. Batches come
//! from one partition in log order and are handled one record at a time, so a
//! record's offset is committed only after the handler returned the [`Acked`]
//! receipt for it. A crash between handling and commit redelivers the record
//! to the next owner of the partition.

use async_trait::async_trait;
use chrono::Utc;
use resilience::{with_retry, RetryConfig, RetryError};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::broker::{ConsumerEvent, GroupConsumer, InboundMessage, TopicPartition};
use crate::codec;
use crate::error::{ErrorKind, HandlerError, StreamError, StreamResult};
use crate::metrics::StreamMetrics;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberState {
    Joining,
    AwaitingAssignment,
    Assigned,
    Consuming,
    Rebalancing,
    ShuttingDown,
    Stopped,
}

impl MemberState {
    pub fn can_transition_to(self, next: MemberState) -> bool {
        use MemberState::*;

        matches!(
            (self, next),
            (Joining, AwaitingAssignment)
                | (AwaitingAssignment, Assigned)
                | (Assigned, Consuming)
                | (Assigned, Rebalancing)
                | (Consuming, Assigned)
                | (Consuming, Rebalancing)
                | (Rebalancing, AwaitingAssignment)
                | (ShuttingDown, Stopped)
        ) || (next == ShuttingDown && !matches!(self, ShuttingDown | Stopped))
    }

    /// Ready means partitions are held and records can flow.
    pub fn is_ready(self) -> bool {
        matches!(self, MemberState::Assigned | MemberState::Consuming)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MemberState::Joining => "joining",
            MemberState::AwaitingAssignment => "awaiting_assignment",
            MemberState::Assigned => "assigned",
            MemberState::Consuming => "consuming",
            MemberState::Rebalancing => "rebalancing",
            MemberState::ShuttingDown => "shutting_down",
            MemberState::Stopped => "stopped",
        }
    }
}

/// When acknowledged offsets are written back to the group.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    /// Commit after every acknowledged record
    #[default]
    PerRecord,
    /// Commit the highest acknowledged offset once per batch
    PerBatch,
}

/// A decoded record handed to a [`RecordHandler`], with its log coordinates.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub record: Record,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl Delivery {
    /// Acknowledge successful processing. Only acknowledged records advance
    /// the committed offset.
    pub fn ack(&self) -> Acked {
        Acked {
            offset: self.offset,
        }
    }
}

/// Receipt proving a delivery was acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub struct Acked {
    offset: i64,
}

/// Processing callback.
///
/// Delivery is at-least-once: the same record can be handed over again after a
/// crash or a rebalance, so side effects must be idempotent.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn handle(&self, delivery: &Delivery) -> Result<Acked, HandlerError>;
}

#[derive(Debug, Clone)]
pub struct MemberConfig {
    /// Longest wait for an event before heartbeating again
    pub poll_timeout: Duration,
    pub commit_policy: CommitPolicy,
    /// Retries of a failing handler before the member stops
    pub handler_retry: RetryConfig,
}

impl Default for MemberConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_secs(3),
            commit_policy: CommitPolicy::PerRecord,
            handler_retry: RetryConfig {
                max_retries: 3,
                ..Default::default()
            },
        }
    }
}

enum BatchOutcome {
    Continue,
    ShutdownRequested,
}

pub struct GroupMember<C: GroupConsumer> {
    consumer: C,
    topic: String,
    config: MemberConfig,
    metrics: Option<StreamMetrics>,
    state: watch::Sender<MemberState>,
    assignment: BTreeSet<TopicPartition>,
}

impl<C: GroupConsumer> GroupMember<C> {
    pub fn new(consumer: C, topic: impl Into<String>, config: MemberConfig) -> Self {
        let (state, _) = watch::channel(MemberState::Joining);
        Self {
            consumer,
            topic: topic.into(),
            config,
            metrics: None,
            state,
            assignment: BTreeSet::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: StreamMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn member_id(&self) -> String {
        self.consumer.member_id()
    }

    pub fn state(&self) -> MemberState {
        *self.state.borrow()
    }

    /// Readiness signal owned by this member; it ends with the member.
    pub fn subscribe_state(&self) -> watch::Receiver<MemberState> {
        self.state.subscribe()
    }

    pub fn assignment(&self) -> Vec<TopicPartition> {
        self.assignment.iter().cloned().collect()
    }

    /// Consume until `shutdown` is cancelled or a fatal error occurs.
    ///
    /// On every exit path the member leaves its group and ends in `Stopped`.
    /// Cancellation lets the record in flight finish, commits it, then leaves.
    pub async fn run<H>(&mut self, handler: &H, shutdown: CancellationToken) -> StreamResult<()>
    where
        H: RecordHandler + ?Sized,
    {
        let result = self.consume(handler, &shutdown).await;

        if let Err(e) = &result {
            error!(member_id = %self.member_id(), error = %e, "Consumer failed, leaving group");
            if let Some(metrics) = &self.metrics {
                metrics.record_error(e.kind());
            }
        }

        self.force_state(MemberState::ShuttingDown);
        let left = self.consumer.leave().await;
        self.assignment.clear();
        self.force_state(MemberState::Stopped);
        info!(member_id = %self.member_id(), "Consumer stopped");

        match (result, left) {
            (Err(e), _) => Err(e),
            (Ok(()), Err(e)) => Err(e),
            (Ok(()), Ok(())) => Ok(()),
        }
    }

    async fn consume<H>(&mut self, handler: &H, shutdown: &CancellationToken) -> StreamResult<()>
    where
        H: RecordHandler + ?Sized,
    {
        self.consumer.subscribe(&self.topic).await?;
        info!(member_id = %self.member_id(), topic = %self.topic, "Joined consumer group");
        self.transition(MemberState::AwaitingAssignment)?;

        loop {
            let event = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, stopping consumption");
                    return Ok(());
                }
                polled = self.consumer.poll(self.config.poll_timeout) => polled?,
            };

            match event {
                None => self.heartbeat().await?,
                Some(ConsumerEvent::Assigned(tps)) => self.on_assigned(tps)?,
                Some(ConsumerEvent::Revoked(tps)) => self.on_revoked(tps)?,
                Some(ConsumerEvent::Messages(batch)) => {
                    if let BatchOutcome::ShutdownRequested =
                        self.process_batch(batch, handler, shutdown).await?
                    {
                        info!("Shutdown requested, stopped after in-flight record");
                        return Ok(());
                    }
                }
            }
        }
    }

    fn on_assigned(&mut self, tps: Vec<TopicPartition>) -> StreamResult<()> {
        info!(member_id = %self.member_id(), partitions = ?tps, "Partitions assigned");
        self.assignment.extend(tps);
        self.transition(MemberState::Assigned)
    }

    fn on_revoked(&mut self, tps: Vec<TopicPartition>) -> StreamResult<()> {
        let lost: Vec<TopicPartition> = tps
            .into_iter()
            .filter(|tp| self.assignment.remove(tp))
            .collect();

        if lost.is_empty() {
            debug!("Revocation for partitions not held, ignoring");
            return Ok(());
        }

        info!(member_id = %self.member_id(), partitions = ?lost, "Partitions revoked");
        if let Some(metrics) = &self.metrics {
            metrics.record_rebalance();
        }

        self.transition(MemberState::Rebalancing)?;
        self.transition(MemberState::AwaitingAssignment)?;
        if !self.assignment.is_empty() {
            self.transition(MemberState::Assigned)?;
        }
        Ok(())
    }

    async fn process_batch<H>(
        &mut self,
        batch: Vec<InboundMessage>,
        handler: &H,
        shutdown: &CancellationToken,
    ) -> StreamResult<BatchOutcome>
    where
        H: RecordHandler + ?Sized,
    {
        let Some(tp) = batch.first().map(InboundMessage::topic_partition) else {
            return Ok(BatchOutcome::Continue);
        };

        if !self.assignment.contains(&tp) {
            warn!(partition = %tp, "Dropping batch for a partition not held");
            return Ok(BatchOutcome::Continue);
        }

        self.transition(MemberState::Consuming)?;

        let mut uncommitted: Option<i64> = None;
        let mut outcome = BatchOutcome::Continue;

        for message in batch {
            if shutdown.is_cancelled() {
                outcome = BatchOutcome::ShutdownRequested;
                break;
            }

            match self.deliver(&message, handler).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::MalformedRecord => {
                    warn!(
                        partition = %tp,
                        offset = message.offset,
                        error = %e,
                        "Skipping malformed record"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_malformed();
                    }
                }
                Err(e) => {
                    if let Some(next_offset) = uncommitted {
                        self.commit(&tp, next_offset).await?;
                    }
                    return Err(e);
                }
            }

            let next_offset = message.offset + 1;
            match self.config.commit_policy {
                CommitPolicy::PerRecord => {
                    if !self.commit(&tp, next_offset).await? {
                        return Ok(BatchOutcome::Continue);
                    }
                }
                CommitPolicy::PerBatch => uncommitted = Some(next_offset),
            }

            self.heartbeat().await?;
        }

        if let Some(next_offset) = uncommitted {
            self.commit(&tp, next_offset).await?;
        }

        Ok(outcome)
    }

    async fn deliver<H>(&self, message: &InboundMessage, handler: &H) -> StreamResult<()>
    where
        H: RecordHandler + ?Sized,
    {
        let record = codec::decode(message.payload.as_deref().unwrap_or_default())?;

        let delivery = Delivery {
            record,
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
        };

        let started = Instant::now();
        let acked = with_retry(&self.config.handler_retry, || handler.handle(&delivery))
            .await
            .map_err(|e| match e {
                RetryError::Permanent(HandlerError::Malformed(reason)) => {
                    StreamError::MalformedRecord(reason)
                }
                other => StreamError::Handler(other.to_string()),
            })?;

        if acked.offset != delivery.offset {
            return Err(StreamError::Handler(format!(
                "handler acknowledged offset {} while processing {}",
                acked.offset, delivery.offset
            )));
        }

        debug!(
            record_id = %delivery.record.id,
            order_key = %delivery.record.order_key,
            partition = delivery.partition,
            offset = delivery.offset,
            "Record processed"
        );

        if let Some(metrics) = &self.metrics {
            metrics.record_consumed(started.elapsed(), delivery.record.lag(Utc::now()));
        }
        Ok(())
    }

    /// Returns `false` when the partition was taken away before the commit.
    async fn commit(&mut self, tp: &TopicPartition, next_offset: i64) -> StreamResult<bool> {
        match self.consumer.commit(tp, next_offset).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_rebalance() => {
                warn!(
                    partition = %tp,
                    offset = next_offset,
                    error = %e,
                    "Commit rejected, abandoning remaining records of partition"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(ErrorKind::RebalanceInterruption);
                }
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    async fn heartbeat(&mut self) -> StreamResult<()> {
        match self.consumer.heartbeat().await {
            Err(e) if e.is_rebalance() => {
                debug!(error = %e, "Heartbeat reported rebalance");
                Ok(())
            }
            other => other,
        }
    }

    fn transition(&self, next: MemberState) -> StreamResult<()> {
        let current = self.state();
        if current == next {
            return Ok(());
        }
        if !current.can_transition_to(next) {
            return Err(StreamError::GroupProtocol(format!(
                "invalid member transition {} -> {}",
                current.as_str(),
                next.as_str()
            )));
        }
        debug!(from = current.as_str(), to = next.as_str(), "Member state change");
        self.state.send_replace(next);
        Ok(())
    }

    fn force_state(&self, next: MemberState) {
        if let Err(e) = self.transition(next) {
            warn!(error = %e, "Forcing member state");
            self.state.send_replace(next);
        }
    }
}
