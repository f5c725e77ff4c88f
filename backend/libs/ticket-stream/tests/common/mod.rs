//! Shared fixtures for the ticket-stream contract tests.
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use resilience::RetryConfig;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use ticket_stream::{
    Acked, CommitPolicy, ConsumerEvent, Delivery, GroupConsumer, HandlerError, InMemoryBroker,
    InMemoryConfig, MemberConfig, Record, RecordHandler, StreamResult, TopicPartition,
};

pub const TOPIC: &str = "tickets";
pub const GROUP: &str = "ticket-processor";

pub fn broker(partitions: i32, session_timeout: Duration) -> InMemoryBroker {
    let broker = InMemoryBroker::new(InMemoryConfig {
        session_timeout,
        ..Default::default()
    });
    broker
        .create_topic(TOPIC, partitions)
        .expect("topic created");
    broker
}

pub fn member_config(commit_policy: CommitPolicy) -> MemberConfig {
    MemberConfig {
        poll_timeout: Duration::from_millis(20),
        commit_policy,
        handler_retry: RetryConfig {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            jitter: false,
            ..Default::default()
        },
    }
}

/// Poll `condition` every 10ms, panicking after `timeout`.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[derive(Debug, Clone)]
pub struct Seen {
    pub member: String,
    pub partition: i32,
    pub offset: i64,
    pub record: Record,
}

/// Handler that appends every delivery to a log shared between members.
#[derive(Clone)]
pub struct Recorder {
    name: String,
    log: Arc<Mutex<Vec<Seen>>>,
    delay: Duration,
}

impl Recorder {
    pub fn new(name: &str, log: Arc<Mutex<Vec<Seen>>>) -> Self {
        Self {
            name: name.to_string(),
            log,
            delay: Duration::ZERO,
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl RecordHandler for Recorder {
    async fn handle(&self, delivery: &Delivery) -> Result<Acked, HandlerError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.log.lock().push(Seen {
            member: self.name.clone(),
            partition: delivery.partition,
            offset: delivery.offset,
            record: delivery.record.clone(),
        });
        Ok(delivery.ack())
    }
}

pub fn distinct_ids(log: &Mutex<Vec<Seen>>) -> usize {
    log.lock()
        .iter()
        .map(|seen| seen.record.id.clone())
        .collect::<BTreeSet<_>>()
        .len()
}

/// What the recording consumers observed, across all members.
#[derive(Default, Debug)]
pub struct Ledger {
    pub owners: HashMap<i32, String>,
    pub high_water: HashMap<i32, i64>,
    pub violations: Vec<String>,
}

/// Wraps a consumer and checks ownership and commit invariants as events flow.
pub struct RecordingConsumer<C> {
    inner: C,
    name: String,
    ledger: Arc<Mutex<Ledger>>,
}

impl<C: GroupConsumer> RecordingConsumer<C> {
    pub fn new(inner: C, ledger: Arc<Mutex<Ledger>>) -> Self {
        let name = inner.member_id();
        Self {
            inner,
            name,
            ledger,
        }
    }
}

#[async_trait]
impl<C: GroupConsumer> GroupConsumer for RecordingConsumer<C> {
    fn member_id(&self) -> String {
        self.name.clone()
    }

    async fn subscribe(&mut self, topic: &str) -> StreamResult<()> {
        self.inner.subscribe(topic).await
    }

    async fn poll(&mut self, timeout: Duration) -> StreamResult<Option<ConsumerEvent>> {
        let event = self.inner.poll(timeout).await?;
        let mut ledger = self.ledger.lock();

        match &event {
            Some(ConsumerEvent::Assigned(tps)) => {
                for tp in tps {
                    if let Some(owner) = ledger.owners.get(&tp.partition) {
                        if owner != &self.name {
                            let message =
                                format!("{} assigned to {} while owned by {}", tp, self.name, owner);
                            ledger.violations.push(message);
                        }
                    }
                    ledger.owners.insert(tp.partition, self.name.clone());
                }
            }
            Some(ConsumerEvent::Revoked(tps)) => {
                for tp in tps {
                    if ledger.owners.get(&tp.partition) == Some(&self.name) {
                        ledger.owners.remove(&tp.partition);
                    }
                }
            }
            Some(ConsumerEvent::Messages(batch)) => {
                if let Some(first) = batch.first() {
                    if ledger.owners.get(&first.partition) != Some(&self.name) {
                        let message = format!(
                            "{} received partition {} it does not own",
                            self.name, first.partition
                        );
                        ledger.violations.push(message);
                    }
                }
            }
            None => {}
        }

        Ok(event)
    }

    async fn heartbeat(&mut self) -> StreamResult<()> {
        self.inner.heartbeat().await
    }

    async fn commit(&mut self, tp: &TopicPartition, next_offset: i64) -> StreamResult<()> {
        self.inner.commit(tp, next_offset).await?;

        let mut ledger = self.ledger.lock();
        let previous = ledger.high_water.get(&tp.partition).copied().unwrap_or(0);
        if next_offset < previous {
            let message = format!(
                "{} committed {} on {} below {}",
                self.name, next_offset, tp, previous
            );
            ledger.violations.push(message);
        } else {
            ledger.high_water.insert(tp.partition, next_offset);
        }
        Ok(())
    }

    async fn leave(&mut self) -> StreamResult<()> {
        self.inner.leave().await?;
        let mut ledger = self.ledger.lock();
        let name = self.name.clone();
        ledger.owners.retain(|_, owner| owner != &name);
        Ok(())
    }
}
