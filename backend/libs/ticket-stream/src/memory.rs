//! In-process broker implementing both broker seams.
//!
//! Topics are vectors of partitions, partitions are append-only vectors of
//! messages. A single coordinator per group hands partitions out round-robin
//! over the sorted member ids. Reassignment is two-phase: the current owner is
//! sent `Revoked` first, and the partition is only handed to its new owner
//! once the old owner has consumed that event, left or timed out. Commits are
//! fenced on ownership and never move backwards.
//!
//! Producer sessions are idempotent: a resend carrying an idempotence token
//! already appended by the same producer within the dedup window returns the
//! original offset instead of appending again. A new producer starts a new
//! session and gets no such protection.
//!
//! Dropping a consumer without calling `leave` behaves like a crashed process:
//! its partitions stay owned until its session times out.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::broker::{
    ConsumerEvent, DeliveryReport, GroupConsumer, InboundMessage, LogProducer, OutboundRecord,
    TopicPartition,
};
use crate::error::{StreamError, StreamResult};

#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Members not seen for this long are evicted
    pub session_timeout: Duration,
    /// Per-partition lookback for producer dedup
    pub idempotence_window: usize,
    /// Upper bound on a `Messages` batch
    pub max_poll_records: usize,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(10),
            idempotence_window: 1000,
            max_poll_records: 500,
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<BrokerState>,
    notify: Notify,
    config: InMemoryConfig,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, Vec<Vec<StoredMessage>>>,
    groups: HashMap<String, GroupState>,
    failing_sends: u32,
    next_producer_id: u64,
    next_member_seq: u64,
}

struct StoredMessage {
    key: Vec<u8>,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
    producer_id: u64,
    idempotency_key: String,
}

impl StoredMessage {
    fn to_inbound(&self, topic: &str, partition: i32, offset: i64) -> InboundMessage {
        InboundMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key: Some(self.key.clone()),
            payload: Some(self.payload.clone()),
            timestamp: Some(self.timestamp),
        }
    }
}

struct MemberSlot {
    last_seen: Instant,
    events: VecDeque<ConsumerEvent>,
    revoking: BTreeSet<i32>,
    /// Assigned partitions and their fetch position
    positions: BTreeMap<i32, i64>,
    cursor: usize,
}

impl MemberSlot {
    fn new(now: Instant) -> Self {
        Self {
            last_seen: now,
            events: VecDeque::new(),
            revoking: BTreeSet::new(),
            positions: BTreeMap::new(),
            cursor: 0,
        }
    }
}

struct GroupState {
    id: String,
    topic: String,
    members: BTreeMap<String, MemberSlot>,
    owners: BTreeMap<i32, String>,
    committed: HashMap<i32, i64>,
}

impl GroupState {
    fn new(id: &str, topic: &str) -> Self {
        Self {
            id: id.to_string(),
            topic: topic.to_string(),
            members: BTreeMap::new(),
            owners: BTreeMap::new(),
            committed: HashMap::new(),
        }
    }

    /// Move ownership toward the round-robin target of the current member set.
    fn reconcile(&mut self, partitions: i32) {
        let ids: Vec<String> = self.members.keys().cloned().collect();
        if ids.is_empty() {
            return;
        }

        let mut assigned: BTreeMap<String, Vec<TopicPartition>> = BTreeMap::new();
        let mut revoked: BTreeMap<String, Vec<TopicPartition>> = BTreeMap::new();

        for partition in 0..partitions {
            let target = &ids[partition as usize % ids.len()];
            match self.owners.get(&partition) {
                Some(owner) if owner == target => {}
                Some(owner) => {
                    let owner = owner.clone();
                    if let Some(slot) = self.members.get_mut(&owner) {
                        if slot.revoking.insert(partition) {
                            revoked
                                .entry(owner)
                                .or_default()
                                .push(TopicPartition::new(self.topic.clone(), partition));
                        }
                    }
                }
                None => {
                    let start = self.committed.get(&partition).copied().unwrap_or(0);
                    self.owners.insert(partition, target.clone());
                    if let Some(slot) = self.members.get_mut(target) {
                        slot.positions.insert(partition, start);
                    }
                    assigned
                        .entry(target.clone())
                        .or_default()
                        .push(TopicPartition::new(self.topic.clone(), partition));
                }
            }
        }

        for (member_id, tps) in revoked {
            debug!(group_id = %self.id, member_id = %member_id, partitions = ?tps, "Revoking partitions");
            if let Some(slot) = self.members.get_mut(&member_id) {
                slot.events.push_back(ConsumerEvent::Revoked(tps));
            }
        }
        for (member_id, tps) in assigned {
            debug!(group_id = %self.id, member_id = %member_id, partitions = ?tps, "Assigning partitions");
            if let Some(slot) = self.members.get_mut(&member_id) {
                slot.events.push_back(ConsumerEvent::Assigned(tps));
            }
        }
    }

    fn release(&mut self, member_id: &str, partitions: &[i32]) {
        for partition in partitions {
            if self.owners.get(partition).map(String::as_str) == Some(member_id) {
                self.owners.remove(partition);
            }
            if let Some(slot) = self.members.get_mut(member_id) {
                slot.revoking.remove(partition);
                slot.positions.remove(partition);
            }
        }
    }

    fn remove_member(&mut self, member_id: &str) {
        self.members.remove(member_id);
        self.owners.retain(|_, owner| owner != member_id);
    }

    fn expire(&mut self, now: Instant, session_timeout: Duration, partitions: i32) -> bool {
        let expired: Vec<String> = self
            .members
            .iter()
            .filter(|(_, slot)| now.duration_since(slot.last_seen) > session_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        if expired.is_empty() {
            return false;
        }

        for member_id in &expired {
            warn!(group_id = %self.id, member_id = %member_id, "Session timed out, evicting member");
            self.remove_member(member_id);
        }
        self.reconcile(partitions);
        true
    }

    fn commit(
        &mut self,
        member_id: &str,
        tp: &TopicPartition,
        next_offset: i64,
        now: Instant,
    ) -> StreamResult<()> {
        let slot = self.members.get_mut(member_id).ok_or_else(|| {
            StreamError::RebalanceInterruption(format!(
                "member {} is no longer part of group {}",
                member_id, self.id
            ))
        })?;
        slot.last_seen = now;

        if self.owners.get(&tp.partition).map(String::as_str) != Some(member_id) {
            return Err(StreamError::RebalanceInterruption(format!(
                "{} is not owned by {}",
                tp, member_id
            )));
        }

        let committed = self.committed.entry(tp.partition).or_insert(0);
        if next_offset < *committed {
            debug!(
                group_id = %self.id,
                partition = tp.partition,
                committed = *committed,
                requested = next_offset,
                "Ignoring stale commit"
            );
            return Ok(());
        }
        *committed = next_offset;
        Ok(())
    }
}

fn unknown_topic(topic: &str) -> StreamError {
    StreamError::Config(format!("unknown topic {}", topic))
}

impl InMemoryBroker {
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
                config,
            }),
        }
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) -> StreamResult<()> {
        if partitions <= 0 {
            return Err(StreamError::Config(format!(
                "topic {} needs at least one partition",
                topic
            )));
        }
        let mut state = self.inner.state.lock();
        state
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| (0..partitions).map(|_| Vec::new()).collect());
        Ok(())
    }

    /// A new producer session.
    pub fn producer(&self) -> InMemoryProducer {
        let mut state = self.inner.state.lock();
        state.next_producer_id += 1;
        InMemoryProducer {
            inner: Arc::clone(&self.inner),
            producer_id: state.next_producer_id,
        }
    }

    /// A new, not yet subscribed, member of `group_id`.
    pub fn consumer(&self, group_id: &str) -> InMemoryConsumer {
        let mut state = self.inner.state.lock();
        state.next_member_seq += 1;
        InMemoryConsumer {
            inner: Arc::clone(&self.inner),
            group_id: group_id.to_string(),
            member_id: format!("{}-member-{}", group_id, state.next_member_seq),
            topic: None,
            assigned: BTreeSet::new(),
        }
    }

    /// Make the next `count` sends fail with `BrokerUnavailable`.
    pub fn fail_next_sends(&self, count: u32) {
        self.inner.state.lock().failing_sends = count;
    }

    /// Append bytes as-is, bypassing the producer path.
    pub fn append_raw(
        &self,
        topic: &str,
        partition: i32,
        key: &[u8],
        payload: &[u8],
    ) -> StreamResult<i64> {
        let offset = {
            let mut state = self.inner.state.lock();
            let log = state
                .topics
                .get_mut(topic)
                .and_then(|partitions| partitions.get_mut(partition as usize))
                .ok_or_else(|| unknown_topic(topic))?;
            log.push(StoredMessage {
                key: key.to_vec(),
                payload: payload.to_vec(),
                timestamp: Utc::now(),
                producer_id: 0,
                idempotency_key: String::new(),
            });
            (log.len() - 1) as i64
        };
        self.inner.notify.notify_waiters();
        Ok(offset)
    }

    pub fn messages(&self, topic: &str, partition: i32) -> Vec<InboundMessage> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map(|log| {
                log.iter()
                    .enumerate()
                    .map(|(offset, m)| m.to_inbound(topic, partition, offset as i64))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn committed(&self, group_id: &str, tp: &TopicPartition) -> Option<i64> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .and_then(|group| group.committed.get(&tp.partition).copied())
    }

    pub fn owner_of(&self, group_id: &str, tp: &TopicPartition) -> Option<String> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .and_then(|group| group.owners.get(&tp.partition).cloned())
    }

    /// Coordinator view: member id to owned partitions.
    pub fn assignments(&self, group_id: &str) -> BTreeMap<String, Vec<i32>> {
        let state = self.inner.state.lock();
        let mut out: BTreeMap<String, Vec<i32>> = BTreeMap::new();
        if let Some(group) = state.groups.get(group_id) {
            for (partition, owner) in &group.owners {
                out.entry(owner.clone()).or_default().push(*partition);
            }
        }
        out
    }

    pub fn members(&self, group_id: &str) -> Vec<String> {
        let state = self.inner.state.lock();
        state
            .groups
            .get(group_id)
            .map(|group| group.members.keys().cloned().collect())
            .unwrap_or_default()
    }
}

pub struct InMemoryProducer {
    inner: Arc<Inner>,
    producer_id: u64,
}

#[async_trait]
impl LogProducer for InMemoryProducer {
    async fn partition_count(&self, topic: &str) -> StreamResult<i32> {
        let state = self.inner.state.lock();
        state
            .topics
            .get(topic)
            .map(|partitions| partitions.len() as i32)
            .ok_or_else(|| unknown_topic(topic))
    }

    async fn send(
        &self,
        topic: &str,
        partition: i32,
        record: OutboundRecord,
    ) -> StreamResult<DeliveryReport> {
        let report = {
            let mut state = self.inner.state.lock();
            if state.failing_sends > 0 {
                state.failing_sends -= 1;
                return Err(StreamError::BrokerUnavailable(
                    "injected send failure".to_string(),
                ));
            }

            let log = state
                .topics
                .get_mut(topic)
                .ok_or_else(|| unknown_topic(topic))?
                .get_mut(partition as usize)
                .ok_or_else(|| {
                    StreamError::Config(format!("{} has no partition {}", topic, partition))
                })?;

            let window_start = log.len().saturating_sub(self.inner.config.idempotence_window);
            let previous = log[window_start..].iter().position(|m| {
                m.producer_id == self.producer_id && m.idempotency_key == record.idempotency_key
            });

            if let Some(index) = previous {
                return Ok(DeliveryReport {
                    partition,
                    offset: (window_start + index) as i64,
                    duplicate: true,
                });
            }

            log.push(StoredMessage {
                key: record.key,
                payload: record.payload,
                timestamp: record.timestamp,
                producer_id: self.producer_id,
                idempotency_key: record.idempotency_key,
            });

            DeliveryReport {
                partition,
                offset: (log.len() - 1) as i64,
                duplicate: false,
            }
        };

        self.inner.notify.notify_waiters();
        Ok(report)
    }

    async fn flush(&self, _timeout: Duration) -> StreamResult<()> {
        Ok(())
    }
}

pub struct InMemoryConsumer {
    inner: Arc<Inner>,
    group_id: String,
    member_id: String,
    topic: Option<String>,
    /// Partitions this handle has reported as assigned and not yet revoked
    assigned: BTreeSet<TopicPartition>,
}

impl InMemoryConsumer {
    fn try_poll(&mut self) -> StreamResult<Option<ConsumerEvent>> {
        let topic = self
            .topic
            .clone()
            .ok_or_else(|| StreamError::GroupProtocol("poll before subscribe".to_string()))?;
        let now = Instant::now();
        let inner = Arc::clone(&self.inner);

        let (event, changed) = {
            let mut state = inner.state.lock();
            let BrokerState { topics, groups, .. } = &mut *state;
            let log = topics.get(&topic).ok_or_else(|| unknown_topic(&topic))?;
            let partitions = log.len() as i32;
            let group = groups.get_mut(&self.group_id).ok_or_else(|| {
                StreamError::GroupProtocol(format!("unknown group {}", self.group_id))
            })?;

            let mut changed = group.expire(now, inner.config.session_timeout, partitions);

            if !group.members.contains_key(&self.member_id) {
                warn!(member_id = %self.member_id, "Member was evicted, rejoining group");
                group
                    .members
                    .insert(self.member_id.clone(), MemberSlot::new(now));
                group.reconcile(partitions);
                changed = true;

                if !self.assigned.is_empty() {
                    let lost: Vec<TopicPartition> =
                        std::mem::take(&mut self.assigned).into_iter().collect();
                    (Some(ConsumerEvent::Revoked(lost)), changed)
                } else {
                    (None, changed)
                }
            } else {
                self.next_event(group, log, &topic, partitions, now, changed)
            }
        };

        if changed {
            inner.notify.notify_waiters();
        }
        Ok(event)
    }

    fn next_event(
        &mut self,
        group: &mut GroupState,
        log: &[Vec<StoredMessage>],
        topic: &str,
        partitions: i32,
        now: Instant,
        mut changed: bool,
    ) -> (Option<ConsumerEvent>, bool) {
        let Some(slot) = group.members.get_mut(&self.member_id) else {
            return (None, changed);
        };
        slot.last_seen = now;

        if let Some(event) = slot.events.pop_front() {
            match &event {
                ConsumerEvent::Revoked(tps) => {
                    let released: Vec<i32> = tps.iter().map(|tp| tp.partition).collect();
                    group.release(&self.member_id, &released);
                    group.reconcile(partitions);
                    changed = true;
                    for tp in tps {
                        self.assigned.remove(tp);
                    }
                }
                ConsumerEvent::Assigned(tps) => self.assigned.extend(tps.iter().cloned()),
                ConsumerEvent::Messages(_) => {}
            }
            return (Some(event), changed);
        }

        let candidates: Vec<i32> = slot
            .positions
            .keys()
            .copied()
            .filter(|p| !slot.revoking.contains(p))
            .collect();

        for step in 0..candidates.len() {
            let index = (slot.cursor + step) % candidates.len();
            let partition = candidates[index];
            let position = slot.positions.get(&partition).copied().unwrap_or(0) as usize;
            let messages = match log.get(partition as usize) {
                Some(messages) => messages,
                None => continue,
            };
            if position >= messages.len() {
                continue;
            }

            let end = (position + self.inner.config.max_poll_records).min(messages.len());
            let batch = messages[position..end]
                .iter()
                .enumerate()
                .map(|(i, m)| m.to_inbound(topic, partition, (position + i) as i64))
                .collect();

            slot.positions.insert(partition, end as i64);
            slot.cursor = index + 1;
            return (Some(ConsumerEvent::Messages(batch)), changed);
        }

        (None, changed)
    }
}

#[async_trait]
impl GroupConsumer for InMemoryConsumer {
    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    async fn subscribe(&mut self, topic: &str) -> StreamResult<()> {
        match self.topic.as_deref() {
            Some(current) if current == topic => return Ok(()),
            Some(current) => {
                return Err(StreamError::GroupProtocol(format!(
                    "already subscribed to {}",
                    current
                )))
            }
            None => {}
        }

        let now = Instant::now();
        {
            let mut state = self.inner.state.lock();
            let BrokerState { topics, groups, .. } = &mut *state;
            let partitions = topics
                .get(topic)
                .map(|log| log.len() as i32)
                .ok_or_else(|| unknown_topic(topic))?;

            let group = groups
                .entry(self.group_id.clone())
                .or_insert_with(|| GroupState::new(&self.group_id, topic));
            if group.topic != topic {
                return Err(StreamError::GroupProtocol(format!(
                    "group {} consumes {}, not {}",
                    self.group_id, group.topic, topic
                )));
            }

            group.expire(now, self.inner.config.session_timeout, partitions);
            group
                .members
                .insert(self.member_id.clone(), MemberSlot::new(now));
            group.reconcile(partitions);
        }

        self.topic = Some(topic.to_string());
        self.inner.notify.notify_waiters();
        info!(group_id = %self.group_id, member_id = %self.member_id, topic = topic, "Joined group");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> StreamResult<Option<ConsumerEvent>> {
        let deadline = Instant::now() + timeout;
        let inner = Arc::clone(&self.inner);
        // Wake up often enough to keep the session alive while idle.
        let keepalive = inner.config.session_timeout / 3;

        loop {
            let notified = inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(event) = self.try_poll()? {
                return Ok(Some(event));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }

            let wake_at = deadline.min(now + keepalive);
            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn heartbeat(&mut self) -> StreamResult<()> {
        let now = Instant::now();
        let changed = {
            let mut state = self.inner.state.lock();
            let BrokerState { topics, groups, .. } = &mut *state;
            let Some(group) = groups.get_mut(&self.group_id) else {
                return Ok(());
            };
            let partitions = topics.get(&group.topic).map(|log| log.len() as i32).unwrap_or(0);
            let changed = group.expire(now, self.inner.config.session_timeout, partitions);

            match group.members.get_mut(&self.member_id) {
                Some(slot) => slot.last_seen = now,
                None if self.topic.is_some() => {
                    return Err(StreamError::RebalanceInterruption(format!(
                        "member {} was evicted from group {}",
                        self.member_id, self.group_id
                    )));
                }
                None => {}
            }
            changed
        };

        if changed {
            self.inner.notify.notify_waiters();
        }
        Ok(())
    }

    async fn commit(&mut self, tp: &TopicPartition, next_offset: i64) -> StreamResult<()> {
        let now = Instant::now();
        let (result, changed) = {
            let mut state = self.inner.state.lock();
            let BrokerState { topics, groups, .. } = &mut *state;
            let partitions = topics
                .get(&tp.topic)
                .map(|log| log.len() as i32)
                .ok_or_else(|| unknown_topic(&tp.topic))?;
            let group = groups.get_mut(&self.group_id).ok_or_else(|| {
                StreamError::GroupProtocol(format!("unknown group {}", self.group_id))
            })?;

            let changed = group.expire(now, self.inner.config.session_timeout, partitions);
            (group.commit(&self.member_id, tp, next_offset, now), changed)
        };

        if changed {
            self.inner.notify.notify_waiters();
        }
        result
    }

    async fn leave(&mut self) -> StreamResult<()> {
        {
            let mut state = self.inner.state.lock();
            let BrokerState { topics, groups, .. } = &mut *state;
            if let Some(group) = groups.get_mut(&self.group_id) {
                let partitions = topics.get(&group.topic).map(|log| log.len() as i32).unwrap_or(0);
                group.remove_member(&self.member_id);
                group.reconcile(partitions);
            }
        }

        self.assigned.clear();
        self.topic = None;
        self.inner.notify.notify_waiters();
        info!(group_id = %self.group_id, member_id = %self.member_id, "Left group");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TOPIC: &str = "tickets";
    const GROUP: &str = "ticket-processor";

    fn outbound(id: &str, payload: &str) -> OutboundRecord {
        OutboundRecord {
            key: b"k".to_vec(),
            payload: payload.as_bytes().to_vec(),
            timestamp: Utc::now(),
            idempotency_key: id.to_string(),
        }
    }

    fn broker(partitions: i32) -> InMemoryBroker {
        let broker = InMemoryBroker::new(InMemoryConfig {
            session_timeout: Duration::from_millis(200),
            ..Default::default()
        });
        broker.create_topic(TOPIC, partitions).unwrap();
        broker
    }

    async fn next_event(consumer: &mut InMemoryConsumer) -> ConsumerEvent {
        consumer
            .poll(Duration::from_millis(500))
            .await
            .unwrap()
            .expect("event within timeout")
    }

    #[tokio::test]
    async fn test_send_appends_in_order() {
        let broker = broker(2);
        let producer = broker.producer();

        for i in 0..3 {
            let report = producer
                .send(TOPIC, 1, outbound(&format!("id-{}", i), "x"))
                .await
                .unwrap();
            assert_eq!(report.offset, i);
            assert!(!report.duplicate);
        }

        assert_eq!(broker.messages(TOPIC, 1).len(), 3);
        assert!(broker.messages(TOPIC, 0).is_empty());
        assert_eq!(producer.partition_count(TOPIC).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_resend_within_session_is_deduplicated() {
        let broker = broker(1);
        let producer = broker.producer();

        let first = producer.send(TOPIC, 0, outbound("same", "a")).await.unwrap();
        let again = producer.send(TOPIC, 0, outbound("same", "a")).await.unwrap();

        assert_eq!(first.offset, again.offset);
        assert!(again.duplicate);
        assert_eq!(broker.messages(TOPIC, 0).len(), 1);

        // A different session has its own sequence space.
        let other = broker.producer();
        let report = other.send(TOPIC, 0, outbound("same", "a")).await.unwrap();
        assert!(!report.duplicate);
        assert_eq!(broker.messages(TOPIC, 0).len(), 2);
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let broker = broker(1);
        let producer = broker.producer();
        broker.fail_next_sends(2);

        for _ in 0..2 {
            let err = producer.send(TOPIC, 0, outbound("a", "a")).await.unwrap_err();
            assert!(err.is_transient());
        }
        assert!(producer.send(TOPIC, 0, outbound("a", "a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_topic_and_partition() {
        let broker = broker(1);
        let producer = broker.producer();

        assert!(matches!(
            producer.partition_count("nope").await,
            Err(StreamError::Config(_))
        ));
        assert!(matches!(
            producer.send(TOPIC, 3, outbound("a", "a")).await,
            Err(StreamError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_single_member_gets_everything_then_messages() {
        let broker = broker(2);
        broker.append_raw(TOPIC, 0, b"k", b"p0").unwrap();
        broker.append_raw(TOPIC, 1, b"k", b"p1").unwrap();

        let mut consumer = broker.consumer(GROUP);
        consumer.subscribe(TOPIC).await.unwrap();

        match next_event(&mut consumer).await {
            ConsumerEvent::Assigned(tps) => assert_eq!(
                tps,
                vec![TopicPartition::new(TOPIC, 0), TopicPartition::new(TOPIC, 1)]
            ),
            other => panic!("expected assignment, got {:?}", other),
        }

        let mut seen = Vec::new();
        for _ in 0..2 {
            match next_event(&mut consumer).await {
                ConsumerEvent::Messages(batch) => {
                    seen.extend(batch.into_iter().map(|m| (m.partition, m.offset)))
                }
                other => panic!("expected messages, got {:?}", other),
            }
        }
        seen.sort();
        assert_eq!(seen, vec![(0, 0), (1, 0)]);

        assert!(consumer.poll(Duration::from_millis(20)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_handoff_waits_for_revoke() {
        let broker = broker(2);
        let mut first = broker.consumer(GROUP);
        first.subscribe(TOPIC).await.unwrap();
        assert!(matches!(next_event(&mut first).await, ConsumerEvent::Assigned(_)));

        let mut second = broker.consumer(GROUP);
        second.subscribe(TOPIC).await.unwrap();

        // Partition 1 belongs to `first` until it has seen the revocation.
        assert_eq!(
            broker.owner_of(GROUP, &TopicPartition::new(TOPIC, 1)),
            Some(first.member_id())
        );
        assert!(second.poll(Duration::from_millis(20)).await.unwrap().is_none());

        match next_event(&mut first).await {
            ConsumerEvent::Revoked(tps) => assert_eq!(tps, vec![TopicPartition::new(TOPIC, 1)]),
            other => panic!("expected revoke, got {:?}", other),
        }

        match next_event(&mut second).await {
            ConsumerEvent::Assigned(tps) => assert_eq!(tps, vec![TopicPartition::new(TOPIC, 1)]),
            other => panic!("expected assignment, got {:?}", other),
        }
        assert_eq!(
            broker.owner_of(GROUP, &TopicPartition::new(TOPIC, 1)),
            Some(second.member_id())
        );
    }

    #[tokio::test]
    async fn test_commit_is_fenced_and_monotonic() {
        let broker = broker(1);
        let tp = TopicPartition::new(TOPIC, 0);

        let mut owner = broker.consumer(GROUP);
        owner.subscribe(TOPIC).await.unwrap();
        next_event(&mut owner).await;

        owner.commit(&tp, 5).await.unwrap();
        owner.commit(&tp, 3).await.unwrap();
        assert_eq!(broker.committed(GROUP, &tp), Some(5));

        let mut bystander = broker.consumer(GROUP);
        bystander.subscribe(TOPIC).await.unwrap();
        let err = bystander.commit(&tp, 9).await.unwrap_err();
        assert!(err.is_rebalance());
        assert_eq!(broker.committed(GROUP, &tp), Some(5));
    }

    #[tokio::test]
    async fn test_crashed_member_is_evicted_after_session_timeout() {
        let broker = broker(1);
        let tp = TopicPartition::new(TOPIC, 0);

        let mut crashed = broker.consumer(GROUP);
        crashed.subscribe(TOPIC).await.unwrap();
        next_event(&mut crashed).await;
        let crashed_id = crashed.member_id();
        drop(crashed);

        let mut survivor = broker.consumer(GROUP);
        survivor.subscribe(TOPIC).await.unwrap();
        assert_eq!(broker.owner_of(GROUP, &tp), Some(crashed_id));

        match next_event(&mut survivor).await {
            ConsumerEvent::Assigned(tps) => assert_eq!(tps, vec![tp.clone()]),
            other => panic!("expected assignment, got {:?}", other),
        }
        assert_eq!(broker.members(GROUP), vec![survivor.member_id()]);
    }

    #[tokio::test]
    async fn test_evicted_member_learns_it_lost_partitions() {
        let broker = broker(1);
        let tp = TopicPartition::new(TOPIC, 0);

        let mut slow = broker.consumer(GROUP);
        slow.subscribe(TOPIC).await.unwrap();
        next_event(&mut slow).await;

        tokio::time::sleep(Duration::from_millis(300)).await;

        let err = slow.heartbeat().await.unwrap_err();
        assert!(err.is_rebalance());
        assert!(slow.commit(&tp, 1).await.unwrap_err().is_rebalance());

        match next_event(&mut slow).await {
            ConsumerEvent::Revoked(tps) => assert_eq!(tps, vec![tp.clone()]),
            other => panic!("expected revoke, got {:?}", other),
        }
        // Rejoined as the only member, so it gets the partition back.
        assert!(matches!(next_event(&mut slow).await, ConsumerEvent::Assigned(_)));
    }

    #[tokio::test]
    async fn test_leave_reassigns_immediately() {
        let broker = broker(2);
        let mut a = broker.consumer(GROUP);
        let mut b = broker.consumer(GROUP);
        a.subscribe(TOPIC).await.unwrap();
        next_event(&mut a).await;
        b.subscribe(TOPIC).await.unwrap();
        next_event(&mut a).await; // revoke of partition 1
        next_event(&mut b).await; // assignment of partition 1

        b.leave().await.unwrap();

        match next_event(&mut a).await {
            ConsumerEvent::Assigned(tps) => assert_eq!(tps, vec![TopicPartition::new(TOPIC, 1)]),
            other => panic!("expected assignment, got {:?}", other),
        }
        assert_eq!(broker.assignments(GROUP).get(&a.member_id()), Some(&vec![0, 1]));
    }

    #[tokio::test]
    async fn test_resume_from_committed_offset() {
        let broker = broker(1);
        let tp = TopicPartition::new(TOPIC, 0);
        for i in 0..4 {
            broker
                .append_raw(TOPIC, 0, b"k", format!("m{}", i).as_bytes())
                .unwrap();
        }

        let mut first = broker.consumer(GROUP);
        first.subscribe(TOPIC).await.unwrap();
        next_event(&mut first).await;
        first.commit(&tp, 2).await.unwrap();
        first.leave().await.unwrap();

        let mut second = broker.consumer(GROUP);
        second.subscribe(TOPIC).await.unwrap();
        next_event(&mut second).await;
        match next_event(&mut second).await {
            ConsumerEvent::Messages(batch) => {
                let offsets: Vec<i64> = batch.iter().map(|m| m.offset).collect();
                assert_eq!(offsets, vec![2, 3]);
            }
            other => panic!("expected messages, got {:?}", other),
        }
    }
}
