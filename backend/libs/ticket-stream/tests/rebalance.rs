//! Members joining and leaving while records flow.
//!
//! Every consumer is wrapped in a `RecordingConsumer`, which flags a partition
//! handed to a second member before the first let go of it, messages from a
//! partition not held, and commits that move backwards.

mod common;

use common::{
    broker, distinct_ids, member_config, wait_until, Ledger, Recorder, RecordingConsumer, Seen,
    GROUP, TOPIC,
};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use ticket_stream::{
    CommitPolicy, GroupMember, InMemoryBroker, OrderKey, Publisher, Record, StreamResult,
    TopicPartition,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PARTITIONS: i32 = 6;
const RECORDS: i64 = 300;
const KEYS: i64 = 30;

struct Running {
    shutdown: CancellationToken,
    task: JoinHandle<StreamResult<()>>,
}

fn start(
    broker: &InMemoryBroker,
    name: &str,
    log: &Arc<Mutex<Vec<Seen>>>,
    ledger: &Arc<Mutex<Ledger>>,
    policy: CommitPolicy,
) -> Running {
    let consumer = RecordingConsumer::new(broker.consumer(GROUP), ledger.clone());
    let mut member = GroupMember::new(consumer, TOPIC, member_config(policy));
    let handler = Recorder::new(name, log.clone()).with_delay(Duration::from_millis(1));
    let shutdown = CancellationToken::new();

    let task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { member.run(&handler, shutdown).await })
    };
    Running { shutdown, task }
}

async fn stop(running: Running) {
    running.shutdown.cancel();
    running.task.await.unwrap().unwrap();
}

fn fully_committed(broker: &InMemoryBroker) -> bool {
    (0..PARTITIONS).all(|partition| {
        let written = broker.messages(TOPIC, partition).len() as i64;
        let committed = broker
            .committed(GROUP, &TopicPartition::new(TOPIC, partition))
            .unwrap_or(0);
        committed == written
    })
}

fn sequence_of(record: &Record) -> i64 {
    std::str::from_utf8(&record.payload)
        .ok()
        .and_then(|s| s.parse().ok())
        .expect("payload is a sequence number")
}

async fn churn(policy: CommitPolicy) {
    let broker = broker(PARTITIONS, Duration::from_secs(10));
    let publisher = Publisher::new(Arc::new(broker.producer()), TOPIC);
    for sequence in 0..RECORDS {
        let record = Record::new(sequence % KEYS, sequence.to_string().into_bytes());
        publisher.publish(&record).await.unwrap();
    }

    let log = Arc::new(Mutex::new(Vec::new()));
    let ledger = Arc::new(Mutex::new(Ledger::default()));
    let timeout = Duration::from_secs(10);

    let a = start(&broker, "a", &log, &ledger, policy);
    wait_until(timeout, || distinct_ids(&log) >= 50).await;

    let b = start(&broker, "b", &log, &ledger, policy);
    wait_until(timeout, || distinct_ids(&log) >= 120).await;

    let c = start(&broker, "c", &log, &ledger, policy);
    wait_until(timeout, || distinct_ids(&log) >= 200).await;

    stop(b).await;
    wait_until(timeout, || fully_committed(&broker)).await;

    stop(a).await;
    stop(c).await;

    let ledger = ledger.lock();
    assert!(ledger.violations.is_empty(), "{:#?}", ledger.violations);
    assert!(broker.members(GROUP).is_empty());
    assert_eq!(distinct_ids(&log), RECORDS as usize);

    // Redeliveries are allowed, but the first delivery of each key's records
    // still follows production order.
    let mut first_seen = HashSet::new();
    let mut per_key: HashMap<OrderKey, Vec<i64>> = HashMap::new();
    for seen in log.lock().iter() {
        if first_seen.insert(seen.record.id.clone()) {
            per_key
                .entry(seen.record.order_key.clone())
                .or_default()
                .push(sequence_of(&seen.record));
        }
    }
    for (key, sequences) in &per_key {
        assert!(
            sequences.windows(2).all(|w| w[0] < w[1]),
            "key {} delivered out of order: {:?}",
            key,
            sequences
        );
    }
}

#[tokio::test]
async fn test_membership_churn_with_per_record_commits() {
    churn(CommitPolicy::PerRecord).await;
}

#[tokio::test]
async fn test_membership_churn_with_per_batch_commits() {
    churn(CommitPolicy::PerBatch).await;
}

#[tokio::test]
async fn test_every_partition_has_one_owner_once_settled() {
    let broker = broker(PARTITIONS, Duration::from_secs(10));
    let log = Arc::new(Mutex::new(Vec::new()));
    let ledger = Arc::new(Mutex::new(Ledger::default()));

    let members: Vec<Running> = ["a", "b", "c"]
        .into_iter()
        .map(|name| start(&broker, name, &log, &ledger, CommitPolicy::PerRecord))
        .collect();

    wait_until(Duration::from_secs(5), || {
        let assignments = broker.assignments(GROUP);
        assignments.len() == 3 && assignments.values().all(|partitions| partitions.len() == 2)
    })
    .await;

    let owned: usize = broker.assignments(GROUP).values().map(Vec::len).sum();
    assert_eq!(owned, PARTITIONS as usize);

    for running in members {
        stop(running).await;
    }
    assert!(ledger.lock().violations.is_empty());
    assert!(broker.assignments(GROUP).is_empty());
}
