//! Kafka implementations of the broker seams, over librdkafka.
//!
//! Group rebalances are captured by [`RebalanceContext`] and surfaced through
//! `poll` as `Assigned`/`Revoked` events, ahead of any buffered message.
//! librdkafka heartbeats from its own thread, so `heartbeat` is a no-op here.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::FutureExt;
use parking_lot::Mutex;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{
    CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Header, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{
    ConsumerEvent, DeliveryReport, GroupConsumer, InboundMessage, LogProducer, OutboundRecord,
    TopicPartition,
};
use crate::codec::IDEMPOTENCY_HEADER;
use crate::config::StreamConfig;
use crate::error::{StreamError, StreamResult};

const CLIENT_RETRIES: &str = "5";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// Producer settings: full acknowledgment and broker-side idempotence.
pub fn producer_client_config(config: &StreamConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("message.timeout.ms", config.message_timeout_ms.to_string())
        .set("acks", "all")
        .set("enable.idempotence", "true")
        .set("retries", CLIENT_RETRIES)
        .set("max.in.flight.requests.per.connection", "5");
    client
}

/// Consumer settings: manual commits, earliest reset, round-robin assignment.
pub fn consumer_client_config(config: &StreamConfig, client_id: &str) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.kafka_brokers)
        .set("group.id", &config.kafka_group_id)
        .set("client.id", client_id)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", "earliest")
        .set("partition.assignment.strategy", "roundrobin")
        .set("session.timeout.ms", config.session_timeout_ms.to_string())
        .set("heartbeat.interval.ms", config.heartbeat_interval_ms.to_string())
        .set("enable.partition.eof", "false");
    client
}

fn classify_producer_error(e: KafkaError, timeout: Duration) -> StreamError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::MessageTimedOut)
        | Some(RDKafkaErrorCode::RequestTimedOut)
        | Some(RDKafkaErrorCode::OperationTimedOut) => StreamError::Timeout(timeout),
        Some(RDKafkaErrorCode::MessageSizeTooLarge)
        | Some(RDKafkaErrorCode::InvalidMessage)
        | Some(RDKafkaErrorCode::InvalidMessageSize)
        | Some(RDKafkaErrorCode::UnknownTopicOrPartition) => {
            StreamError::InvalidRecord(e.to_string())
        }
        _ => StreamError::BrokerUnavailable(e.to_string()),
    }
}

fn classify_consumer_error(e: KafkaError) -> StreamError {
    match e.rdkafka_error_code() {
        Some(RDKafkaErrorCode::RebalanceInProgress)
        | Some(RDKafkaErrorCode::IllegalGeneration)
        | Some(RDKafkaErrorCode::UnknownMemberId) => {
            StreamError::RebalanceInterruption(e.to_string())
        }
        Some(RDKafkaErrorCode::AllBrokersDown)
        | Some(RDKafkaErrorCode::BrokerTransportFailure) => {
            StreamError::BrokerUnavailable(e.to_string())
        }
        _ => StreamError::GroupProtocol(e.to_string()),
    }
}

pub struct KafkaLogProducer {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaLogProducer {
    pub fn new(config: &StreamConfig) -> StreamResult<Self> {
        let producer: FutureProducer = producer_client_config(config).create().map_err(|e| {
            error!("Failed to create Kafka producer: {}", e);
            StreamError::Config(e.to_string())
        })?;

        info!(brokers = %config.kafka_brokers, "Kafka producer created");

        Ok(Self {
            producer,
            message_timeout: config.message_timeout(),
        })
    }
}

#[async_trait]
impl LogProducer for KafkaLogProducer {
    async fn partition_count(&self, topic: &str) -> StreamResult<i32> {
        let producer = self.producer.clone();
        let topic = topic.to_string();

        let count = tokio::task::spawn_blocking(move || {
            let metadata = producer
                .client()
                .fetch_metadata(Some(&topic), METADATA_TIMEOUT)?;
            Ok::<_, KafkaError>(
                metadata
                    .topics()
                    .iter()
                    .find(|t| t.name() == topic)
                    .map(|t| t.partitions().len() as i32)
                    .unwrap_or(0),
            )
        })
        .await
        .map_err(|e| StreamError::Other(e.into()))?
        .map_err(|e| classify_producer_error(e, METADATA_TIMEOUT))?;

        debug!(partitions = count, "Fetched topic metadata");
        Ok(count)
    }

    async fn send(
        &self,
        topic: &str,
        partition: i32,
        record: OutboundRecord,
    ) -> StreamResult<DeliveryReport> {
        let headers = OwnedHeaders::new().insert(Header {
            key: IDEMPOTENCY_HEADER,
            value: Some(record.idempotency_key.as_bytes()),
        });

        let future_record = FutureRecord::to(topic)
            .partition(partition)
            .key(&record.key)
            .payload(&record.payload)
            .timestamp(record.timestamp.timestamp_millis())
            .headers(headers);

        match self.producer.send(future_record, Duration::from_secs(0)).await {
            Ok((partition, offset)) => Ok(DeliveryReport {
                partition,
                offset,
                duplicate: false,
            }),
            Err((e, _message)) => Err(classify_producer_error(e, self.message_timeout)),
        }
    }

    async fn flush(&self, timeout: Duration) -> StreamResult<()> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| StreamError::Other(e.into()))?
            .map_err(|e| classify_producer_error(e, timeout))
    }
}

/// Turns librdkafka rebalance callbacks into queued consumer events.
pub struct RebalanceContext {
    events: Arc<Mutex<VecDeque<ConsumerEvent>>>,
}

fn partitions_of(list: &TopicPartitionList) -> Vec<TopicPartition> {
    list.elements()
        .iter()
        .map(|elem| TopicPartition::new(elem.topic(), elem.partition()))
        .collect()
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn pre_rebalance(&self, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Revoke(list) => {
                let revoked = partitions_of(list);
                info!(partitions = ?revoked, "Partitions revoked");
                self.events.lock().push_back(ConsumerEvent::Revoked(revoked));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!(error = ?e, "Rebalance error"),
        }
    }

    fn post_rebalance(&self, rebalance: &Rebalance<'_>) {
        if let Rebalance::Assign(list) = rebalance {
            let assigned = partitions_of(list);
            info!(partitions = ?assigned, "Partitions assigned");
            self.events.lock().push_back(ConsumerEvent::Assigned(assigned));
        }
    }
}

fn to_inbound(message: &BorrowedMessage<'_>) -> InboundMessage {
    InboundMessage {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(|k| k.to_vec()),
        payload: message.payload().map(|p| p.to_vec()),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
    }
}

pub struct KafkaGroupConsumer {
    consumer: StreamConsumer<RebalanceContext>,
    events: Arc<Mutex<VecDeque<ConsumerEvent>>>,
    pending: VecDeque<InboundMessage>,
    member_id: String,
    batch_size: usize,
}

impl KafkaGroupConsumer {
    pub fn new(config: &StreamConfig) -> StreamResult<Self> {
        let member_id = format!("{}-{}", config.kafka_group_id, Uuid::new_v4());
        let events = Arc::new(Mutex::new(VecDeque::new()));
        let context = RebalanceContext {
            events: Arc::clone(&events),
        };

        let consumer: StreamConsumer<RebalanceContext> =
            consumer_client_config(config, &member_id)
                .create_with_context(context)
                .map_err(|e| {
                    error!("Failed to create Kafka consumer: {}", e);
                    StreamError::Config(e.to_string())
                })?;

        Ok(Self {
            consumer,
            events,
            pending: VecDeque::new(),
            member_id,
            batch_size: config.batch_size.max(1),
        })
    }

    fn take_control_event(&mut self) -> Option<ConsumerEvent> {
        let event = self.events.lock().pop_front()?;
        if let ConsumerEvent::Revoked(tps) = &event {
            let revoked: BTreeSet<&TopicPartition> = tps.iter().collect();
            let before = self.pending.len();
            self.pending
                .retain(|m| !revoked.contains(&m.topic_partition()));
            if self.pending.len() != before {
                debug!(
                    dropped = before - self.pending.len(),
                    "Dropped buffered messages of revoked partitions"
                );
            }
        }
        Some(event)
    }

    /// Longest run of buffered messages from the partition at the head.
    fn next_batch(&mut self) -> Option<Vec<InboundMessage>> {
        let first = self.pending.pop_front()?;
        let mut batch = vec![first];
        while batch.len() < self.batch_size {
            match self.pending.front() {
                Some(m) if m.topic == batch[0].topic && m.partition == batch[0].partition => {
                    if let Some(m) = self.pending.pop_front() {
                        batch.push(m);
                    }
                }
                _ => break,
            }
        }
        Some(batch)
    }
}

#[async_trait]
impl GroupConsumer for KafkaGroupConsumer {
    fn member_id(&self) -> String {
        self.member_id.clone()
    }

    async fn subscribe(&mut self, topic: &str) -> StreamResult<()> {
        self.consumer.subscribe(&[topic]).map_err(|e| {
            error!("Failed to subscribe to topic {}: {}", topic, e);
            classify_consumer_error(e)
        })?;
        info!(topic = topic, member_id = %self.member_id, "Subscribed to topic");
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> StreamResult<Option<ConsumerEvent>> {
        if let Some(event) = self.take_control_event() {
            return Ok(Some(event));
        }

        if self.pending.is_empty() {
            let received = match tokio::time::timeout(timeout, self.consumer.recv()).await {
                Err(_) => None,
                Ok(Err(e)) => return Err(classify_consumer_error(e)),
                Ok(Ok(message)) => Some(to_inbound(&message)),
            };
            let Some(first) = received else {
                return Ok(self.take_control_event());
            };
            self.pending.push_back(first);

            while self.pending.len() < self.batch_size {
                match self.consumer.recv().now_or_never() {
                    Some(Ok(message)) => self.pending.push_back(to_inbound(&message)),
                    Some(Err(e)) => {
                        warn!(error = %e, "Consumer error while draining");
                        break;
                    }
                    None => break,
                }
            }
        }

        // A rebalance may have fired while receiving.
        if let Some(event) = self.take_control_event() {
            return Ok(Some(event));
        }

        Ok(self.next_batch().map(ConsumerEvent::Messages))
    }

    async fn heartbeat(&mut self) -> StreamResult<()> {
        Ok(())
    }

    async fn commit(&mut self, tp: &TopicPartition, next_offset: i64) -> StreamResult<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&tp.topic, tp.partition, Offset::Offset(next_offset))
            .map_err(|e| StreamError::Config(e.to_string()))?;

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(classify_consumer_error)?;

        debug!(
            "Committed offset: topic={}, partition={}, offset={}",
            tp.topic, tp.partition, next_offset
        );
        Ok(())
    }

    async fn leave(&mut self) -> StreamResult<()> {
        self.consumer.unsubscribe();
        self.pending.clear();
        info!(member_id = %self.member_id, "Unsubscribed, leaving group");
        Ok(())
    }
}
