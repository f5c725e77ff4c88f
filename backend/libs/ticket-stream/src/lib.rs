//! # Ticket Stream
//!
//! Ordered delivery and at-least-once consumption over a partitioned log.
//!
//! ## Guarantees
//!
//! - **Per-key order**: records are routed by FNV-1a hash of their order key,
//!   so every record of a key lands on one partition and is read back in
//!   production order. Order across keys is not preserved.
//! - **Durable publish**: a publish returns once all in-sync replicas have the
//!   record; the producer is idempotent, so client retries do not duplicate.
//! - **At-least-once consume**: a record's offset is committed only after the
//!   handler acknowledged it. Crashes between handling and commit redeliver.
//! - **Malformed records never block**: undecodable records are counted,
//!   skipped and committed past.
//!
//! ## Architecture
//!
//! ```text
//! Publisher ──► LogProducer ──► [ partition 0 | partition 1 | ... ]
//!                                         │
//!                                   GroupConsumer
//!                                         │
//!                     GroupMember ──► RecordHandler ──► Delivery::ack()
//!                          │                                  │
//!                          └────────── commit(next offset) ◄──┘
//! ```
//!
//! `LogProducer` and `GroupConsumer` are implemented for Kafka
//! ([`kafka`]) and in-process ([`memory`]).
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ticket_stream::{
//!     Acked, Delivery, GroupMember, HandlerError, KafkaGroupConsumer, KafkaLogProducer,
//!     Publisher, Record, RecordHandler, StreamConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! struct Print;
//!
//! #[async_trait::async_trait]
//! impl RecordHandler for Print {
//!     async fn handle(&self, delivery: &Delivery) -> Result<Acked, HandlerError> {
//!         println!("{} @ {}", delivery.record.id, delivery.offset);
//!         Ok(delivery.ack())
//!     }
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = StreamConfig::from_env()?;
//!
//! let publisher = Publisher::new(Arc::new(KafkaLogProducer::new(&config)?), &config.kafka_topic);
//! publisher
//!     .publish_with_retry(&Record::new(42, b"hello".to_vec()), &config.publish_retry())
//!     .await?;
//!
//! let mut member = GroupMember::new(
//!     KafkaGroupConsumer::new(&config)?,
//!     &config.kafka_topic,
//!     config.member_config(),
//! );
//! member.run(&Print, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod dedup;
pub mod error;
pub mod kafka;
pub mod member;
pub mod memory;
pub mod metrics;
pub mod partitioner;
pub mod publisher;
pub mod record;

pub use broker::{
    ConsumerEvent, DeliveryReport, GroupConsumer, InboundMessage, LogProducer, OutboundRecord,
    TopicPartition,
};
pub use config::StreamConfig;
pub use dedup::IdempotentHandler;
pub use error::{ErrorKind, HandlerError, StreamError, StreamResult};
pub use kafka::{KafkaGroupConsumer, KafkaLogProducer};
pub use member::{
    Acked, CommitPolicy, Delivery, GroupMember, MemberConfig, MemberState, RecordHandler,
};
pub use memory::{InMemoryBroker, InMemoryConfig, InMemoryConsumer, InMemoryProducer};
pub use metrics::StreamMetrics;
pub use partitioner::{EmptyKeyPolicy, HashPartitioner};
pub use publisher::Publisher;
pub use record::{OrderKey, Record};
