//! Record model shared by the publisher and the consumer group member.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::error::{StreamError, StreamResult};

const MAX_ID_LEN: usize = 255;

/// Key that selects the partition of a record.
///
/// All records sharing an order key land on the same partition, so their
/// relative order is the log order of that partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OrderKey {
    Int(i64),
    Str(String),
}

impl OrderKey {
    /// Bytes used as the message key and as partitioner input.
    ///
    /// Integers are rendered in decimal so that `OrderKey::Int(42)` and
    /// `OrderKey::Str("42")` hash to the same partition.
    pub fn as_key_bytes(&self) -> Cow<'_, [u8]> {
        match self {
            OrderKey::Int(n) => Cow::Owned(n.to_string().into_bytes()),
            OrderKey::Str(s) => Cow::Borrowed(s.as_bytes()),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            OrderKey::Int(_) => false,
            OrderKey::Str(s) => s.is_empty(),
        }
    }
}

impl fmt::Display for OrderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderKey::Int(n) => write!(f, "{}", n),
            OrderKey::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for OrderKey {
    fn from(value: i64) -> Self {
        OrderKey::Int(value)
    }
}

impl From<i32> for OrderKey {
    fn from(value: i32) -> Self {
        OrderKey::Int(value.into())
    }
}

impl From<&str> for OrderKey {
    fn from(value: &str) -> Self {
        OrderKey::Str(value.to_string())
    }
}

impl From<String> for OrderKey {
    fn from(value: String) -> Self {
        OrderKey::Str(value)
    }
}

/// The unit of transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    /// Producer-assigned unique id, used for dedup downstream
    pub id: String,

    /// Partition selector
    pub order_key: OrderKey,

    /// Production time, used for end-to-end lag
    pub created_at: DateTime<Utc>,

    /// Opaque domain content
    #[serde(with = "crate::codec::base64_payload")]
    pub payload: Vec<u8>,
}

impl Record {
    /// Create a record with a fresh v4 id stamped with the current time.
    pub fn new(order_key: impl Into<OrderKey>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            order_key: order_key.into(),
            created_at: Utc::now(),
            payload: payload.into(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }

    /// Validate id format
    pub fn validate(&self) -> StreamResult<()> {
        if self.id.is_empty() {
            return Err(StreamError::InvalidRecord(
                "Record ID cannot be empty".to_string(),
            ));
        }

        if self.id.len() > MAX_ID_LEN {
            return Err(StreamError::InvalidRecord(format!(
                "Record ID too long: {} characters (max {})",
                self.id.len(),
                MAX_ID_LEN
            )));
        }

        Ok(())
    }

    /// Time between production and `now`, zero if the clocks disagree.
    pub fn lag(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }
}
