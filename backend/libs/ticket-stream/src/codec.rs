//! Wire format of a record on the log.
//!
//! ```json
//! {
//!   "id": "0b6f2c1e-...",
//!   "order_key": 42,
//!   "created_at": "2024-01-01T00:00:00.123456789Z",
//!   "payload": "eyJkYXRhIjoiLi4uIn0="
//! }
//! ```
//!
//! `payload` is standard base64. Transport metadata travels beside the value:
//! the message key is the order key, the `idempotency_key` header is the record
//! id and the message timestamp is `created_at`.

use crate::error::{StreamError, StreamResult};
use crate::record::Record;

/// Header carrying the record id.
pub const IDEMPOTENCY_HEADER: &str = "idempotency_key";

/// Serialize a record for the log.
pub fn encode(record: &Record) -> StreamResult<Vec<u8>> {
    record.validate()?;
    Ok(serde_json::to_vec(record)?)
}

/// Deserialize a record read from the log.
///
/// Every failure is `MalformedRecord`: bytes that do not decode now never will.
pub fn decode(bytes: &[u8]) -> StreamResult<Record> {
    let record: Record =
        serde_json::from_slice(bytes).map_err(|e| StreamError::MalformedRecord(e.to_string()))?;

    record
        .validate()
        .map_err(|e| StreamError::MalformedRecord(e.to_string()))?;

    Ok(record)
}

pub(crate) mod base64_payload {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
