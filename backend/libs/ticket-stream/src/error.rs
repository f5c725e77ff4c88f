//! Error types for the ticket stream library.

use resilience::Retryable;
use std::time::Duration;
use thiserror::Error;

/// Result type alias for stream operations.
pub type StreamResult<T> = Result<T, StreamError>;

/// How an error must be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Connection loss or timeout: retry with bounded backoff
    TransientBroker,
    /// Serialization or configuration: fail fast, surface to caller
    PermanentPublish,
    /// Undecodable record on consume: skip, count, advance the offset
    MalformedRecord,
    /// Partition ownership changed: restart on the new assignment
    RebalanceInterruption,
    /// Anything else on the consume side: stop loudly
    Fatal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::TransientBroker => "transient_broker",
            ErrorKind::PermanentPublish => "permanent_publish",
            ErrorKind::MalformedRecord => "malformed_record",
            ErrorKind::RebalanceInterruption => "rebalance",
            ErrorKind::Fatal => "fatal",
        }
    }
}

/// Errors that can occur while publishing or consuming records.
#[derive(Error, Debug)]
pub enum StreamError {
    /// Broker connection could not be established or was lost
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Broker did not acknowledge in time
    #[error("Broker request timed out after {0:?}")]
    Timeout(Duration),

    /// Record could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record is not publishable as-is (e.g. empty order key)
    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    /// Client or topic configuration is unusable
    #[error("Configuration error: {0}")]
    Config(String),

    /// Payload on the log could not be decoded
    #[error("Malformed record: {0}")]
    MalformedRecord(String),

    /// Member no longer owns the partition it is working on
    #[error("Rebalance in progress: {0}")]
    RebalanceInterruption(String),

    /// Group membership or assignment protocol failed
    #[error("Consumer group error: {0}")]
    GroupProtocol(String),

    /// Record handler failed after its retries
    #[error("Record handler failed: {0}")]
    Handler(String),

    /// Generic error with context
    #[error("Stream error: {0}")]
    Other(#[from] anyhow::Error),
}

impl StreamError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StreamError::BrokerUnavailable(_) | StreamError::Timeout(_) => {
                ErrorKind::TransientBroker
            }
            StreamError::Serialization(_)
            | StreamError::InvalidRecord(_)
            | StreamError::Config(_) => ErrorKind::PermanentPublish,
            StreamError::MalformedRecord(_) => ErrorKind::MalformedRecord,
            StreamError::RebalanceInterruption(_) => ErrorKind::RebalanceInterruption,
            StreamError::GroupProtocol(_) | StreamError::Handler(_) | StreamError::Other(_) => {
                ErrorKind::Fatal
            }
        }
    }

    /// Check if error is transient (should retry)
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientBroker
    }

    pub fn is_rebalance(&self) -> bool {
        self.kind() == ErrorKind::RebalanceInterruption
    }
}

impl Retryable for StreamError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

/// Outcome of a record handler that did not acknowledge.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The record can never be processed; skip it and move on
    #[error("malformed record: {0}")]
    Malformed(String),

    /// Processing failed; a later attempt may succeed
    #[error("processing failed: {0}")]
    Failed(String),
}

impl Retryable for HandlerError {
    fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}
