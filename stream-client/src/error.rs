use std::time::Duration;

use thiserror::Error;

use crate::endpoint::EndpointError;
use crate::record::PartitionId;

/// Enumeration of errors surfaced by the stream client.
///
/// Connection level failures are retried inside the producer and receivers; what reaches the
/// caller is either terminal or a distinct timeout kind.
#[derive(Error, Debug)]
pub enum Error {
    #[error("send failed after {attempts} attempts, last error: {last}")]
    TransientSendFailure { attempts: u32, last: EndpointError },
    #[error("send was rejected by the stream: {0}")]
    RejectedSendFailure(EndpointError),
    #[error("cannot send an empty batch")]
    EmptyBatch,
    #[error("record of {size} bytes does not fit in an empty batch of {max} bytes")]
    RecordTooLarge { size: usize, max: usize },

    #[error("offset {requested} of partition {partition} is no longer available, earliest retained offset is {earliest}")]
    OffsetUnavailable {
        partition: PartitionId,
        requested: u64,
        earliest: u64,
    },
    #[error("ownership of partition {0} was lost")]
    OwnershipLost(PartitionId),
    #[error("checkpoint for partition {partition} at offset {offset} lost to stored offset {stored}")]
    CheckpointConflict {
        partition: PartitionId,
        offset: u64,
        stored: u64,
    },
    #[error("connection lost and not recovered: {0}")]
    ConnectionLost(EndpointError),
    #[error("stream endpoint failed: {0}")]
    Endpoint(EndpointError),

    #[error("connection was not established within {0:?}")]
    ConnectTimeout(Duration),
    #[error("send was not acknowledged within {0:?}")]
    AckTimeout(Duration),
    #[error("revocation of partition {partition} was not acknowledged within {timeout:?}")]
    RevocationTimeout {
        partition: PartitionId,
        timeout: Duration,
    },

    #[error("record handler failed at offset {offset}: {source}")]
    Handler {
        offset: u64,
        #[source]
        source: anyhow::Error,
    },
    #[error("credential provider failed: {0}")]
    Credential(String),
    #[error("payload encoding failed: {0}")]
    Encoding(String),
    #[error("checkpoint backend failed: {0}")]
    CheckpointBackend(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("operation cancelled")]
    Cancelled,
}

impl Error {
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    pub fn encoding(msg: impl Into<String>) -> Self {
        Error::Encoding(msg.into())
    }

    /// A short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::TransientSendFailure { .. } => "transient_send_failure",
            Error::RejectedSendFailure(_) => "rejected_send_failure",
            Error::EmptyBatch => "empty_batch",
            Error::RecordTooLarge { .. } => "record_too_large",
            Error::OffsetUnavailable { .. } => "offset_unavailable",
            Error::OwnershipLost(_) => "ownership_lost",
            Error::CheckpointConflict { .. } => "checkpoint_conflict",
            Error::ConnectionLost(_) => "connection_lost",
            Error::Endpoint(_) => "endpoint",
            Error::ConnectTimeout(_) => "connect_timeout",
            Error::AckTimeout(_) => "ack_timeout",
            Error::RevocationTimeout { .. } => "revocation_timeout",
            Error::Handler { .. } => "handler",
            Error::Credential(_) => "credential",
            Error::Encoding(_) => "encoding",
            Error::CheckpointBackend(_) => "checkpoint_backend",
            Error::InvalidState(_) => "invalid_state",
            Error::Cancelled => "cancelled",
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
