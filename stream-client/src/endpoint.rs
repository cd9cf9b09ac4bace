//! Contract of the remote stream endpoint.
//!
//! The core never talks to the network directly: a `StreamEndpoint` opens authenticated
//! connections, and each `StreamConnection` appends records to partitions and serves
//! partitioned reads. `MemoryEndpoint` in [`crate::memory`] is the in-process implementation.
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use crate::credentials::AccessToken;
use crate::record::{PartitionId, PartitionTarget, ReceivedRecord, Record};

/// Failures reported by a stream endpoint, classified by how the client should react.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EndpointError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("connection is closed")]
    Closed,
    #[error("service is busy: {message}")]
    ServerBusy {
        message: String,
        retry_after: Option<Duration>,
    },
    #[error("payload of {size} bytes exceeds the {max} byte limit")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("partition {0} does not exist")]
    UnknownPartition(PartitionId),
    #[error("offset {requested} of partition {partition} is outside the retained range starting at {earliest}")]
    OffsetUnavailable {
        partition: PartitionId,
        requested: u64,
        earliest: u64,
    },
}

impl EndpointError {
    /// Transient failures worth another attempt, possibly on a new connection.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EndpointError::ConnectionLost(_)
                | EndpointError::Closed
                | EndpointError::ServerBusy { .. }
        )
    }

    /// Failures after which the current connection must be discarded.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, EndpointError::ConnectionLost(_) | EndpointError::Closed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            EndpointError::ServerBusy { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamProperties {
    pub name: String,
    pub partition_ids: Vec<PartitionId>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PartitionProperties {
    pub partition: PartitionId,
    /// Oldest offset still retained.
    pub earliest_offset: u64,
    /// Offset the next appended record will get.
    pub next_offset: u64,
}

impl PartitionProperties {
    pub fn is_empty(&self) -> bool {
        self.earliest_offset == self.next_offset
    }
}

/// Acknowledgment of an append: the contiguous offsets assigned to the records.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AppendAck {
    pub partition: PartitionId,
    pub first_offset: u64,
    pub last_offset: u64,
    pub enqueued_at: OffsetDateTime,
}

#[async_trait]
pub trait StreamEndpoint: Send + Sync {
    /// Fully qualified namespace (host) the stream lives in.
    fn namespace(&self) -> &str;

    fn stream_name(&self) -> &str;

    async fn connect(&self, token: &AccessToken) -> Result<Box<dyn StreamConnection>, EndpointError>;
}

#[async_trait]
pub trait StreamConnection: Send + Sync {
    async fn stream_properties(&self) -> Result<StreamProperties, EndpointError>;

    async fn partition_properties(
        &self,
        partition: PartitionId,
    ) -> Result<PartitionProperties, EndpointError>;

    /// Append records as one unit. Either all of them are accepted or none.
    async fn append(
        &self,
        target: &PartitionTarget,
        records: &[Record],
    ) -> Result<AppendAck, EndpointError>;

    /// Read records at or after `from`, waiting up to `max_wait` for at least one to arrive.
    /// An empty result means nothing arrived in time.
    async fn read(
        &self,
        partition: PartitionId,
        from: u64,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedRecord>, EndpointError>;

    async fn close(&self);
}
