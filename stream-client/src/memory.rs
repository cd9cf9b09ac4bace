//! In-process stream endpoint.
//!
//! Keeps one append-only log per partition, serves long-polling reads, validates tokens and
//! drops records that fall out of retention. Tests drive it through the fault injection hooks
//! (`fail_next_*`, `drop_connections`, delays) the same way a broker mock would be used.
use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Notify;
use tracing::debug;

use crate::batch::{BATCH_FRAME_OVERHEAD, DEFAULT_MAX_BATCH_SIZE_BYTES};
use crate::credentials::AccessToken;
use crate::endpoint::{
    AppendAck, EndpointError, PartitionProperties, StreamConnection, StreamEndpoint,
    StreamProperties,
};
use crate::record::{PartitionId, PartitionTarget, ReceivedRecord, Record};

#[derive(Default)]
struct LogState {
    earliest: u64,
    entries: VecDeque<ReceivedRecord>,
}

impl LogState {
    fn next_offset(&self) -> u64 {
        self.earliest + self.entries.len() as u64
    }

    fn truncate_before(&mut self, offset: u64) -> usize {
        let mut dropped = 0;
        while self.earliest < offset && !self.entries.is_empty() {
            self.entries.pop_front();
            self.earliest += 1;
            dropped += 1;
        }
        dropped
    }
}

#[derive(Default)]
struct PartitionLog {
    state: Mutex<LogState>,
    appended: Notify,
}

#[derive(Default)]
struct Faults {
    connect: VecDeque<EndpointError>,
    append: VecDeque<EndpointError>,
    read: VecDeque<EndpointError>,
}

#[derive(Default, Clone, Copy)]
struct Delays {
    connect: Duration,
    ack: Duration,
}

struct Shared {
    namespace: String,
    stream_name: String,
    secret: Option<String>,
    max_request_bytes: usize,
    retention: Option<Duration>,
    partitions: Vec<PartitionLog>,
    round_robin: AtomicUsize,
    generation: AtomicU64,
    connections_opened: AtomicU64,
    faults: Mutex<Faults>,
    delays: Mutex<Delays>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poison| poison.into_inner())
}

impl Shared {
    fn log(&self, partition: PartitionId) -> Result<&PartitionLog, EndpointError> {
        self.partitions
            .get(partition as usize)
            .ok_or(EndpointError::UnknownPartition(partition))
    }

    fn resolve(&self, target: &PartitionTarget) -> Result<PartitionId, EndpointError> {
        let count = self.partitions.len();
        let partition = match target {
            PartitionTarget::Any => self.round_robin.fetch_add(1, Ordering::SeqCst) % count,
            PartitionTarget::Id(id) => *id as usize,
            PartitionTarget::Key(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % count as u64) as usize
            }
        };
        let partition = PartitionId::try_from(partition)
            .map_err(|_| EndpointError::InvalidRequest(format!("partition {partition} out of range")))?;
        self.log(partition)?;
        Ok(partition)
    }

    fn wake_readers(&self) {
        for log in &self.partitions {
            log.appended.notify_waiters();
        }
    }

    fn apply_retention(&self, log: &PartitionLog) {
        let Some(retention) = self.retention else {
            return;
        };
        let cutoff = OffsetDateTime::now_utc() - retention;
        let mut state = lock(&log.state);
        let keep_from = state
            .entries
            .iter()
            .find(|r| r.enqueued_at >= cutoff)
            .map(|r| r.offset)
            .unwrap_or_else(|| state.next_offset());
        state.truncate_before(keep_from);
    }
}

/// A stream kept entirely in memory. Cloning shares the same stream.
#[derive(Clone)]
pub struct MemoryEndpoint {
    shared: Arc<Shared>,
}

impl MemoryEndpoint {
    pub fn new(namespace: &str, stream_name: &str, partition_count: u32) -> Self {
        Self::builder(namespace, stream_name, partition_count).build()
    }

    pub fn builder(namespace: &str, stream_name: &str, partition_count: u32) -> MemoryEndpointBuilder {
        MemoryEndpointBuilder {
            namespace: namespace.to_owned(),
            stream_name: stream_name.to_owned(),
            partition_count: partition_count.max(1),
            secret: None,
            max_request_bytes: DEFAULT_MAX_BATCH_SIZE_BYTES,
            retention: None,
        }
    }

    pub fn partition_count(&self) -> u32 {
        self.shared.partitions.len() as u32
    }

    /// Fail the next connection attempt with `error`.
    pub fn fail_next_connect(&self, error: EndpointError) {
        lock(&self.shared.faults).connect.push_back(error);
    }

    /// Fail the next append, on any connection, with `error`. Nothing gets written.
    pub fn fail_next_append(&self, error: EndpointError) {
        lock(&self.shared.faults).append.push_back(error);
    }

    pub fn fail_next_read(&self, error: EndpointError) {
        lock(&self.shared.faults).read.push_back(error);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        lock(&self.shared.delays).connect = delay;
    }

    /// Delay acknowledgments. The records are still written before the delay.
    pub fn set_ack_delay(&self, delay: Duration) {
        lock(&self.shared.delays).ack = delay;
    }

    /// Break every open connection, as a network partition would.
    pub fn drop_connections(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.wake_readers();
    }

    pub fn connections_opened(&self) -> u64 {
        self.shared.connections_opened.load(Ordering::SeqCst)
    }

    /// Expire every record of `partition` below `offset`.
    pub fn truncate_before(&self, partition: PartitionId, offset: u64) -> usize {
        match self.shared.log(partition) {
            Ok(log) => lock(&log.state).truncate_before(offset),
            Err(_) => 0,
        }
    }

    pub fn records(&self, partition: PartitionId) -> Vec<ReceivedRecord> {
        match self.shared.log(partition) {
            Ok(log) => lock(&log.state).entries.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }
}

pub struct MemoryEndpointBuilder {
    namespace: String,
    stream_name: String,
    partition_count: u32,
    secret: Option<String>,
    max_request_bytes: usize,
    retention: Option<Duration>,
}

impl MemoryEndpointBuilder {
    /// Only accept tokens carrying this secret.
    pub fn secret(mut self, secret: &str) -> Self {
        self.secret = Some(secret.to_owned());
        self
    }

    pub fn max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    pub fn retention(mut self, retention: Duration) -> Self {
        self.retention = Some(retention);
        self
    }

    pub fn build(self) -> MemoryEndpoint {
        MemoryEndpoint {
            shared: Arc::new(Shared {
                namespace: self.namespace,
                stream_name: self.stream_name,
                secret: self.secret,
                max_request_bytes: self.max_request_bytes,
                retention: self.retention,
                partitions: (0..self.partition_count)
                    .map(|_| PartitionLog::default())
                    .collect(),
                round_robin: AtomicUsize::new(0),
                generation: AtomicU64::new(0),
                connections_opened: AtomicU64::new(0),
                faults: Mutex::new(Faults::default()),
                delays: Mutex::new(Delays::default()),
            }),
        }
    }
}

#[async_trait]
impl StreamEndpoint for MemoryEndpoint {
    fn namespace(&self) -> &str {
        &self.shared.namespace
    }

    fn stream_name(&self) -> &str {
        &self.shared.stream_name
    }

    async fn connect(&self, token: &AccessToken) -> Result<Box<dyn StreamConnection>, EndpointError> {
        let delay = lock(&self.shared.delays).connect;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = lock(&self.shared.faults).connect.pop_front() {
            return Err(error);
        }
        if let Some(secret) = &self.shared.secret {
            if &token.token != secret {
                return Err(EndpointError::Unauthorized("invalid token".to_owned()));
            }
        }
        if token.expires_at <= OffsetDateTime::now_utc() {
            return Err(EndpointError::Unauthorized("token has expired".to_owned()));
        }

        self.shared.connections_opened.fetch_add(1, Ordering::SeqCst);
        debug!(stream = %self.shared.stream_name, "memory connection opened");
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            generation: self.shared.generation.load(Ordering::SeqCst),
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    generation: u64,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn check_open(&self) -> Result<(), EndpointError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EndpointError::Closed);
        }
        if self.shared.generation.load(Ordering::SeqCst) != self.generation {
            return Err(EndpointError::ConnectionLost(
                "connection reset by peer".to_owned(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl StreamConnection for MemoryConnection {
    async fn stream_properties(&self) -> Result<StreamProperties, EndpointError> {
        self.check_open()?;
        Ok(StreamProperties {
            name: self.shared.stream_name.clone(),
            partition_ids: (0..self.shared.partitions.len() as PartitionId).collect(),
        })
    }

    async fn partition_properties(
        &self,
        partition: PartitionId,
    ) -> Result<PartitionProperties, EndpointError> {
        self.check_open()?;
        let log = self.shared.log(partition)?;
        self.shared.apply_retention(log);
        let state = lock(&log.state);
        Ok(PartitionProperties {
            partition,
            earliest_offset: state.earliest,
            next_offset: state.next_offset(),
        })
    }

    async fn append(
        &self,
        target: &PartitionTarget,
        records: &[Record],
    ) -> Result<AppendAck, EndpointError> {
        self.check_open()?;
        if let Some(error) = lock(&self.shared.faults).append.pop_front() {
            return Err(error);
        }
        if records.is_empty() {
            return Err(EndpointError::InvalidRequest(
                "append requires at least one record".to_owned(),
            ));
        }
        let size = BATCH_FRAME_OVERHEAD + records.iter().map(Record::encoded_len).sum::<usize>();
        if size > self.shared.max_request_bytes {
            return Err(EndpointError::PayloadTooLarge {
                size,
                max: self.shared.max_request_bytes,
            });
        }

        let partition = self.shared.resolve(target)?;
        let log = self.shared.log(partition)?;
        let enqueued_at = OffsetDateTime::now_utc();
        let ack = {
            let mut state = lock(&log.state);
            let first_offset = state.next_offset();
            for (i, record) in records.iter().enumerate() {
                state.entries.push_back(ReceivedRecord {
                    partition,
                    offset: first_offset + i as u64,
                    enqueued_at,
                    record: record.clone(),
                });
            }
            AppendAck {
                partition,
                first_offset,
                last_offset: state.next_offset() - 1,
                enqueued_at,
            }
        };
        log.appended.notify_waiters();

        let delay = lock(&self.shared.delays).ack;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(ack)
    }

    async fn read(
        &self,
        partition: PartitionId,
        from: u64,
        max_records: usize,
        max_wait: Duration,
    ) -> Result<Vec<ReceivedRecord>, EndpointError> {
        let log = self.shared.log(partition)?;
        let deadline = tokio::time::Instant::now() + max_wait;

        loop {
            let appended = log.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            self.check_open()?;
            if let Some(error) = lock(&self.shared.faults).read.pop_front() {
                return Err(error);
            }
            self.shared.apply_retention(log);
            {
                let state = lock(&log.state);
                if from < state.earliest {
                    return Err(EndpointError::OffsetUnavailable {
                        partition,
                        requested: from,
                        earliest: state.earliest,
                    });
                }
                let skip = (from - state.earliest) as usize;
                let records: Vec<ReceivedRecord> = state
                    .entries
                    .iter()
                    .skip(skip)
                    .take(max_records.max(1))
                    .cloned()
                    .collect();
                if !records.is_empty() {
                    return Ok(records);
                }
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(secret: &str) -> AccessToken {
        AccessToken::new(secret, OffsetDateTime::now_utc() + Duration::from_secs(60))
    }

    #[tokio::test]
    async fn appends_assign_contiguous_offsets() {
        let endpoint = MemoryEndpoint::new("ns", "stream", 2);
        let connection = endpoint.connect(&token("any")).await.unwrap();

        let first = connection
            .append(&PartitionTarget::Id(1), &[Record::new("a"), Record::new("b")])
            .await
            .unwrap();
        let second = connection
            .append(&PartitionTarget::Id(1), &[Record::new("c")])
            .await
            .unwrap();

        assert_eq!((first.first_offset, first.last_offset), (0, 1));
        assert_eq!((second.first_offset, second.last_offset), (2, 2));
        let offsets: Vec<u64> = endpoint.records(1).iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 1, 2]);
        assert!(endpoint.records(0).is_empty());
    }

    #[tokio::test]
    async fn keyed_appends_stick_to_one_partition() {
        let endpoint = MemoryEndpoint::new("ns", "stream", 4);
        let connection = endpoint.connect(&token("any")).await.unwrap();
        let target = PartitionTarget::Key("user-1".to_owned());

        let first = connection.append(&target, &[Record::new("a")]).await.unwrap();
        let second = connection.append(&target, &[Record::new("b")]).await.unwrap();
        assert_eq!(first.partition, second.partition);
    }

    #[tokio::test]
    async fn rejects_wrong_secret() {
        let endpoint = MemoryEndpoint::builder("ns", "stream", 1).secret("right").build();

        let result = endpoint.connect(&token("wrong")).await;
        assert!(matches!(result, Err(EndpointError::Unauthorized(_))));
        assert!(endpoint.connect(&token("right")).await.is_ok());
    }

    #[tokio::test]
    async fn rejects_oversized_appends() {
        let endpoint = MemoryEndpoint::builder("ns", "stream", 1)
            .max_request_bytes(32)
            .build();
        let connection = endpoint.connect(&token("any")).await.unwrap();

        let result = connection
            .append(&PartitionTarget::Any, &[Record::new(vec![0u8; 64])])
            .await;
        assert!(matches!(result, Err(EndpointError::PayloadTooLarge { .. })));
        assert!(endpoint.records(0).is_empty());
    }

    #[tokio::test]
    async fn read_below_retained_range_is_unavailable() {
        let endpoint = MemoryEndpoint::new("ns", "stream", 1);
        let connection = endpoint.connect(&token("any")).await.unwrap();
        let records: Vec<Record> = (0..5).map(|i| Record::new(format!("{i}"))).collect();
        connection.append(&PartitionTarget::Id(0), &records).await.unwrap();

        assert_eq!(endpoint.truncate_before(0, 3), 3);
        let result = connection.read(0, 1, 10, Duration::ZERO).await;
        assert_eq!(
            result,
            Err(EndpointError::OffsetUnavailable {
                partition: 0,
                requested: 1,
                earliest: 3
            })
        );

        let remaining = connection.read(0, 3, 10, Duration::ZERO).await.unwrap();
        assert_eq!(remaining.len(), 2);
    }

    #[tokio::test]
    async fn read_waits_for_appends() {
        let endpoint = MemoryEndpoint::new("ns", "stream", 1);
        let reader = endpoint.connect(&token("any")).await.unwrap();
        let writer = endpoint.connect(&token("any")).await.unwrap();

        let read = tokio::spawn(async move { reader.read(0, 0, 10, Duration::from_secs(5)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        writer
            .append(&PartitionTarget::Id(0), &[Record::new("late")])
            .await
            .unwrap();

        let records = read.await.unwrap().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].body_as_str(), Some("late"));
    }

    #[tokio::test]
    async fn dropped_connections_report_loss() {
        let endpoint = MemoryEndpoint::new("ns", "stream", 1);
        let connection = endpoint.connect(&token("any")).await.unwrap();

        endpoint.drop_connections();
        let result = connection.stream_properties().await;
        assert!(matches!(result, Err(EndpointError::ConnectionLost(_))));

        let fresh = endpoint.connect(&token("any")).await.unwrap();
        assert!(fresh.stream_properties().await.is_ok());
        assert_eq!(endpoint.connections_opened(), 2);
    }
}
