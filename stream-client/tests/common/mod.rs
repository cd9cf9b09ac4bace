#![allow(dead_code)]

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use stream_client::checkpoint::{CheckpointStore, MemoryCheckpointBackend};
use stream_client::retry::RetryPolicy;
use stream_client::{
    ConsumerConfig, Error, MemoryEndpoint, PartitionContext, PartitionId, ReceivedRecord,
    ReceiverConfig, RecordHandler, StartPosition, StaticCredential,
};

pub const NAMESPACE: &str = "demo.servicebus.local";
pub const STREAM: &str = "events";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(20);

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

// ── Component builders ──────────────────────────────────────────

pub fn endpoint(partitions: u32) -> MemoryEndpoint {
    MemoryEndpoint::builder(NAMESPACE, STREAM, partitions)
        .secret("integration")
        .build()
}

pub fn credentials() -> Arc<StaticCredential> {
    Arc::new(StaticCredential::new("integration", Duration::from_secs(3600)))
}

pub fn memory_store(consumer_group: &str) -> CheckpointStore {
    CheckpointStore::new(Arc::new(MemoryCheckpointBackend::new()), STREAM, consumer_group)
}

pub fn receiver_config(owner: &str) -> ReceiverConfig {
    ReceiverConfig {
        owner: owner.to_string(),
        max_wait: Duration::from_millis(20),
        retry_policy: RetryPolicy::build(2, Duration::from_millis(10))
            .max_attempts(5)
            .provide(),
        ..Default::default()
    }
}

pub fn consumer_config(owner: &str, default_position: StartPosition) -> ConsumerConfig {
    ConsumerConfig {
        receiver: receiver_config(owner),
        default_position,
        heartbeat_interval: Duration::from_millis(50),
    }
}

// ── Handlers ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub partition: PartitionId,
    pub offset: u64,
    pub body: String,
}

/// Remembers every record and optionally checkpoints after each one.
#[derive(Default)]
pub struct RecordingHandler {
    seen: Mutex<Vec<Seen>>,
    errors: Mutex<Vec<String>>,
    checkpoint_each: bool,
    pause_at: Option<(u64, Duration)>,
}

impl RecordingHandler {
    pub fn checkpointing() -> Self {
        Self {
            checkpoint_each: true,
            ..Default::default()
        }
    }

    /// Hold the record at `offset` for `delay` before finishing it.
    pub fn pausing_at(mut self, offset: u64, delay: Duration) -> Self {
        self.pause_at = Some((offset, delay));
        self
    }

    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().unwrap().clone()
    }

    pub fn bodies(&self) -> Vec<String> {
        self.seen().into_iter().map(|s| s.body).collect()
    }

    pub fn offsets_for(&self, partition: PartitionId) -> Vec<u64> {
        self.seen()
            .into_iter()
            .filter(|s| s.partition == partition)
            .map(|s| s.offset)
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }
}

#[async_trait]
impl RecordHandler for RecordingHandler {
    async fn on_record(&self, ctx: &PartitionContext, record: ReceivedRecord) -> anyhow::Result<()> {
        self.seen.lock().unwrap().push(Seen {
            partition: record.partition,
            offset: record.offset,
            body: record.body_as_str().unwrap_or_default().to_string(),
        });
        if let Some((offset, delay)) = self.pause_at {
            if record.offset == offset {
                tokio::time::sleep(delay).await;
            }
        }
        if self.checkpoint_each {
            ctx.update_checkpoint(&record).await?;
        }
        Ok(())
    }

    async fn on_error(&self, _ctx: &PartitionContext, error: &Error) {
        self.errors.lock().unwrap().push(error.kind().to_string());
    }
}
