//! Partition receiver.
//!
//! One receiver reads one partition on its own task and hands records to a [`RecordHandler`]
//! strictly in offset order, one at a time: the next record is only delivered once the
//! handler returned for the previous one.
//!
//! State transitions:
//!
//! - `Idle -> Connecting`: `start` was called.
//! - `Connecting -> Streaming`: the read cursor is established.
//! - `Streaming -> Connecting`: the connection dropped and is being re-established.
//! - `Streaming -> Idle`: `release` (revocation) or ownership loss.
//! - `Streaming -> Stopped`: `stop`, or the caller's cancellation token fired.
//! - `Streaming -> Faulted`: `stop_on_error`, a retention gap, or the retry budget ran out.
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::checkpoint::{CheckpointOutcome, CheckpointStore};
use crate::connection::{self, AttemptError};
use crate::credentials::CredentialProvider;
use crate::endpoint::{EndpointError, StreamConnection, StreamEndpoint};
use crate::error::{Error, Result};
use crate::metrics_consts::{ACTIVE_RECEIVERS, HANDLER_ERRORS, RECORDS_DELIVERED, RECORDS_SKIPPED};
use crate::record::{PartitionId, ReceivedRecord};
use crate::retry::RetryPolicy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReceiverState {
    Idle,
    Connecting,
    Streaming,
    Stopped,
    Faulted,
}

/// Where a receiver starts reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartPosition {
    /// Oldest retained record.
    Earliest,
    /// Only records appended after the cursor is established.
    Latest,
    /// This offset, inclusive.
    Offset(u64),
    /// Right after this offset. Used when resuming from a checkpoint.
    After(u64),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointPolicy {
    /// Only the handler checkpoints, through `PartitionContext::update_checkpoint`.
    Manual,
    /// Checkpoint after this many records or this much time, whichever comes first.
    Every { records: u32, interval: Duration },
}

#[derive(Clone, Debug)]
pub struct ReceiverConfig {
    /// Identity recorded as checkpoint owner.
    pub owner: String,
    pub consumer_group: String,
    /// Records fetched per read.
    pub prefetch: usize,
    /// How long a read waits for new records before checking for shutdown.
    pub max_wait: Duration,
    pub connect_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Fault the receiver on the first handler failure instead of moving on.
    pub stop_on_error: bool,
    pub checkpoint_policy: CheckpointPolicy,
    /// Checkpoint the last delivered record when the partition is released or stopped.
    pub checkpoint_on_release: bool,
    /// Give the partition up when another owner has checkpointed it since this receiver
    /// started. Group members leave this to the coordinator and keep reading, taking the
    /// checkpoint back at their next higher offset.
    pub release_on_conflict: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            owner: uuid::Uuid::now_v7().to_string(),
            consumer_group: "$Default".to_owned(),
            prefetch: 300,
            max_wait: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(30),
            retry_policy: RetryPolicy::default(),
            stop_on_error: false,
            checkpoint_policy: CheckpointPolicy::Manual,
            checkpoint_on_release: true,
            release_on_conflict: true,
        }
    }
}

/// Callbacks invoked by a receiver.
#[async_trait]
pub trait RecordHandler: Send + Sync {
    async fn on_record(&self, ctx: &PartitionContext, record: ReceivedRecord) -> anyhow::Result<()>;

    /// Called for handler failures and receiver level errors.
    async fn on_error(&self, ctx: &PartitionContext, error: &Error) {
        warn!(partition = ctx.partition(), error = %error, "error while receiving");
    }
}

/// What a handler knows about the partition it is being called for.
pub struct PartitionContext {
    partition: PartitionId,
    consumer_group: String,
    owner: String,
    store: Option<CheckpointStore>,
    started_at: OffsetDateTime,
    release_on_conflict: bool,
    last_checkpoint: Mutex<Option<u64>>,
    ownership_lost: AtomicBool,
}

impl PartitionContext {
    fn new(
        partition: PartitionId,
        config: &ReceiverConfig,
        store: Option<CheckpointStore>,
        resumed_after: Option<u64>,
    ) -> Self {
        Self {
            partition,
            consumer_group: config.consumer_group.clone(),
            owner: config.owner.clone(),
            store,
            started_at: OffsetDateTime::now_utc(),
            release_on_conflict: config.release_on_conflict,
            last_checkpoint: Mutex::new(resumed_after),
            ownership_lost: AtomicBool::new(false),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn consumer_group(&self) -> &str {
        &self.consumer_group
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Offset of the latest checkpoint this receiver wrote or resumed from.
    pub fn last_checkpoint(&self) -> Option<u64> {
        *self
            .last_checkpoint
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }

    /// Mark everything up to and including `record` as processed.
    pub async fn update_checkpoint(&self, record: &ReceivedRecord) -> Result<CheckpointOutcome> {
        if record.partition != self.partition {
            return Err(Error::invalid_state(format!(
                "record of partition {} checkpointed from partition {}",
                record.partition, self.partition
            )));
        }
        self.checkpoint(record.offset).await
    }

    fn covers(&self, offset: u64) -> bool {
        self.last_checkpoint().is_some_and(|checkpoint| offset <= checkpoint)
    }

    fn ownership_lost(&self) -> bool {
        self.ownership_lost.load(Ordering::SeqCst)
    }

    async fn checkpoint(&self, offset: u64) -> Result<CheckpointOutcome> {
        let Some(store) = &self.store else {
            return Err(Error::invalid_state("no checkpoint store configured"));
        };

        let outcome = store.update(self.partition, offset, &self.owner).await?;
        match &outcome {
            CheckpointOutcome::Accepted(_) => {
                let mut last = self
                    .last_checkpoint
                    .lock()
                    .unwrap_or_else(|poison| poison.into_inner());
                *last = Some(last.map_or(offset, |current| current.max(offset)));
            }
            // Someone else checkpointed this partition since we started: they own it now.
            CheckpointOutcome::Ignored { stored }
                if self.release_on_conflict && stored.updated_at >= self.started_at =>
            {
                self.ownership_lost.store(true, Ordering::SeqCst);
            }
            CheckpointOutcome::Ignored { .. } => {}
        }
        Ok(outcome)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shutdown {
    Release,
    Stop,
}

struct Running {
    partition: PartitionId,
    shutdown: watch::Sender<Option<Shutdown>>,
    handle: JoinHandle<Result<()>>,
}

/// Reads one partition at a time. See the module docs for the state machine.
pub struct PartitionReceiver {
    endpoint: Arc<dyn StreamEndpoint>,
    credentials: Arc<dyn CredentialProvider>,
    store: Option<CheckpointStore>,
    config: ReceiverConfig,
    cancel: CancellationToken,
    state: Arc<watch::Sender<ReceiverState>>,
    running: Option<Running>,
}

impl PartitionReceiver {
    pub fn new(
        endpoint: Arc<dyn StreamEndpoint>,
        credentials: Arc<dyn CredentialProvider>,
        config: ReceiverConfig,
    ) -> Self {
        let (state, _) = watch::channel(ReceiverState::Idle);
        Self {
            endpoint,
            credentials,
            store: None,
            config,
            cancel: CancellationToken::new(),
            state: Arc::new(state),
            running: None,
        }
    }

    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    /// Cancelling `cancel` stops the receiver and releases its connection.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn state(&self) -> ReceiverState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ReceiverState> {
        self.state.subscribe()
    }

    /// Partition currently assigned, if started.
    pub fn partition(&self) -> Option<PartitionId> {
        self.running.as_ref().map(|r| r.partition)
    }

    /// Start streaming `partition` from `position`. Returns once records can flow, or with
    /// the error that prevented it (the receiver is then `Idle` again).
    pub async fn start(
        &mut self,
        partition: PartitionId,
        position: StartPosition,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<()> {
        match self.state() {
            ReceiverState::Idle | ReceiverState::Faulted => {}
            ReceiverState::Stopped => return Err(Error::invalid_state("receiver was stopped")),
            state => {
                return Err(Error::invalid_state(format!(
                    "receiver is already {state:?} on partition {:?}",
                    self.partition()
                )))
            }
        }
        if let Some(previous) = self.running.take() {
            // A faulted worker already exited; collect it.
            let _result = previous.handle.await;
        }

        let resumed_after = match position {
            StartPosition::After(offset) => Some(offset),
            _ => None,
        };
        let ctx = PartitionContext::new(partition, &self.config, self.store.clone(), resumed_after);
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let (ready_tx, ready_rx) = oneshot::channel();

        let worker = Worker {
            partition,
            endpoint: self.endpoint.clone(),
            credentials: self.credentials.clone(),
            config: self.config.clone(),
            handler,
            ctx,
            state: self.state.clone(),
            cancel: self.cancel.child_token(),
            shutdown: shutdown_rx,
            last_delivered: None,
            since_checkpoint: 0,
            last_checkpoint_at: Instant::now(),
        };
        self.state.send_replace(ReceiverState::Connecting);
        let handle = tokio::spawn(worker.run(position, ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                self.running = Some(Running {
                    partition,
                    shutdown: shutdown_tx,
                    handle,
                });
                Ok(())
            }
            Ok(Err(error)) => {
                let _result = handle.await;
                self.state.send_replace(ReceiverState::Idle);
                Err(error)
            }
            Err(_) => match handle.await {
                Ok(Err(error)) => Err(error),
                Ok(Ok(())) => Err(Error::Cancelled),
                Err(_) => Err(Error::invalid_state("receiver task panicked")),
            },
        }
    }

    /// Finish the in-flight delivery, write the final checkpoint, and go back to `Idle`.
    pub async fn release(&mut self) -> Result<()> {
        self.shutdown(Shutdown::Release).await
    }

    /// Finish the in-flight delivery, write the final checkpoint, and stop for good.
    pub async fn stop(&mut self) -> Result<()> {
        let result = self.shutdown(Shutdown::Stop).await;
        self.state.send_replace(ReceiverState::Stopped);
        result
    }

    /// Wait for the worker to exit on its own: a fault, ownership loss or cancellation.
    pub async fn wait(&mut self) -> Result<()> {
        match self.running.take() {
            Some(running) => join(running.handle).await,
            None => Ok(()),
        }
    }

    async fn shutdown(&mut self, mode: Shutdown) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.shutdown.send_replace(Some(mode));
        join(running.handle).await
    }
}

async fn join(handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(_) => Err(Error::invalid_state("receiver task panicked")),
    }
}

enum Exit {
    Shutdown(Shutdown),
    OwnershipLost,
    Faulted(Error),
}

enum Delivery {
    Continue,
    OwnershipLost,
    Fault(Error),
}

struct Worker {
    partition: PartitionId,
    endpoint: Arc<dyn StreamEndpoint>,
    credentials: Arc<dyn CredentialProvider>,
    config: ReceiverConfig,
    handler: Arc<dyn RecordHandler>,
    ctx: PartitionContext,
    state: Arc<watch::Sender<ReceiverState>>,
    cancel: CancellationToken,
    shutdown: watch::Receiver<Option<Shutdown>>,
    last_delivered: Option<u64>,
    since_checkpoint: u32,
    last_checkpoint_at: Instant,
}

impl Worker {
    fn set_state(&self, state: ReceiverState) {
        self.state.send_replace(state);
    }

    fn pending_shutdown(&self) -> Option<Shutdown> {
        if self.cancel.is_cancelled() {
            return Some(Shutdown::Stop);
        }
        *self.shutdown.borrow()
    }

    async fn shutdown_requested(&mut self) -> Shutdown {
        tokio::select! {
            _ = self.cancel.cancelled() => Shutdown::Stop,
            requested = self.shutdown.wait_for(Option::is_some) => match requested {
                Ok(mode) => (*mode).unwrap_or(Shutdown::Stop),
                // The receiver handle is gone, nobody can release us any more.
                Err(_) => Shutdown::Stop,
            },
        }
    }

    async fn run(mut self, position: StartPosition, ready: oneshot::Sender<Result<()>>) -> Result<()> {
        let mut ready = Some(ready);
        let mut connection: Option<Box<dyn StreamConnection>> = None;
        let mut cursor: Option<u64> = None;
        let mut failures: u32 = 0;
        let mut last_error: Option<EndpointError> = None;

        let exit = 'stream: loop {
            if connection.is_none() {
                if failures > 0 {
                    if !self.config.retry_policy.should_retry(failures) {
                        let error = last_error
                            .take()
                            .map(Error::ConnectionLost)
                            .unwrap_or(Error::Cancelled);
                        if let Some(ready) = ready.take() {
                            let _sent = ready.send(Err(error));
                            return Ok(());
                        }
                        break 'stream Exit::Faulted(error);
                    }
                    let interval = self.config.retry_policy.retry_interval(
                        failures,
                        last_error.as_ref().and_then(EndpointError::retry_after),
                    );
                    tokio::select! {
                        mode = self.shutdown_requested() => break 'stream Exit::Shutdown(mode),
                        _ = tokio::time::sleep(interval) => {}
                    }
                }

                self.set_state(ReceiverState::Connecting);
                let position = cursor.map_or(position, StartPosition::Offset);
                match self.establish(position).await {
                    Ok((established, next)) => {
                        connection = Some(established);
                        cursor = Some(next);
                        failures = 0;
                        self.set_state(ReceiverState::Streaming);
                        metrics::gauge!(ACTIVE_RECEIVERS).increment(1.0);
                        info!(partition = self.partition, offset = next, "receiver streaming");
                        if let Some(ready) = ready.take() {
                            let _sent = ready.send(Ok(()));
                        }
                    }
                    Err(AttemptError::Terminal(Error::Cancelled)) => {
                        break 'stream Exit::Shutdown(self.pending_shutdown().unwrap_or(Shutdown::Stop))
                    }
                    Err(AttemptError::Endpoint(error)) if error.is_retryable() => {
                        warn!(partition = self.partition, attempt = failures + 1, error = %error, "connect failed");
                        failures += 1;
                        last_error = Some(error);
                    }
                    Err(failure) => {
                        let error = match failure {
                            AttemptError::Endpoint(error) => endpoint_failure(error),
                            AttemptError::Terminal(error) => error,
                        };
                        if let Some(ready) = ready.take() {
                            let _sent = ready.send(Err(error));
                            return Ok(());
                        }
                        break 'stream Exit::Faulted(error);
                    }
                }
                continue;
            }

            let (Some(conn), Some(next)) = (connection.as_ref(), cursor) else {
                break 'stream Exit::Faulted(Error::invalid_state("receiver cursor missing"));
            };
            let (partition, prefetch, max_wait) =
                (self.partition, self.config.prefetch, self.config.max_wait);
            let read = tokio::select! {
                biased;
                mode = self.shutdown_requested() => break 'stream Exit::Shutdown(mode),
                read = conn.read(partition, next, prefetch, max_wait) => read,
            };

            let records = match read {
                Ok(records) => records,
                Err(error) if error.is_retryable() => {
                    warn!(partition = self.partition, error = %error, "read failed, reconnecting");
                    if let Some(lost) = connection.take() {
                        lost.close().await;
                        metrics::gauge!(ACTIVE_RECEIVERS).decrement(1.0);
                    }
                    failures += 1;
                    last_error = Some(error);
                    continue;
                }
                Err(error) => break 'stream Exit::Faulted(endpoint_failure(error)),
            };

            if records.is_empty() {
                self.checkpoint_if_due().await;
                continue;
            }

            for record in records {
                let Some(expected) = cursor else { break };
                if record.offset < expected {
                    continue;
                }
                cursor = Some(record.offset + 1);
                if self.ctx.covers(record.offset) {
                    metrics::counter!(RECORDS_SKIPPED).increment(1);
                    continue;
                }

                match self.deliver(record).await {
                    Delivery::Continue => {}
                    Delivery::OwnershipLost => break 'stream Exit::OwnershipLost,
                    Delivery::Fault(error) => break 'stream Exit::Faulted(error),
                }
                if let Some(mode) = self.pending_shutdown() {
                    break 'stream Exit::Shutdown(mode);
                }
            }
        };

        let result = match exit {
            Exit::Shutdown(mode) => {
                if self.config.checkpoint_on_release {
                    self.final_checkpoint().await;
                }
                self.set_state(match mode {
                    Shutdown::Release => ReceiverState::Idle,
                    Shutdown::Stop => ReceiverState::Stopped,
                });
                info!(partition = self.partition, ?mode, "receiver shut down");
                Ok(())
            }
            Exit::OwnershipLost => {
                let error = Error::OwnershipLost(self.partition);
                warn!(partition = self.partition, "another owner checkpointed ahead of us, releasing");
                self.handler.on_error(&self.ctx, &error).await;
                self.set_state(ReceiverState::Idle);
                Ok(())
            }
            Exit::Faulted(error) => {
                warn!(partition = self.partition, error = %error, "receiver faulted");
                // Handler failures were reported when they happened.
                if !matches!(error, Error::Handler { .. }) {
                    self.handler.on_error(&self.ctx, &error).await;
                }
                self.set_state(ReceiverState::Faulted);
                Err(error)
            }
        };

        if let Some(connection) = connection.take() {
            connection.close().await;
            metrics::gauge!(ACTIVE_RECEIVERS).decrement(1.0);
        }
        if let Some(ready) = ready.take() {
            let _sent = ready.send(Err(Error::Cancelled));
        }
        result
    }

    /// Open a connection and turn `position` into the first offset to read.
    async fn establish(
        &self,
        position: StartPosition,
    ) -> std::result::Result<(Box<dyn StreamConnection>, u64), AttemptError> {
        let connection = connection::open(
            self.endpoint.as_ref(),
            self.credentials.as_ref(),
            self.config.connect_timeout,
            &self.cancel,
            "receiver",
        )
        .await?;

        let properties = match connection.partition_properties(self.partition).await {
            Ok(properties) => properties,
            Err(error) => {
                connection.close().await;
                return Err(AttemptError::Endpoint(error));
            }
        };
        let requested = match position {
            StartPosition::Earliest => properties.earliest_offset,
            StartPosition::Latest => properties.next_offset,
            StartPosition::Offset(offset) => offset,
            StartPosition::After(offset) => offset.saturating_add(1),
        };
        if requested < properties.earliest_offset {
            connection.close().await;
            return Err(AttemptError::Endpoint(EndpointError::OffsetUnavailable {
                partition: self.partition,
                requested,
                earliest: properties.earliest_offset,
            }));
        }

        debug!(partition = self.partition, ?position, requested, "read cursor established");
        Ok((connection, requested))
    }

    async fn deliver(&mut self, record: ReceivedRecord) -> Delivery {
        let offset = record.offset;
        let labels = [("partition", self.partition.to_string())];
        metrics::counter!(RECORDS_DELIVERED, &labels).increment(1);

        let result = self.handler.on_record(&self.ctx, record).await;
        self.last_delivered = Some(offset);

        if let Err(source) = result {
            metrics::counter!(HANDLER_ERRORS, &labels).increment(1);
            let error = Error::Handler { offset, source };
            self.handler.on_error(&self.ctx, &error).await;
            if self.config.stop_on_error {
                return Delivery::Fault(error);
            }
        }
        if self.ctx.ownership_lost() {
            return Delivery::OwnershipLost;
        }

        self.since_checkpoint += 1;
        self.checkpoint_if_due().await;
        Delivery::Continue
    }

    async fn checkpoint_if_due(&mut self) {
        let CheckpointPolicy::Every { records, interval } = self.config.checkpoint_policy else {
            return;
        };
        if self.since_checkpoint == 0 {
            return;
        }
        if self.since_checkpoint >= records || self.last_checkpoint_at.elapsed() >= interval {
            self.write_checkpoint().await;
        }
    }

    async fn final_checkpoint(&mut self) {
        if self.ctx.store.is_none() || self.ctx.ownership_lost() {
            return;
        }
        let Some(last) = self.last_delivered else {
            return;
        };
        if self.ctx.last_checkpoint().is_some_and(|checkpoint| checkpoint >= last) {
            return;
        }
        self.write_checkpoint().await;
    }

    async fn write_checkpoint(&mut self) {
        let Some(offset) = self.last_delivered else {
            return;
        };
        match self.ctx.checkpoint(offset).await {
            Ok(_) => {
                self.since_checkpoint = 0;
                self.last_checkpoint_at = Instant::now();
            }
            Err(error) => {
                warn!(partition = self.partition, offset, error = %error, "checkpoint failed");
                self.handler.on_error(&self.ctx, &error).await;
            }
        }
    }
}

fn endpoint_failure(error: EndpointError) -> Error {
    match error {
        EndpointError::OffsetUnavailable {
            partition,
            requested,
            earliest,
        } => Error::OffsetUnavailable {
            partition,
            requested,
            earliest,
        },
        error if error.is_connection_loss() => Error::ConnectionLost(error),
        error => Error::Endpoint(error),
    }
}
