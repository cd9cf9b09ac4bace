use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore};
use crate::coordinator::{Coordinator, PartitionOwner};
use crate::credentials::CredentialProvider;
use crate::endpoint::StreamEndpoint;
use crate::error::{Error, Result};
use crate::receiver::{PartitionReceiver, ReceiverConfig, ReceiverState, RecordHandler, StartPosition};
use crate::record::PartitionId;

#[derive(Clone, Debug)]
pub struct ConsumerConfig {
    /// Settings shared by every partition receiver. `receiver.owner` is the member id.
    pub receiver: ReceiverConfig,
    /// Where a partition without a checkpoint starts.
    pub default_position: StartPosition,
    pub heartbeat_interval: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            receiver: ReceiverConfig::default(),
            default_position: StartPosition::Latest,
            heartbeat_interval: Duration::from_secs(5),
        }
    }
}

/// A consumer group member: runs one [`PartitionReceiver`] per partition the coordinator
/// assigns to it, all feeding the same handler.
pub struct ConsumerClient {
    endpoint: Arc<dyn StreamEndpoint>,
    credentials: Arc<dyn CredentialProvider>,
    store: Option<CheckpointStore>,
    handler: Arc<dyn RecordHandler>,
    config: ConsumerConfig,
    cancel: CancellationToken,
    receivers: Mutex<HashMap<PartitionId, PartitionReceiver>>,
    /// Partitions whose receiver left the streaming states.
    exits: mpsc::UnboundedSender<PartitionId>,
    exited: Mutex<Option<mpsc::UnboundedReceiver<PartitionId>>>,
}

impl ConsumerClient {
    pub fn new(
        endpoint: Arc<dyn StreamEndpoint>,
        credentials: Arc<dyn CredentialProvider>,
        handler: Arc<dyn RecordHandler>,
        config: ConsumerConfig,
    ) -> Self {
        let (exits, exited) = mpsc::unbounded_channel();
        Self {
            endpoint,
            credentials,
            store: None,
            handler,
            config,
            cancel: CancellationToken::new(),
            receivers: Mutex::new(HashMap::new()),
            exits,
            exited: Mutex::new(Some(exited)),
        }
    }

    pub fn with_checkpoint_store(mut self, store: CheckpointStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn member_id(&self) -> &str {
        &self.config.receiver.owner
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Partitions this member is currently reading.
    pub async fn owned_partitions(&self) -> Vec<PartitionId> {
        let mut owned: Vec<PartitionId> = self.receivers.lock().await.keys().copied().collect();
        owned.sort_unstable();
        owned
    }

    /// Partition ids of the stream, straight from the endpoint.
    pub async fn partition_ids(&self) -> Result<Vec<PartitionId>> {
        let token = self.credentials.get_token().await?;
        let connection = self.endpoint.connect(&token).await.map_err(Error::Endpoint)?;
        let properties = connection.stream_properties().await;
        connection.close().await;
        Ok(properties.map_err(Error::Endpoint)?.partition_ids)
    }

    /// Join `coordinator` and keep heartbeating until `cancel` fires, then stop every receiver
    /// and leave the group. Partitions whose receiver faults or gives up are handed back to the
    /// coordinator for reassignment.
    pub async fn run(self: Arc<Self>, coordinator: Arc<Coordinator>, cancel: CancellationToken) {
        let member_id = self.member_id().to_owned();
        coordinator.join(&member_id, self.clone());

        let mut exited = self.exited.lock().await.take();
        let mut ticker = tokio::time::interval(self.config.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(partition) = next_exit(&mut exited) => {
                    self.reclaim(&coordinator, partition).await;
                }
                _ = ticker.tick() => {
                    if let Err(e) = coordinator.heartbeat(&member_id) {
                        warn!(member = %member_id, error = %e, "heartbeat rejected, rejoining");
                        coordinator.join(&member_id, self.clone());
                    }
                }
            }
        }

        self.shutdown().await;
        coordinator.leave(&member_id);
        info!(member = %member_id, "consumer left the group");
    }

    /// Stop every receiver, writing their final checkpoints.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let receivers: Vec<(PartitionId, PartitionReceiver)> =
            self.receivers.lock().await.drain().collect();
        for (partition, mut receiver) in receivers {
            if let Err(e) = receiver.stop().await {
                warn!(partition, error = %e, "receiver stopped with an error");
            }
        }
    }

    /// Collect a receiver that stopped on its own and give its partition back.
    async fn reclaim(&self, coordinator: &Coordinator, partition: PartitionId) {
        let receiver = {
            let mut receivers = self.receivers.lock().await;
            // Revoked or replaced receivers are no longer ours to clean up.
            match receivers.get(&partition).map(PartitionReceiver::state) {
                Some(ReceiverState::Idle | ReceiverState::Faulted) => receivers.remove(&partition),
                _ => None,
            }
        };
        let Some(mut receiver) = receiver else {
            return;
        };

        match receiver.wait().await {
            Ok(()) => info!(member = %self.member_id(), partition, "receiver gave up its partition"),
            Err(e) => warn!(member = %self.member_id(), partition, error = %e, "receiver failed"),
        }
        coordinator.release_partition(self.member_id(), partition);
    }

    fn watch_receiver(&self, partition: PartitionId, mut state: watch::Receiver<ReceiverState>) {
        let exits = self.exits.clone();
        tokio::spawn(async move {
            let ended = state
                .wait_for(|current| {
                    matches!(
                        current,
                        ReceiverState::Idle | ReceiverState::Faulted | ReceiverState::Stopped
                    )
                })
                .await
                .is_ok();
            if ended {
                let _sent = exits.send(partition);
            }
        });
    }

    async fn start_receiver(
        &self,
        receiver: &mut PartitionReceiver,
        partition: PartitionId,
        position: StartPosition,
    ) -> Result<()> {
        match receiver.start(partition, position, self.handler.clone()).await {
            Err(Error::OffsetUnavailable {
                requested, earliest, ..
            }) => {
                warn!(
                    partition,
                    requested, earliest, "checkpoint is older than retention, starting from earliest"
                );
                receiver
                    .start(partition, StartPosition::Earliest, self.handler.clone())
                    .await
            }
            result => result,
        }
    }
}

#[async_trait]
impl PartitionOwner for ConsumerClient {
    async fn assign(&self, partition: PartitionId, checkpoint: Option<Checkpoint>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut receivers = self.receivers.lock().await;
        if receivers.contains_key(&partition) {
            return Ok(());
        }

        // Ownership disputes are settled by the coordinator, not by checkpoint races.
        let config = ReceiverConfig {
            release_on_conflict: false,
            ..self.config.receiver.clone()
        };
        let mut receiver =
            PartitionReceiver::new(self.endpoint.clone(), self.credentials.clone(), config)
                .with_cancellation(self.cancel.child_token());
        if let Some(store) = &self.store {
            receiver = receiver.with_checkpoint_store(store.clone());
        }

        let position = checkpoint
            .as_ref()
            .map_or(self.config.default_position, |c| StartPosition::After(c.offset));
        self.start_receiver(&mut receiver, partition, position).await?;
        info!(member = %self.member_id(), partition, ?position, "partition receiver started");
        self.watch_receiver(partition, receiver.subscribe());
        receivers.insert(partition, receiver);
        Ok(())
    }

    async fn revoke(&self, partition: PartitionId) -> Result<()> {
        let receiver = self.receivers.lock().await.remove(&partition);
        let Some(mut receiver) = receiver else {
            return Ok(());
        };
        // A receiver that already faulted has nothing left to hand over.
        if let Err(e) = receiver.release().await {
            warn!(partition, error = %e, "receiver ended with an error before revocation");
        }
        info!(member = %self.member_id(), partition, "partition released");
        Ok(())
    }
}

async fn next_exit(exited: &mut Option<mpsc::UnboundedReceiver<PartitionId>>) -> Option<PartitionId> {
    match exited {
        Some(exited) => exited.recv().await,
        None => std::future::pending().await,
    }
}
