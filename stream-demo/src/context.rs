use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use stream_client::checkpoint::{CheckpointStore, FileCheckpointBackend};
use stream_client::codec::{JsonSchemaEncoder, SchemaCatalog};
use stream_client::{
    ConsumerClient, ConsumerConfig, Coordinator, CoordinatorConfig, MemoryEndpoint, Producer,
    ProducerConfig, ReceiverConfig, RecordHandler, StartPosition, StaticCredential,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;

const TOKEN_LIFETIME: Duration = Duration::from_secs(3600);

/// Everything a demo flow needs: the in-process stream, credentials, checkpoint storage and
/// the process wide cancellation token.
pub struct DemoContext {
    pub config: Config,
    pub endpoint: MemoryEndpoint,
    pub credentials: Arc<StaticCredential>,
    pub encoder: JsonSchemaEncoder,
    pub cancel: CancellationToken,
}

impl DemoContext {
    pub fn new(config: Config, cancel: CancellationToken) -> Self {
        let endpoint = MemoryEndpoint::builder(
            &config.namespace,
            &config.stream_name,
            config.partition_count,
        )
        .secret(&config.access_key)
        .build();
        let credentials = Arc::new(StaticCredential::new(&*config.access_key, TOKEN_LIFETIME));
        let encoder = JsonSchemaEncoder::new(Arc::new(SchemaCatalog::new(&config.schema_group)));
        info!(
            namespace = %config.namespace,
            stream = %config.stream_name,
            partitions = config.partition_count,
            schema_registry = %config.schema_registry_endpoint,
            "demo stream ready"
        );

        Self {
            config,
            endpoint,
            credentials,
            encoder,
            cancel,
        }
    }

    pub fn producer(&self) -> Producer {
        Producer::new(
            Arc::new(self.endpoint.clone()),
            self.credentials.clone(),
            ProducerConfig {
                max_batch_size_bytes: self.config.max_batch_size_bytes,
                retry_policy: self.config.retry_policy(),
                connect_timeout: self.config.connect_timeout.0,
                send_timeout: self.config.send_timeout.0,
            },
        )
        .with_cancellation(self.cancel.child_token())
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            consumer_group: self.config.consumer_group.clone(),
            connect_timeout: self.config.connect_timeout.0,
            retry_policy: self.config.retry_policy(),
            ..Default::default()
        }
    }

    pub fn checkpoint_store(&self) -> CheckpointStore {
        let backend = FileCheckpointBackend::new(self.config.checkpoint_root());
        CheckpointStore::new(
            Arc::new(backend),
            &self.config.stream_name,
            &self.config.consumer_group,
        )
    }

    /// The in-process stream starts empty on every run, so checkpoints left by an earlier
    /// process can point past its end. Those are dropped.
    async fn discard_stale_checkpoints(&self, store: &CheckpointStore) -> anyhow::Result<()> {
        let mut next_offsets = Vec::new();
        for partition in 0..self.config.partition_count {
            let next = self
                .endpoint
                .records(partition)
                .last()
                .map_or(0, |r| r.offset + 1);
            next_offsets.push(next);
        }

        for checkpoint in store.list().await.context("failed to list checkpoints")? {
            let next = next_offsets
                .get(checkpoint.partition as usize)
                .copied()
                .unwrap_or(0);
            if checkpoint.offset >= next {
                warn!(
                    partition = checkpoint.partition,
                    offset = checkpoint.offset,
                    "discarding checkpoint ahead of the stream"
                );
                store.reset(checkpoint.partition).await?;
            } else {
                info!(
                    partition = checkpoint.partition,
                    offset = checkpoint.offset,
                    owner = %checkpoint.owner,
                    "resuming from checkpoint"
                );
            }
        }
        Ok(())
    }

    /// Run a single member consumer group over every partition until the demo is cancelled or
    /// `duration` elapsed.
    pub async fn run_group(
        &self,
        handler: Arc<dyn RecordHandler>,
        default_position: StartPosition,
        duration: Option<Duration>,
    ) -> anyhow::Result<()> {
        let store = self.checkpoint_store();
        self.discard_stale_checkpoints(&store).await?;

        let group_cancel = self.cancel.child_token();
        let coordinator = Arc::new(
            Coordinator::new(
                &self.config.consumer_group,
                (0..self.config.partition_count).collect(),
                CoordinatorConfig::default(),
            )
            .with_checkpoint_store(store.clone()),
        );
        let coordinator_task = tokio::spawn({
            let coordinator = coordinator.clone();
            let cancel = group_cancel.clone();
            async move { coordinator.run(cancel).await }
        });

        let consumer = Arc::new(
            ConsumerClient::new(
                Arc::new(self.endpoint.clone()),
                self.credentials.clone(),
                handler,
                ConsumerConfig {
                    receiver: self.receiver_config(),
                    default_position,
                    ..Default::default()
                },
            )
            .with_checkpoint_store(store),
        );
        info!(member = %consumer.member_id(), group = %self.config.consumer_group, "consumer starting");
        let consumer_task = tokio::spawn(consumer.clone().run(coordinator, group_cancel.clone()));

        match duration {
            Some(duration) => {
                tokio::select! {
                    _ = group_cancel.cancelled() => {}
                    _ = tokio::time::sleep(duration) => info!(?duration, "receive window elapsed"),
                }
            }
            None => group_cancel.cancelled().await,
        }
        group_cancel.cancel();

        consumer_task.await.context("consumer task failed")?;
        coordinator_task.await.context("coordinator task failed")?;
        Ok(())
    }
}
