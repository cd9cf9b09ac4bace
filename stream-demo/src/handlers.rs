use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use stream_client::codec::{JsonSchemaEncoder, SchemaEncoder};
use stream_client::{Error, PartitionContext, ReceivedRecord, RecordHandler};
use tracing::{info, warn};

/// Prints every record, optionally checkpointing after each one.
pub struct PrintingHandler {
    checkpoint: bool,
    quiet: bool,
    received: AtomicU64,
}

impl PrintingHandler {
    pub fn new(checkpoint: bool) -> Self {
        Self {
            checkpoint,
            quiet: false,
            received: AtomicU64::new(0),
        }
    }

    /// Count records without printing each one.
    pub fn quiet(mut self) -> Self {
        self.quiet = true;
        self
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordHandler for PrintingHandler {
    async fn on_record(&self, ctx: &PartitionContext, record: ReceivedRecord) -> anyhow::Result<()> {
        let count = self.received.fetch_add(1, Ordering::Relaxed) + 1;
        if !self.quiet {
            let properties: Vec<String> = record
                .record
                .properties()
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect();
            println!(
                "[partition {} offset {}] {} {}",
                record.partition,
                record.offset,
                record.body_as_str().unwrap_or("<binary>"),
                properties.join(" ")
            );
        } else if count % 100 == 0 {
            info!(received = count, "records received");
        }

        if self.checkpoint {
            ctx.update_checkpoint(&record).await?;
        }
        Ok(())
    }

    async fn on_error(&self, ctx: &PartitionContext, error: &Error) {
        warn!(partition = ctx.partition(), error = %error, "receive error");
    }
}

/// Decodes schema encoded payloads before printing them.
pub struct SchemaHandler {
    encoder: JsonSchemaEncoder,
    received: AtomicU64,
}

impl SchemaHandler {
    pub fn new(encoder: JsonSchemaEncoder) -> Self {
        Self {
            encoder,
            received: AtomicU64::new(0),
        }
    }

    pub fn received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl RecordHandler for SchemaHandler {
    async fn on_record(&self, ctx: &PartitionContext, record: ReceivedRecord) -> anyhow::Result<()> {
        let content_type = record.content_type().unwrap_or("application/octet-stream");
        let user = self.encoder.decode(record.body(), content_type).await?;
        self.received.fetch_add(1, Ordering::Relaxed);
        println!(
            "[partition {} offset {}] {}",
            record.partition, record.offset, user
        );
        ctx.update_checkpoint(&record).await?;
        Ok(())
    }
}
