use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use serde_json::json;
use stream_client::{BatchingSender, PartitionTarget, Record, SendReceipt, StartPosition};
use time::OffsetDateTime;
use tracing::info;

use crate::context::DemoContext;
use crate::handlers::PrintingHandler;

#[derive(Args, Clone, Debug)]
pub struct BulkSendArgs {
    #[arg(long, default_value_t = 1000)]
    pub count: u32,
}

#[derive(Args, Clone, Debug)]
pub struct BulkRecvArgs {
    /// How long to receive before shutting down
    #[arg(long, default_value_t = 45)]
    pub seconds: u64,

    /// Receive without writing checkpoints
    #[arg(long)]
    pub no_checkpoint: bool,

    /// Events to send before receiving
    #[arg(long, default_value_t = 1000)]
    pub count: u32,
}

fn bulk_record(sequence: u32) -> Record {
    let body = json!({
        "id": uuid::Uuid::now_v7(),
        "sequence": sequence,
        "timestamp": OffsetDateTime::now_utc().unix_timestamp(),
        "payload": format!("Bulk event {sequence}"),
    });
    Record::new(body.to_string())
        .with_content_type("application/json")
        .with_property("MessageType", "Bulk")
        .with_property("Sequence", sequence)
}

pub async fn send(ctx: &DemoContext, args: &BulkSendArgs) -> anyhow::Result<Vec<SendReceipt>> {
    let producer = ctx.producer();
    let mut sender = BatchingSender::new(&producer, PartitionTarget::Any);
    for sequence in 0..args.count {
        sender.add(bulk_record(sequence)).await?;
    }
    let receipts = sender.finish().await?;
    producer.close().await;

    info!(
        events = args.count,
        batches = receipts.len(),
        "bulk send finished"
    );
    Ok(receipts)
}

pub async fn recv(ctx: &DemoContext, args: &BulkRecvArgs) -> anyhow::Result<()> {
    send(ctx, &BulkSendArgs { count: args.count }).await?;

    let handler = Arc::new(PrintingHandler::new(!args.no_checkpoint).quiet());
    ctx.run_group(
        handler.clone(),
        StartPosition::Earliest,
        Some(Duration::from_secs(args.seconds)),
    )
    .await?;
    info!(
        received = handler.received(),
        checkpointing = !args.no_checkpoint,
        "bulk receive finished"
    );
    Ok(())
}
