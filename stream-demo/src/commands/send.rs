use std::time::Duration;

use clap::Args;
use stream_client::{PartitionTarget, Producer, Record};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::DemoContext;

const SEND_INTERVAL: Duration = Duration::from_millis(500);
const RECORDS_PER_BATCH: usize = 3;

#[derive(Args, Clone, Debug)]
pub struct SendArgs {
    /// Stop after this many batches instead of running until interrupted
    #[arg(long)]
    pub count: Option<u64>,
}

pub async fn run(ctx: &DemoContext, args: &SendArgs) -> anyhow::Result<()> {
    let producer = ctx.producer();
    let sent = send_loop(&producer, args.count, &ctx.cancel).await?;
    producer.close().await;
    info!(batches = sent, "sender stopped");
    Ok(())
}

/// Send a small batch every half second until `cancel` fires or `limit` batches went out.
pub async fn send_loop(
    producer: &Producer,
    limit: Option<u64>,
    cancel: &CancellationToken,
) -> anyhow::Result<u64> {
    let mut ticker = tokio::time::interval(SEND_INTERVAL);
    let mut sent = 0;

    while limit.map_or(true, |limit| sent < limit) {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut batch = producer.create_batch_for(PartitionTarget::Any);
        for i in 0..RECORDS_PER_BATCH {
            let record = Record::new(format!("Event {sent}.{i}"))
                .with_content_type("text/plain")
                .with_property("MessageType", "Periodic")
                .with_property("Sequence", sent as i64);
            if batch.try_add(record).is_err() {
                break;
            }
        }

        match producer.send_batch(batch.seal()).await {
            Ok(receipt) => info!(
                partition = receipt.partition,
                first_offset = receipt.first_offset,
                records = receipt.record_count,
                "batch sent"
            ),
            Err(stream_client::Error::Cancelled) => break,
            Err(e) => warn!(error = %e, "batch failed"),
        }
        sent += 1;
    }
    Ok(sent)
}
