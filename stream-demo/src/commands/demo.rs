use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use stream_client::{PartitionReceiver, PartitionTarget, Record, StartPosition};
use tracing::info;

use crate::context::DemoContext;
use crate::handlers::PrintingHandler;

const DEMO_EVENTS: usize = 3000;
const RECEIVE_TIMEOUT: Duration = Duration::from_secs(30);

pub async fn run(ctx: &DemoContext) -> anyhow::Result<()> {
    let producer = ctx.producer();
    let mut batch = producer.create_batch_for(PartitionTarget::Id(0));
    for i in 0..DEMO_EVENTS {
        if let Err(record) = batch.try_add(Record::new(format!("Event from demo - {i}"))) {
            bail!(
                "record of {} bytes did not fit the batch after {} events",
                record.encoded_len(),
                batch.len()
            );
        }
    }
    info!(events = batch.len(), bytes = batch.size_bytes(), "sending batch");
    let receipt = producer
        .send_batch(batch.seal())
        .await
        .context("failed to send the demo batch")?;
    info!(
        partition = receipt.partition,
        first_offset = receipt.first_offset,
        last_offset = receipt.last_offset,
        "batch acknowledged"
    );
    producer.close().await;

    let handler = Arc::new(PrintingHandler::new(false));
    let mut receiver = PartitionReceiver::new(
        Arc::new(ctx.endpoint.clone()),
        ctx.credentials.clone(),
        ctx.receiver_config(),
    )
    .with_cancellation(ctx.cancel.child_token());
    receiver
        .start(receipt.partition, StartPosition::Earliest, handler.clone())
        .await
        .context("failed to start the receiver")?;

    let deadline = tokio::time::Instant::now() + RECEIVE_TIMEOUT;
    while handler.received() < DEMO_EVENTS as u64 && tokio::time::Instant::now() < deadline {
        tokio::select! {
            _ = ctx.cancel.cancelled() => break,
            _ = tokio::time::sleep(Duration::from_millis(100)) => {}
        }
    }
    receiver.stop().await?;

    info!(received = handler.received(), "demo finished");
    Ok(())
}
