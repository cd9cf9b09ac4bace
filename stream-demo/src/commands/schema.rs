use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Args;
use serde::Serialize;
use stream_client::codec::{SchemaDescriptor, SchemaEncoder};
use stream_client::{PartitionTarget, SendReceipt, StartPosition};
use tracing::info;

use crate::context::DemoContext;
use crate::handlers::SchemaHandler;

const USER_SCHEMA: &str = r#"{
    "type": "record",
    "name": "User",
    "namespace": "demo.stream",
    "fields": [
        {"name": "name", "type": "string"},
        {"name": "age", "type": "int"},
        {"name": "message", "type": "string"}
    ]
}"#;

#[derive(Serialize)]
struct User {
    name: String,
    age: u32,
    message: String,
}

impl User {
    fn numbered(i: u32) -> Self {
        Self {
            name: format!("User {i}"),
            age: 20 + i % 50,
            message: format!("Hello from user {i}"),
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct SchemaSendArgs {
    #[arg(long, default_value_t = 10)]
    pub count: u32,
}

#[derive(Args, Clone, Debug)]
pub struct SchemaRecvArgs {
    /// Users to send before receiving
    #[arg(long, default_value_t = 10)]
    pub count: u32,

    #[arg(long, default_value_t = 10)]
    pub seconds: u64,
}

pub async fn send(ctx: &DemoContext, args: &SchemaSendArgs) -> anyhow::Result<SendReceipt> {
    let schema = SchemaDescriptor::parse(USER_SCHEMA)?;
    let producer = ctx.producer();
    let mut batch = producer.create_batch_for(PartitionTarget::Any);

    for i in 0..args.count {
        let value = serde_json::to_value(User::numbered(i))?;
        let record = ctx
            .encoder
            .encode(&value, &schema)
            .await
            .context("failed to encode user")?
            .into_record()
            .with_property("MessageType", "User");
        if let Err(record) = batch.try_add(record) {
            anyhow::bail!("user record of {} bytes does not fit the batch", record.encoded_len());
        }
    }

    let receipt = producer
        .send_batch(batch.seal())
        .await
        .context("failed to send users")?;
    info!(
        users = receipt.record_count,
        partition = receipt.partition,
        schema_group = %ctx.encoder.catalog().group(),
        "users sent"
    );
    producer.close().await;
    Ok(receipt)
}

pub async fn recv(ctx: &DemoContext, args: &SchemaRecvArgs) -> anyhow::Result<()> {
    // Registers the schema, so the receiver can resolve the id in the content type.
    send(ctx, &SchemaSendArgs { count: args.count }).await?;

    let handler = Arc::new(SchemaHandler::new(ctx.encoder.clone()));
    ctx.run_group(
        handler.clone(),
        StartPosition::Earliest,
        Some(Duration::from_secs(args.seconds)),
    )
    .await?;
    info!(users = handler.received(), "users received");
    Ok(())
}
