use clap::{Parser, Subcommand};

use crate::context::DemoContext;

pub mod bulk;
pub mod demo;
pub mod recv;
pub mod schema;
pub mod send;

#[derive(Parser)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Send one batch of 3000 events, then read them back from the earliest position
    Demo,

    /// Send a small batch every half second until interrupted
    Send(send::SendArgs),

    /// Receive as a consumer group member, checkpointing after every record
    Recv(recv::RecvArgs),

    /// Send schema encoded `User` records
    SchemaSend(schema::SchemaSendArgs),

    /// Receive and decode schema encoded `User` records
    SchemaRecv(schema::SchemaRecvArgs),

    /// Send 1000 JSON events with properties through the spill-over batching sender
    BulkSend(bulk::BulkSendArgs),

    /// Receive for a fixed time window, with or without checkpointing
    BulkRecv(bulk::BulkRecvArgs),
}

impl Commands {
    pub async fn run(self, ctx: &DemoContext) -> anyhow::Result<()> {
        match self {
            Commands::Demo => demo::run(ctx).await,
            Commands::Send(args) => send::run(ctx, &args).await,
            Commands::Recv(args) => recv::run(ctx, &args).await,
            Commands::SchemaSend(args) => schema::send(ctx, &args).await.map(|_| ()),
            Commands::SchemaRecv(args) => schema::recv(ctx, &args).await,
            Commands::BulkSend(args) => bulk::send(ctx, &args).await.map(|_| ()),
            Commands::BulkRecv(args) => bulk::recv(ctx, &args).await,
        }
    }
}
