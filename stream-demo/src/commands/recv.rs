use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use stream_client::StartPosition;
use tracing::info;

use crate::commands::send::send_loop;
use crate::context::DemoContext;
use crate::handlers::PrintingHandler;

#[derive(Args, Clone, Debug)]
pub struct RecvArgs {
    /// Start partitions without a checkpoint from the earliest record instead of the latest
    #[arg(long)]
    pub from_start: bool,

    /// Stop after this many seconds instead of running until interrupted
    #[arg(long)]
    pub seconds: Option<u64>,

    /// Do not run the periodic sender alongside the consumer
    #[arg(long)]
    pub no_traffic: bool,
}

pub async fn run(ctx: &DemoContext, args: &RecvArgs) -> anyhow::Result<()> {
    let position = if args.from_start {
        StartPosition::Earliest
    } else {
        StartPosition::Latest
    };

    // The stream lives in this process, so the receiver brings its own traffic.
    let traffic = (!args.no_traffic).then(|| {
        let producer = ctx.producer();
        let cancel = ctx.cancel.child_token();
        let stop = cancel.clone();
        let task = tokio::spawn(async move {
            let sent = send_loop(&producer, None, &cancel).await;
            producer.close().await;
            sent
        });
        (task, stop)
    });

    let handler = Arc::new(PrintingHandler::new(true));
    let result = ctx
        .run_group(handler.clone(), position, args.seconds.map(Duration::from_secs))
        .await;

    if let Some((task, stop)) = traffic {
        stop.cancel();
        let sent = task.await??;
        info!(batches = sent, "traffic stopped");
    }
    info!(received = handler.received(), "receiver stopped");
    result
}
