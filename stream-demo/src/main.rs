//! Demonstration flows for the stream client, run against an in-process stream.
use anyhow::Context as _;
use clap::Parser;
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use stream_demo::commands::Cli;
use stream_demo::config::Config;
use stream_demo::context::DemoContext;
use stream_demo::metrics::{serve, setup_metrics_router};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(tracing::Level::INFO.into())
                .from_env_lossy(),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("failed to set tracing subscriber")?;

    let cli = Cli::parse();
    let config = Config::init_from_env().context("invalid configuration")?;

    if config.metrics_enabled {
        let router = setup_metrics_router().context("failed to install metrics recorder")?;
        let bind = config.bind();
        tokio::task::spawn(async move {
            if let Err(e) = serve(router, &bind).await {
                error!(error = %e, bind = %bind, "failed to serve metrics");
            }
        });
    }

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let ctx = DemoContext::new(config, cancel);
    cli.command.run(&ctx).await?;
    info!("all done");
    Ok(())
}
