use anyhow::Result;
use burrow_relay::{RelayConfig, RelayServer};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "burrow-relayd")]
#[command(author, version, about, long_about = None)]
struct RelaydArgs {
    /// TCP listen port for the relay channel and health endpoint.
    #[arg(long, env = "PORT", default_value_t = 3000)]
    port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burrow=info,burrow_relayd=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = RelaydArgs::parse();
    let server = RelayServer::bind(&RelayConfig { port: args.port }).await?;

    let shutdown = CancellationToken::new();
    let trigger = shutdown.clone();
    tokio::spawn(async move {
        let _ = signal::ctrl_c().await;
        info!("shutdown signal received");
        trigger.cancel();
    });

    server.serve(shutdown).await?;
    info!("relay stopped");
    Ok(())
}
