use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use burrow_tunnel::{FdInterface, NoopProtector, TunnelConfig, TunnelEndpoint};

#[derive(Debug, Parser)]
#[command(name = "burrow-tunneld")]
#[command(author, version, about, long_about = None)]
struct TunneldArgs {
    /// Relay channel URL, e.g. ws://relay.example.net:3000/channel.
    #[arg(long)]
    relay_url: String,

    /// File descriptor of the established virtual interface, inherited
    /// from the platform integration that created it.
    #[arg(long)]
    tun_fd: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "burrow=info,burrow_tunneld=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    let args = TunneldArgs::parse();

    // The platform integration owns interface creation and passes the fd
    // down; from here on it belongs to the endpoint.
    let iface = unsafe { FdInterface::from_raw_fd(args.tun_fd) }
        .context("failed to adopt the virtual interface fd")?;

    let endpoint = TunnelEndpoint::new(
        Arc::new(iface),
        TunnelConfig {
            relay_url: args.relay_url,
        },
    );

    // A real deployment passes the platform's VPN-exempt socket protector
    // here; standalone runs have no tunnel routing to escape.
    endpoint.start(&NoopProtector).await?;

    let mut state = endpoint.state();
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("shutdown signal received");
        }
        _ = state.wait_for(|s| *s == burrow_tunnel::TunnelState::Disconnected) => {
            info!("tunnel disconnected");
        }
    }

    endpoint.stop().await;
    Ok(())
}
