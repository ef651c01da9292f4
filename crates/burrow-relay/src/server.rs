//! Relay channel server: websocket upgrade plus a health endpoint.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::WebSocketUpgrade;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

use burrow_constants::channel::CHANNEL_PATH;
use burrow_constants::ports::DEFAULT_RELAY_PORT;

use crate::error::RelayError;
use crate::manager;

/// Relay server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// TCP listen port.
    pub port: u16,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_RELAY_PORT,
        }
    }
}

impl RelayConfig {
    /// Reads the configuration from the environment (`PORT`).
    #[must_use]
    pub fn from_env() -> Self {
        let port = std::env::var("PORT")
            .ok()
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(DEFAULT_RELAY_PORT);
        Self { port }
    }
}

/// Monotonic id for tracing spans; channels have no other identity.
static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// The relay host server.
///
/// Each accepted channel runs its own manager; channels share nothing.
pub struct RelayServer {
    listener: TcpListener,
}

impl RelayServer {
    /// Binds the listen socket.
    pub async fn bind(config: &RelayConfig) -> Result<Self, RelayError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %listener.local_addr()?, "relay listening");
        Ok(Self { listener })
    }

    /// The bound address (useful when the port was 0).
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves channels until `shutdown` fires.
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        axum::serve(self.listener, router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;
        Ok(())
    }
}

fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route(CHANNEL_PATH, get(upgrade_channel))
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn upgrade_channel(ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(|socket| {
        let channel_id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        manager::run_channel(socket).instrument(tracing::info_span!("channel", channel_id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn health_reports_ok() {
        let Json(body) = health().await;
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn bind_on_ephemeral_port_reports_address() {
        let server = RelayServer::bind(&RelayConfig { port: 0 }).await.expect("bind");
        let addr = server.local_addr().expect("addr");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn config_defaults_to_port_3000() {
        assert_eq!(RelayConfig::default().port, 3000);
    }
}
