//! Tunnel endpoint lifecycle: the reader loop over the virtual interface
//! and the plumbing between synthesizer and relay channel.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use burrow_constants::net::IFACE_READ_BUF;
use burrow_net::TcpSegment;

use crate::channel::{RelayChannel, RelayLink};
use crate::error::TunnelError;
use crate::iface::{SocketProtector, VirtualInterface};
use crate::synth::TcpSynthesizer;

/// User-visible aggregate state of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Disconnected,
    Connecting,
    Connected,
    /// The relay channel could not be established.
    Error,
}

/// Tunnel endpoint configuration.
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    /// Relay channel URL, e.g. `ws://relay.example.net:3000/channel`.
    pub relay_url: String,
}

struct Running {
    channel: Arc<RelayChannel>,
    synth: Arc<TcpSynthesizer>,
    shutdown: CancellationToken,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Owns the virtual interface and runs the tunnel side.
pub struct TunnelEndpoint {
    iface: Arc<dyn VirtualInterface>,
    config: TunnelConfig,
    state_tx: watch::Sender<TunnelState>,
    running: Mutex<Option<Running>>,
}

impl TunnelEndpoint {
    /// Creates a stopped endpoint over an established virtual interface.
    #[must_use]
    pub fn new(iface: Arc<dyn VirtualInterface>, config: TunnelConfig) -> Self {
        let (state_tx, _) = watch::channel(TunnelState::Disconnected);
        Self {
            iface,
            config,
            state_tx,
            running: Mutex::new(None),
        }
    }

    /// A watch on the published tunnel state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<TunnelState> {
        self.state_tx.subscribe()
    }

    /// Opens the relay channel and starts the reader tasks.
    pub async fn start(&self, protector: &dyn SocketProtector) -> Result<(), TunnelError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(burrow_error::CommonError::invalid_state("tunnel already started").into());
        }

        self.state_tx.send_replace(TunnelState::Connecting);

        let (channel, resp_rx) = match RelayChannel::connect(&self.config.relay_url, protector).await
        {
            Ok(pair) => pair,
            Err(err) => {
                self.state_tx.send_replace(TunnelState::Error);
                return Err(err.into());
            }
        };

        let synth = Arc::new(TcpSynthesizer::new(
            Arc::clone(&channel) as Arc<dyn RelayLink>,
            Arc::clone(&self.iface),
        ));
        let shutdown = CancellationToken::new();

        let dispatcher = tokio::spawn(dispatch_responses(
            resp_rx,
            Arc::clone(&synth),
            Arc::clone(&self.iface),
            self.state_tx.clone(),
            shutdown.clone(),
        ));
        let reader = tokio::spawn(read_interface(
            Arc::clone(&self.iface),
            Arc::clone(&synth),
            Arc::clone(&channel),
            self.state_tx.clone(),
            shutdown.clone(),
        ));

        *running = Some(Running {
            channel,
            synth,
            shutdown,
            reader,
            dispatcher,
        });
        self.state_tx.send_replace(TunnelState::Connected);
        info!(url = %self.config.relay_url, "tunnel started");
        Ok(())
    }

    /// Stops the tunnel: closes the interface first to unblock the
    /// reader, then the channel, then clears the flow table.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        self.state_tx.send_replace(TunnelState::Disconnected);
        self.iface.close();
        running.shutdown.cancel();
        running.channel.close().await;
        running.reader.abort();
        running.dispatcher.abort();
        running.synth.flows().clear();
        info!("tunnel stopped");
    }
}

/// Reader loop: one complete datagram per `recv`, dispatched to the
/// synthesizer.
async fn read_interface(
    iface: Arc<dyn VirtualInterface>,
    synth: Arc<TcpSynthesizer>,
    channel: Arc<RelayChannel>,
    state_tx: watch::Sender<TunnelState>,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; IFACE_READ_BUF];
    loop {
        let read = tokio::select! {
            () = shutdown.cancelled() => break,
            read = iface.recv(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("virtual interface EOF");
                break;
            }
            Ok(len) => {
                let Some(segment) = TcpSegment::parse(&buf[..len]) else {
                    // Not IPv4 TCP: silently dropped.
                    continue;
                };
                synth.handle_inbound(segment).await;
            }
            Err(err) => {
                if !shutdown.is_cancelled() {
                    warn!("virtual interface read failed: {err}");
                }
                break;
            }
        }
    }

    // Reader death outside stop() is a teardown path of its own.
    if !shutdown.is_cancelled() {
        shutdown.cancel();
        state_tx.send_replace(TunnelState::Disconnected);
        synth.flows().clear();
        channel.close().await;
    }
}

/// Dispatches relay responses to the synthesizer. When the channel drops
/// mid-session the tunnel transitions to `Disconnected` and the virtual
/// interface is closed.
async fn dispatch_responses(
    mut resp_rx: tokio::sync::mpsc::Receiver<burrow_proto::Response>,
    synth: Arc<TcpSynthesizer>,
    iface: Arc<dyn VirtualInterface>,
    state_tx: watch::Sender<TunnelState>,
    shutdown: CancellationToken,
) {
    while let Some(resp) = resp_rx.recv().await {
        synth.handle_response(resp).await;
    }

    if !shutdown.is_cancelled() {
        debug!("relay channel dropped, stopping tunnel");
        shutdown.cancel();
        state_tx.send_replace(TunnelState::Disconnected);
        iface.close();
        synth.flows().clear();
    }
}
