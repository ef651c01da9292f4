//! Relay channel client.
//!
//! One persistent websocket to the relay host. Every message is one
//! binary frame from `burrow-proto`. Outbound frames funnel through a
//! writer task; a reader task matches `Connected`/`Error` replies to
//! pending connect waiters and forwards everything else to the response
//! dispatcher. A keepalive task pings every 30 s.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{lookup_host, TcpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_tungstenite::client_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Message, Utf8Bytes};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use burrow_constants::channel::{CONNECT_REPLY_TIMEOUT, KEEPALIVE_INTERVAL};
use burrow_constants::ports::DEFAULT_RELAY_PORT;
use burrow_error::CommonError;
use burrow_proto::{Request, Response};

use crate::error::ChannelError;
use crate::iface::SocketProtector;

/// Reply delivered to a pending connect waiter.
enum ConnectReply {
    Connected,
    Failed(String),
}

type WaiterMap = Arc<Mutex<HashMap<String, oneshot::Sender<ConnectReply>>>>;

/// The requests the synthesizer issues toward the relay host.
///
/// `RelayChannel` is the production implementation; tests substitute a
/// scripted one.
#[async_trait]
pub trait RelayLink: Send + Sync {
    /// Opens the real connection for a flow. Synchronous from the
    /// caller's perspective: resolves when the matching `Connected` or
    /// `Error` reply arrives, or after 10 s with a timeout error.
    async fn connect_flow(
        &self,
        id: &str,
        dest_ip: Ipv4Addr,
        dest_port: u16,
    ) -> Result<(), ChannelError>;

    /// Forwards client payload bytes. Fire-and-forget.
    async fn send_data(&self, id: &str, payload: Bytes) -> Result<(), ChannelError>;

    /// Tears down the real connection. Fire-and-forget.
    async fn send_disconnect(&self, id: &str) -> Result<(), ChannelError>;

    /// Half-closes the write side of the real connection. Fire-and-forget.
    async fn send_shutdown_write(&self, id: &str) -> Result<(), ChannelError>;
}

/// Client half of the relay channel.
pub struct RelayChannel {
    writer_tx: mpsc::Sender<Message>,
    waiters: WaiterMap,
    closed: CancellationToken,
}

impl RelayChannel {
    /// Connects to the relay host at `url` (`ws://host:port/channel`).
    ///
    /// The underlying TCP socket is passed to `protector` before
    /// connecting so the channel itself bypasses the tunnel routing.
    ///
    /// Returns the channel handle plus the stream of responses not
    /// consumed by connect waiters (`Data`, `Disconnected`, and stray
    /// `Connected`/`Error`); the caller dispatches those to the
    /// synthesizer. The receiver yields `None` once the channel is gone.
    pub async fn connect(
        url: &str,
        protector: &dyn SocketProtector,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Response>), ChannelError> {
        let request = url.into_client_request()?;
        let uri = request.uri();
        if uri.scheme_str() != Some("ws") {
            return Err(CommonError::config(format!(
                "unsupported relay URL scheme in {url:?} (only ws:// is supported)"
            ))
            .into());
        }
        let host = uri
            .host()
            .ok_or_else(|| CommonError::config(format!("relay URL {url:?} has no host")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(DEFAULT_RELAY_PORT);

        let addr = lookup_host((host.as_str(), port))
            .await?
            .find(std::net::SocketAddr::is_ipv4)
            .ok_or_else(|| {
                CommonError::config(format!("relay host {host:?} has no IPv4 address"))
            })?;

        let socket = TcpSocket::new_v4()?;
        protector.protect(socket.as_raw_fd())?;
        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;

        let (ws, _handshake) = client_async(request, stream).await?;
        debug!(%addr, "relay channel established");

        let (mut ws_sink, mut ws_stream) = ws.split();
        let (writer_tx, mut writer_rx) = mpsc::channel::<Message>(256);
        let (resp_tx, resp_rx) = mpsc::channel::<Response>(256);

        let waiters: WaiterMap = Arc::new(Mutex::new(HashMap::new()));
        let closed = CancellationToken::new();

        let channel = Arc::new(Self {
            writer_tx: writer_tx.clone(),
            waiters: Arc::clone(&waiters),
            closed: closed.clone(),
        });

        // Writer: the single point that touches the websocket sink.
        {
            let closed = closed.clone();
            let waiters = Arc::clone(&waiters);
            tokio::spawn(async move {
                while let Some(msg) = writer_rx.recv().await {
                    let is_close = matches!(msg, Message::Close(_));
                    if let Err(err) = ws_sink.send(msg).await {
                        debug!("relay channel write failed: {err}");
                        break;
                    }
                    if is_close {
                        let _ = ws_sink.flush().await;
                        break;
                    }
                }
                mark_closed(&closed, &waiters);
            });
        }

        // Reader: waiter fulfillment and response forwarding.
        {
            let closed = closed.clone();
            let waiters = Arc::clone(&waiters);
            tokio::spawn(async move {
                loop {
                    let msg = tokio::select! {
                        () = closed.cancelled() => break,
                        msg = ws_stream.next() => msg,
                    };
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            match Response::decode(data) {
                                Ok(resp) => {
                                    dispatch_response(resp, &waiters, &resp_tx).await;
                                }
                                Err(err) => warn!("dropping malformed response frame: {err}"),
                            }
                        }
                        Some(Ok(Message::Close(frame))) => {
                            debug!(?frame, "relay channel closed by host");
                            break;
                        }
                        Some(Ok(_)) => {} // ping/pong handled by the protocol layer
                        Some(Err(err)) => {
                            debug!("relay channel read failed: {err}");
                            break;
                        }
                        None => break,
                    }
                }
                mark_closed(&closed, &waiters);
                // Dropping resp_tx ends the dispatcher.
            });
        }

        // Keepalive: 30 s idle ping.
        {
            let closed = closed.clone();
            let writer_tx = writer_tx.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
                ticker.tick().await; // the immediate first tick
                loop {
                    tokio::select! {
                        () = closed.cancelled() => break,
                        _ = ticker.tick() => {
                            if writer_tx.send(Message::Ping(Bytes::new())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }

        Ok((channel, resp_rx))
    }

    /// True once the channel is gone (either side closed it).
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Sends a clean close (code 1000) and fails all pending waiters.
    pub async fn close(&self) {
        let frame = Message::Close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: Utf8Bytes::from_static("tunnel stopped"),
        }));
        let _ = self.writer_tx.send(frame).await;
        mark_closed(&self.closed, &self.waiters);
    }

    async fn send_frame(&self, request: Request) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }
        self.writer_tx
            .send(Message::Binary(request.encode()))
            .await
            .map_err(|_| ChannelError::Closed)
    }
}

#[async_trait]
impl RelayLink for RelayChannel {
    async fn connect_flow(
        &self,
        id: &str,
        dest_ip: Ipv4Addr,
        dest_port: u16,
    ) -> Result<(), ChannelError> {
        if self.closed.is_cancelled() {
            return Err(ChannelError::Closed);
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        self.waiters
            .lock()
            .expect("waiter map poisoned")
            .insert(id.to_string(), reply_tx);

        let request = Request::Connect {
            id: id.to_string(),
            dest_ip,
            dest_port,
        };
        if let Err(err) = self.send_frame(request).await {
            self.waiters.lock().expect("waiter map poisoned").remove(id);
            return Err(err);
        }

        match timeout(CONNECT_REPLY_TIMEOUT, reply_rx).await {
            Ok(Ok(ConnectReply::Connected)) => Ok(()),
            Ok(Ok(ConnectReply::Failed(message))) => Err(ChannelError::ConnectFailed(message)),
            // Waiter dropped without a reply: the channel went away.
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                self.waiters.lock().expect("waiter map poisoned").remove(id);
                Err(ChannelError::ConnectFailed("timeout".to_string()))
            }
        }
    }

    async fn send_data(&self, id: &str, payload: Bytes) -> Result<(), ChannelError> {
        self.send_frame(Request::Data {
            id: id.to_string(),
            payload,
        })
        .await
    }

    async fn send_disconnect(&self, id: &str) -> Result<(), ChannelError> {
        self.send_frame(Request::Disconnect { id: id.to_string() }).await
    }

    async fn send_shutdown_write(&self, id: &str) -> Result<(), ChannelError> {
        self.send_frame(Request::ShutdownWrite { id: id.to_string() }).await
    }
}

/// Routes one response: `Connected`/`Error` settle a pending waiter when
/// one exists; everything else goes to the dispatcher.
async fn dispatch_response(resp: Response, waiters: &WaiterMap, resp_tx: &mpsc::Sender<Response>) {
    let waiter = match &resp {
        Response::Connected { id } | Response::Error { id, .. } => {
            waiters.lock().expect("waiter map poisoned").remove(id)
        }
        _ => None,
    };

    match (waiter, resp) {
        (Some(waiter), Response::Connected { id }) => {
            trace!(%id, "connect waiter fulfilled");
            let _ = waiter.send(ConnectReply::Connected);
        }
        (Some(waiter), Response::Error { id, message }) => {
            debug!(%id, %message, "connect waiter failed");
            let _ = waiter.send(ConnectReply::Failed(message));
        }
        (_, resp) => {
            if resp_tx.send(resp).await.is_err() {
                trace!("response dispatcher gone, dropping frame");
            }
        }
    }
}

/// Cancels the channel and fails every pending waiter by dropping its
/// sender.
fn mark_closed(closed: &CancellationToken, waiters: &WaiterMap) {
    closed.cancel();
    waiters.lock().expect("waiter map poisoned").clear();
}
