//! Per-channel relay manager.
//!
//! One cooperative event loop per accepted channel. All socket writes,
//! record bookkeeping, and channel writes happen on the loop; per-socket
//! reader tasks and connect attempts feed it through one event channel.
//!
//! Inbound bytes from a server are never pushed frame-per-chunk: they
//! queue per connection and flush either when 4096 bytes accumulate or
//! 10 ms after the first queued chunk, whichever comes first. Order is
//! preserved; chunks are coalesced, never reordered or duplicated.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use axum::extract::ws::{Message, WebSocket};
use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::time::delay_queue::{DelayQueue, Key};
use tracing::{debug, trace, warn};

use burrow_constants::relay::{
    FLUSH_DELAY, FLUSH_THRESHOLD, HOST_CONNECT_TIMEOUT, SOCKET_READ_BUF,
};
use burrow_proto::{Request, Response};

/// Event fed into the channel loop by connect attempts and socket
/// readers.
enum SockEvent {
    ConnectDone {
        id: String,
        result: Result<TcpStream, String>,
    },
    Data {
        id: String,
        chunk: Bytes,
    },
    Eof {
        id: String,
    },
    Error {
        id: String,
        message: String,
    },
}

/// One live outbound connection and its inbound batching state.
struct ConnRecord {
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
    /// Not-yet-forwarded inbound chunks, in arrival order.
    queue: Vec<Bytes>,
    /// Total bytes across `queue`.
    queued: usize,
    /// Pending flush timer, if armed.
    flush_key: Option<Key>,
}

/// Per-channel connection table and its write side of the channel.
struct RelayManager {
    conns: HashMap<String, ConnRecord>,
    /// Connects in flight: accepted but not yet `ConnectDone`.
    pending: HashSet<String>,
    ws_tx: mpsc::Sender<Message>,
    ev_tx: mpsc::Sender<SockEvent>,
}

/// Runs one accepted channel to completion.
pub(crate) async fn run_channel(socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (ws_tx, mut ws_rx) = mpsc::channel::<Message>(256);
    let writer = tokio::spawn(async move {
        while let Some(msg) = ws_rx.recv().await {
            if ws_sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let (ev_tx, mut ev_rx) = mpsc::channel::<SockEvent>(256);
    let mut manager = RelayManager::new(ws_tx, ev_tx);
    let mut timers: DelayQueue<String> = DelayQueue::new();

    debug!("channel open");
    loop {
        tokio::select! {
            msg = ws_stream.next() => match msg {
                Some(Ok(Message::Binary(data))) => match Request::decode(data) {
                    Ok(request) => manager.handle_request(request, &mut timers).await,
                    // A malformed frame is dropped; the channel stays up.
                    Err(err) => warn!("dropping malformed request frame: {err}"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {} // ping/pong handled by the protocol layer
                Some(Err(err)) => {
                    debug!("channel read failed: {err}");
                    break;
                }
            },
            Some(event) = ev_rx.recv() => manager.handle_event(event, &mut timers).await,
            expired = std::future::poll_fn(|cx| timers.poll_expired(cx)), if !timers.is_empty() => {
                if let Some(expired) = expired {
                    manager.flush_expired(expired.into_inner()).await;
                }
            }
        }
    }

    manager.shutdown(&mut timers);
    writer.abort();
    debug!("channel closed");
}

impl RelayManager {
    fn new(ws_tx: mpsc::Sender<Message>, ev_tx: mpsc::Sender<SockEvent>) -> Self {
        Self {
            conns: HashMap::new(),
            pending: HashSet::new(),
            ws_tx,
            ev_tx,
        }
    }

    async fn handle_request(&mut self, request: Request, timers: &mut DelayQueue<String>) {
        match request {
            Request::Connect {
                id,
                dest_ip,
                dest_port,
            } => self.handle_connect(id, dest_ip, dest_port),
            Request::Data { id, payload } => self.handle_data(id, &payload, timers).await,
            Request::Disconnect { id } => self.handle_disconnect(&id, timers),
            Request::ShutdownWrite { id } => self.handle_shutdown_write(&id).await,
        }
    }

    fn handle_connect(&mut self, id: String, dest_ip: Ipv4Addr, dest_port: u16) {
        if self.conns.contains_key(&id) || !self.pending.insert(id.clone()) {
            debug!(%id, "duplicate connect ignored");
            return;
        }

        let ev_tx = self.ev_tx.clone();
        tokio::spawn(async move {
            let result = match timeout(
                HOST_CONNECT_TIMEOUT,
                TcpStream::connect((dest_ip, dest_port)),
            )
            .await
            {
                Ok(Ok(stream)) => Ok(stream),
                Ok(Err(err)) => Err(err.to_string()),
                Err(_) => Err("connect timeout".to_string()),
            };
            let _ = ev_tx.send(SockEvent::ConnectDone { id, result }).await;
        });
    }

    async fn handle_data(&mut self, id: String, payload: &Bytes, timers: &mut DelayQueue<String>) {
        let Some(record) = self.conns.get_mut(&id) else {
            self.emit(Response::Error {
                id,
                message: "unknown connection".to_string(),
            })
            .await;
            return;
        };

        if let Err(err) = record.writer.write_all(payload).await {
            debug!(%id, "socket write failed: {err}");
            self.flush(&id, timers).await;
            self.remove_record(&id, timers);
            self.emit(Response::Disconnected { id }).await;
        }
    }

    fn handle_disconnect(&mut self, id: &str, timers: &mut DelayQueue<String>) {
        // Idempotent: a second disconnect finds nothing.
        self.pending.remove(id);
        if self.remove_record(id, timers).is_some() {
            trace!(%id, "connection dropped by tunnel");
        }
    }

    async fn handle_shutdown_write(&mut self, id: &str) {
        if let Some(record) = self.conns.get_mut(id) {
            // Half-close: the server may still send.
            if let Err(err) = record.writer.shutdown().await {
                debug!(%id, "shutdown-write failed: {err}");
            }
        }
    }

    async fn handle_event(&mut self, event: SockEvent, timers: &mut DelayQueue<String>) {
        match event {
            SockEvent::ConnectDone { id, result } => self.handle_connect_done(id, result).await,
            SockEvent::Data { id, chunk } => self.handle_inbound_chunk(id, chunk, timers).await,
            SockEvent::Eof { id } => {
                if self.conns.contains_key(&id) {
                    self.flush(&id, timers).await;
                    self.remove_record(&id, timers);
                    trace!(%id, "server closed");
                    self.emit(Response::Disconnected { id }).await;
                }
            }
            SockEvent::Error { id, message } => {
                if self.conns.contains_key(&id) {
                    self.flush(&id, timers).await;
                    self.remove_record(&id, timers);
                    debug!(%id, "server socket error: {message}");
                    self.emit(Response::Error { id, message }).await;
                }
            }
        }
    }

    async fn handle_connect_done(&mut self, id: String, result: Result<TcpStream, String>) {
        if !self.pending.remove(&id) {
            // Disconnected while the connect was in flight.
            debug!(%id, "connect completed for a dropped flow");
            return;
        }

        match result {
            Ok(stream) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(%id, "set_nodelay failed: {err}");
                }
                let (read_half, write_half) = stream.into_split();
                let reader = spawn_socket_reader(id.clone(), read_half, self.ev_tx.clone());
                self.conns.insert(
                    id.clone(),
                    ConnRecord {
                        writer: write_half,
                        reader,
                        queue: Vec::new(),
                        queued: 0,
                        flush_key: None,
                    },
                );
                debug!(%id, "connected");
                self.emit(Response::Connected { id }).await;
            }
            Err(message) => {
                debug!(%id, "connect failed: {message}");
                self.emit(Response::Error { id, message }).await;
            }
        }
    }

    /// Queues one inbound chunk, flushing at the byte threshold or
    /// arming the delay timer.
    async fn handle_inbound_chunk(
        &mut self,
        id: String,
        chunk: Bytes,
        timers: &mut DelayQueue<String>,
    ) {
        let Some(record) = self.conns.get_mut(&id) else {
            return;
        };

        record.queued += chunk.len();
        record.queue.push(chunk);

        if record.queued >= FLUSH_THRESHOLD {
            self.flush(&id, timers).await;
        } else if record.flush_key.is_none() {
            record.flush_key = Some(timers.insert(id, FLUSH_DELAY));
        }
    }

    /// Timer-driven flush. The fired key already left the timer queue.
    async fn flush_expired(&mut self, id: String) {
        if let Some(record) = self.conns.get_mut(&id) {
            record.flush_key = None;
        }
        if let Some(payload) = self.take_queued(&id) {
            self.emit(Response::Data { id, payload }).await;
        }
    }

    /// Concatenates the queued chunks into one `Data` response and cancels
    /// any pending flush timer.
    async fn flush(&mut self, id: &str, timers: &mut DelayQueue<String>) {
        if let Some(record) = self.conns.get_mut(id) {
            if let Some(key) = record.flush_key.take() {
                timers.try_remove(&key);
            }
        }
        if let Some(payload) = self.take_queued(id) {
            self.emit(Response::Data {
                id: id.to_string(),
                payload,
            })
            .await;
        }
    }

    /// Drains a record's queue into one contiguous payload.
    fn take_queued(&mut self, id: &str) -> Option<Bytes> {
        let record = self.conns.get_mut(id)?;
        if record.queue.is_empty() {
            return None;
        }

        let payload = if record.queue.len() == 1 {
            record.queue.pop().unwrap_or_default()
        } else {
            let mut buf = BytesMut::with_capacity(record.queued);
            for chunk in record.queue.drain(..) {
                buf.extend_from_slice(&chunk);
            }
            buf.freeze()
        };
        record.queued = 0;

        trace!(%id, len = payload.len(), "flush");
        Some(payload)
    }

    /// Removes a record, cancelling its timer and reader. The socket
    /// closes when the halves drop. The batching queue is gone with the
    /// record, so the empty-on-delete invariant holds by construction.
    fn remove_record(&mut self, id: &str, timers: &mut DelayQueue<String>) -> Option<()> {
        let mut record = self.conns.remove(id)?;
        if let Some(key) = record.flush_key.take() {
            timers.try_remove(&key);
        }
        record.reader.abort();
        Some(())
    }

    async fn emit(&self, response: Response) {
        if self.ws_tx.send(Message::Binary(response.encode())).await.is_err() {
            trace!("channel writer gone, dropping response");
        }
    }

    /// Drops every record and timer. Called when the channel ends.
    fn shutdown(&mut self, timers: &mut DelayQueue<String>) {
        timers.clear();
        self.pending.clear();
        for (id, record) in self.conns.drain() {
            trace!(%id, "closing on channel shutdown");
            record.reader.abort();
        }
    }
}

/// Reads the server side of one connection, forwarding chunks to the
/// channel loop in arrival order.
fn spawn_socket_reader(
    id: String,
    mut read_half: OwnedReadHalf,
    ev_tx: mpsc::Sender<SockEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; SOCKET_READ_BUF];
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => {
                    let _ = ev_tx.send(SockEvent::Eof { id }).await;
                    break;
                }
                Ok(n) => {
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if ev_tx
                        .send(SockEvent::Data {
                            id: id.clone(),
                            chunk,
                        })
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Err(err) => {
                    let _ = ev_tx
                        .send(SockEvent::Error {
                            id,
                            message: err.to_string(),
                        })
                        .await;
                    break;
                }
            }
        }
    })
}
