//! End-to-end scenarios: a synthetic client application on an in-memory
//! virtual interface, a real relay server, and a real origin socket.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use burrow_net::{build_tcp_segment, TcpSegment, TCP_ACK, TCP_PSH, TCP_SYN};
use burrow_relay::{RelayConfig, RelayServer};
use burrow_tunnel::{MemoryInterface, NoopProtector, TunnelConfig, TunnelEndpoint, TunnelState};

const CLIENT: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 2);
const CLIENT_PORT: u16 = 49152;
const ORIGIN: Ipv4Addr = Ipv4Addr::new(127, 0, 0, 1);

const REQUEST: &[u8] = b"GET / HTTP/1.1\r\n\r\n";

struct TestBed {
    endpoint: TunnelEndpoint,
    inject: mpsc::Sender<Vec<u8>>,
    out: mpsc::Receiver<Vec<u8>>,
    relay_shutdown: CancellationToken,
}

async fn start_testbed() -> TestBed {
    let relay = RelayServer::bind(&RelayConfig { port: 0 })
        .await
        .expect("bind relay");
    let relay_addr = relay.local_addr().expect("relay addr");
    let relay_shutdown = CancellationToken::new();
    tokio::spawn(relay.serve(relay_shutdown.clone()));

    let (iface, inject, out) = MemoryInterface::new();
    let endpoint = TunnelEndpoint::new(
        iface,
        TunnelConfig {
            relay_url: format!("ws://{relay_addr}/channel"),
        },
    );
    endpoint.start(&NoopProtector).await.expect("start tunnel");

    TestBed {
        endpoint,
        inject,
        out,
        relay_shutdown,
    }
}

fn client_segment(origin_port: u16, seq: u32, flags: u8, payload: &[u8]) -> Vec<u8> {
    build_tcp_segment(
        CLIENT,
        ORIGIN,
        CLIENT_PORT,
        origin_port,
        seq,
        0,
        flags,
        65535,
        payload,
    )
}

async fn next_segment(out: &mut mpsc::Receiver<Vec<u8>>) -> Vec<u8> {
    timeout(Duration::from_secs(5), out.recv())
        .await
        .expect("segment within deadline")
        .expect("interface open")
}

#[tokio::test]
async fn https_style_exchange_end_to_end() {
    let mut bed = start_testbed().await;

    // Origin server: read the request, reply with 3000 bytes, close.
    let listener = TcpListener::bind((ORIGIN, 0)).await.expect("bind origin");
    let origin_port = listener.local_addr().expect("origin addr").port();
    let body: Vec<u8> = (0..3000u32).map(|i| (i % 251) as u8).collect();
    let origin_body = body.clone();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut request = vec![0u8; REQUEST.len()];
        stream.read_exact(&mut request).await.expect("read request");
        assert_eq!(request, REQUEST);
        stream.write_all(&origin_body).await.expect("write body");
        // Dropping the stream closes it cleanly.
    });

    // 1. Handshake: SYN in, SYN-ACK out.
    bed.inject
        .send(client_segment(origin_port, 1000, TCP_SYN, &[]))
        .await
        .expect("inject SYN");

    let syn_ack = next_segment(&mut bed.out).await;
    assert_eq!(syn_ack.len(), 40);
    let seg = TcpSegment::parse(&syn_ack).expect("SYN-ACK parses");
    assert_eq!(seg.src_ip, ORIGIN);
    assert_eq!(seg.dst_ip, CLIENT);
    assert_eq!(seg.src_port, origin_port);
    assert_eq!(seg.dst_port, CLIENT_PORT);
    assert_eq!(seg.seq, 1);
    assert_eq!(seg.ack, 1001);
    assert_eq!(seg.flags, TCP_SYN | TCP_ACK);

    // 2. Request: payload in, one ACK out.
    bed.inject
        .send(client_segment(origin_port, 1001, TCP_PSH | TCP_ACK, REQUEST))
        .await
        .expect("inject request");

    let ack = next_segment(&mut bed.out).await;
    let seg = TcpSegment::parse(&ack).expect("ACK parses");
    assert_eq!(seg.flags, TCP_ACK);
    assert_eq!(seg.seq, 2);
    assert_eq!(seg.ack, 1001 + REQUEST.len() as u32);
    assert!(seg.payload.is_empty());

    // 3. Response: PSH-ACK segments reassemble to the origin's bytes, in
    // order, each within the MSS, acks frozen at the request boundary.
    let mut reassembled = Vec::new();
    let mut expected_seq = 2u32;
    while reassembled.len() < body.len() {
        let datagram = next_segment(&mut bed.out).await;
        let seg = TcpSegment::parse(&datagram).expect("data segment parses");
        assert_eq!(seg.flags, TCP_PSH | TCP_ACK);
        assert_eq!(seg.seq, expected_seq);
        assert_eq!(seg.ack, 1019);
        assert!(!seg.payload.is_empty());
        assert!(seg.payload.len() <= 1460);
        expected_seq = expected_seq.wrapping_add(seg.payload.len() as u32);
        reassembled.extend_from_slice(seg.payload);
    }
    assert_eq!(reassembled, body);

    // 4. Clean origin close tears the flow down; later client segments
    // on the dead 4-tuple go nowhere.
    tokio::time::sleep(Duration::from_millis(100)).await;
    bed.inject
        .send(client_segment(
            origin_port,
            1019,
            TCP_PSH | TCP_ACK,
            b"anyone there?",
        ))
        .await
        .expect("inject late payload");
    let silence = timeout(Duration::from_millis(200), bed.out.recv()).await;
    assert!(silence.is_err(), "no ACK for a removed flow");

    bed.endpoint.stop().await;
    bed.relay_shutdown.cancel();
}

#[tokio::test]
async fn refused_origin_leaves_the_syn_unanswered() {
    let mut bed = start_testbed().await;

    // Nothing listens on loopback port 1; the relay's connect fails and
    // reports Error, so the tunnel writes nothing at all.
    bed.inject
        .send(client_segment(1, 1000, TCP_SYN, &[]))
        .await
        .expect("inject SYN");

    let silence = timeout(Duration::from_millis(500), bed.out.recv()).await;
    assert!(silence.is_err(), "refused connect must not produce a packet");

    bed.endpoint.stop().await;
    bed.relay_shutdown.cancel();
}

#[tokio::test]
async fn relay_drop_disconnects_the_tunnel() {
    // A host that accepts the channel and then hangs up mid-session.
    let listener = TcpListener::bind((ORIGIN, 0)).await.expect("bind host");
    let addr = listener.local_addr().expect("host addr");
    let (hangup_tx, hangup_rx) = tokio::sync::oneshot::channel::<()>();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.expect("accept");
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .expect("handshake");
        let _ = hangup_rx.await;
        drop(ws);
    });

    let (iface, _inject, _out) = MemoryInterface::new();
    let endpoint = TunnelEndpoint::new(
        iface,
        TunnelConfig {
            relay_url: format!("ws://{addr}/channel"),
        },
    );
    endpoint.start(&NoopProtector).await.expect("start tunnel");

    let mut state = endpoint.state();
    assert_eq!(*state.borrow(), TunnelState::Connected);

    hangup_tx.send(()).expect("hangup");

    timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == TunnelState::Disconnected),
    )
    .await
    .expect("state change within deadline")
    .expect("watch alive");

    endpoint.stop().await;
}

#[tokio::test]
async fn half_close_reaches_the_origin() {
    use burrow_net::TCP_FIN;

    let mut bed = start_testbed().await;

    let listener = TcpListener::bind((ORIGIN, 0)).await.expect("bind origin");
    let origin_port = listener.local_addr().expect("origin addr").port();
    let (got_eof_tx, got_eof_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.expect("accept");
        let mut buf = [0u8; 64];
        // First read: the request payload. Second read: EOF after the
        // client's half-close.
        let n = stream.read(&mut buf).await.expect("read payload");
        assert!(n > 0);
        let n = stream.read(&mut buf).await.expect("read eof");
        let _ = got_eof_tx.send(n == 0);
    });

    bed.inject
        .send(client_segment(origin_port, 1000, TCP_SYN, &[]))
        .await
        .expect("inject SYN");
    let _syn_ack = next_segment(&mut bed.out).await;

    bed.inject
        .send(client_segment(origin_port, 1001, TCP_PSH | TCP_ACK, b"bye"))
        .await
        .expect("inject payload");
    let _ack = next_segment(&mut bed.out).await;

    bed.inject
        .send(client_segment(origin_port, 1004, TCP_FIN | TCP_ACK, &[]))
        .await
        .expect("inject FIN");

    // The FIN itself is acked so the client stops retransmitting it.
    let fin_ack = next_segment(&mut bed.out).await;
    let seg = TcpSegment::parse(&fin_ack).expect("FIN ack parses");
    assert_eq!(seg.ack, 1005);

    let eof = timeout(Duration::from_secs(5), got_eof_rx)
        .await
        .expect("origin observes the half-close")
        .expect("origin task alive");
    assert!(eof);

    bed.endpoint.stop().await;
    bed.relay_shutdown.cancel();
}
