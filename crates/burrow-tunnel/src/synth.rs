//! TCP synthesizer: the fabricated server half of every flow.
//!
//! Inbound segments from the client application drive the relay channel;
//! relay responses drive synthesized segments back out the virtual
//! interface. Sequence arithmetic is 32-bit modular throughout. The
//! advertised window is a constant and nothing is ever retransmitted
//! from this side.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, trace, warn};

use burrow_constants::net::{ADVERTISED_WINDOW, MAX_SEGMENT_PAYLOAD, SYNTH_ISN, TUNNEL_ADDRESS};
use burrow_net::{build_tcp_segment, TcpSegment, TCP_ACK, TCP_PSH, TCP_SYN};
use burrow_proto::Response;

use crate::channel::RelayLink;
use crate::flow::{Flow, FlowKey, FlowState, FlowTable};
use crate::iface::{PacketWriter, VirtualInterface};

/// Synthesizes the server side of each TCP flow.
pub struct TcpSynthesizer {
    link: Arc<dyn RelayLink>,
    writer: PacketWriter,
    flows: FlowTable,
}

impl TcpSynthesizer {
    pub fn new(link: Arc<dyn RelayLink>, iface: Arc<dyn VirtualInterface>) -> Self {
        Self {
            link,
            writer: PacketWriter::new(iface),
            flows: FlowTable::new(),
        }
    }

    /// The flow table, shared with the endpoint for shutdown.
    pub const fn flows(&self) -> &FlowTable {
        &self.flows
    }

    /// Handles one inbound segment from the client application.
    pub async fn handle_inbound(&self, seg: TcpSegment<'_>) {
        let key = FlowKey::from_segment(&seg);
        let id = key.connection_id();

        if seg.is_pure_syn() {
            self.handle_syn(&key, &id, &seg).await;
            return;
        }

        if !self.flows.contains(&id) {
            trace!(%id, "segment for unknown flow dropped");
            return;
        }

        let payload_len = seg.payload.len() as u32;
        let fin = seg.has_fin();
        if payload_len == 0 && !fin {
            // Pure ACK or window update: nothing to do.
            return;
        }

        // Account for observed payload (and the FIN's sequence slot)
        // before anything is forwarded, so the ACK below is exact.
        let fin_slot = u32::from(fin);
        self.flows.with(&id, |flow| {
            flow.app_seq = seg.seq.wrapping_add(payload_len).wrapping_add(fin_slot);
        });

        if payload_len > 0 {
            let payload = Bytes::copy_from_slice(seg.payload);
            if let Err(err) = self.link.send_data(&id, payload).await {
                debug!(%id, "payload not forwarded: {err}");
            }
        }

        if fin {
            // Half-close toward the server; the flow stays open for
            // inbound until the relay reports Disconnected.
            if let Err(err) = self.link.send_shutdown_write(&id).await {
                debug!(%id, "shutdown-write not forwarded: {err}");
            }
        }

        // One ACK per accepted segment keeps the client from
        // retransmitting, which would arrive at the server as duplicates.
        self.transmit_from_flow(&id, TCP_ACK, &[]).await;
    }

    /// Handles one asynchronous response from the relay host.
    pub async fn handle_response(&self, resp: Response) {
        match resp {
            Response::Data { id, payload } => self.handle_data(&id, &payload).await,
            Response::Disconnected { id } => {
                if self.close_flow(&id) {
                    debug!(%id, "flow closed by relay disconnect");
                }
            }
            Response::Error { id, message } => {
                if self.close_flow(&id) {
                    debug!(%id, %message, "flow closed by relay error");
                }
            }
            // Normally consumed by the connect waiter; harmless here.
            Response::Connected { id } => trace!(%id, "stray connected response ignored"),
        }
    }

    async fn handle_syn(&self, key: &FlowKey, id: &str, seg: &TcpSegment<'_>) {
        if self.flows.contains(id) {
            // Duplicate SYN: the SYN-ACK already emitted satisfies it.
            trace!(%id, "duplicate SYN dropped");
            return;
        }

        match self
            .link
            .connect_flow(id, seg.dst_ip, seg.dst_port)
            .await
        {
            Ok(()) => {
                self.flows.insert(id.to_string(), Flow::new(key, seg.seq));

                // SYN-ACK: our ISN, acknowledging the client's SYN.
                let syn_ack = build_tcp_segment(
                    seg.dst_ip,
                    seg.src_ip,
                    seg.dst_port,
                    seg.src_port,
                    SYNTH_ISN,
                    seg.seq.wrapping_add(1),
                    TCP_SYN | TCP_ACK,
                    ADVERTISED_WINDOW,
                    &[],
                );
                if let Err(err) = self.writer.send(&syn_ack).await {
                    warn!(%id, "interface write failed: {err}");
                }
                self.flows.with(id, |flow| flow.state = FlowState::Established);
                debug!(%id, "flow established");
            }
            Err(err) => {
                // Drop the SYN; the client retransmits and eventually
                // gives up.
                debug!(%id, "relay connect failed, SYN dropped: {err}");
            }
        }
    }

    /// Splits relay payload into MSS-sized PSH-ACK segments toward the
    /// client, advancing `our_seq` by each chunk actually written.
    async fn handle_data(&self, id: &str, payload: &Bytes) {
        if !self.flows.contains(id) {
            trace!(%id, "relay data for unknown flow dropped");
            return;
        }

        for chunk in payload.chunks(MAX_SEGMENT_PAYLOAD) {
            if self.transmit_from_flow(id, TCP_PSH | TCP_ACK, chunk).await {
                self.flows.with(id, |flow| {
                    flow.our_seq = flow.our_seq.wrapping_add(chunk.len() as u32);
                });
            }
        }
    }

    /// Builds and writes one segment from the flow's current sequence
    /// state. Returns whether the write succeeded.
    async fn transmit_from_flow(&self, id: &str, flags: u8, payload: &[u8]) -> bool {
        let Some((client_port, server_ip, server_port, seq, ack)) = self.flows.with(id, |flow| {
            (
                flow.client_port,
                flow.server_ip,
                flow.server_port,
                flow.our_seq,
                flow.app_seq,
            )
        }) else {
            return false;
        };

        let datagram = build_tcp_segment(
            server_ip,
            TUNNEL_ADDRESS,
            server_port,
            client_port,
            seq,
            ack,
            flags,
            ADVERTISED_WINDOW,
            payload,
        );
        match self.writer.send(&datagram).await {
            Ok(()) => true,
            Err(err) => {
                // Best effort: the client recovers or the relay tears the
                // flow down.
                warn!(%id, "interface write failed: {err}");
                false
            }
        }
    }

    /// Marks a flow closed and removes it. Returns whether it existed.
    fn close_flow(&self, id: &str) -> bool {
        self.flows.with(id, |flow| flow.state = FlowState::Closed);
        self.flows.remove(id).is_some()
    }
}
