//! Per-flow state tracked by the TCP synthesizer.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use burrow_constants::net::SYNTH_FIRST_DATA_SEQ;
use burrow_net::TcpSegment;

/// The 4-tuple identifying one TCP flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub client_ip: Ipv4Addr,
    pub client_port: u16,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
}

impl FlowKey {
    /// Builds the key from an inbound client segment (client is the
    /// source side).
    #[must_use]
    pub const fn from_segment(seg: &TcpSegment<'_>) -> Self {
        Self {
            client_ip: seg.src_ip,
            client_port: seg.src_port,
            server_ip: seg.dst_ip,
            server_port: seg.dst_port,
        }
    }

    /// Renders the stable textual connection id shared with the relay
    /// host. Both sides treat it as opaque.
    #[must_use]
    pub fn connection_id(&self) -> String {
        format!(
            "{}:{}->{}:{}",
            self.client_ip, self.client_port, self.server_ip, self.server_port
        )
    }
}

/// Lifecycle of a synthesized flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowState {
    /// SYN seen, relay connect in flight. Transient: resolved within the
    /// same `handle_inbound` call.
    SynReceived,
    /// SYN-ACK emitted; payload moves in both directions.
    Established,
    /// Torn down by a relay event or tunnel shutdown; about to be removed.
    Closed,
}

/// Per-4-tuple record held by the tunnel endpoint.
#[derive(Debug)]
pub struct Flow {
    pub client_port: u16,
    pub server_ip: Ipv4Addr,
    pub server_port: u16,
    /// Next sequence number expected from the client. Only payload bytes
    /// that were observed and forwarded move it.
    pub app_seq: u32,
    /// Sequence number assigned to the next byte emitted toward the
    /// client. Monotonically non-decreasing (mod 2³²).
    pub our_seq: u32,
    pub state: FlowState,
}

impl Flow {
    /// Creates the flow record for a client SYN with ISN `client_isn`.
    #[must_use]
    pub const fn new(key: &FlowKey, client_isn: u32) -> Self {
        Self {
            client_port: key.client_port,
            server_ip: key.server_ip,
            server_port: key.server_port,
            app_seq: client_isn.wrapping_add(1),
            our_seq: SYNTH_FIRST_DATA_SEQ,
            state: FlowState::SynReceived,
        }
    }
}

/// Concurrent flow table keyed by connection id.
///
/// Entries are inserted from the interface reader task and removed from
/// the relay response dispatcher; the mutex is never held across an
/// await point.
#[derive(Default)]
pub struct FlowTable {
    flows: Mutex<HashMap<String, Flow>>,
}

impl FlowTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.flows.lock().expect("flow table poisoned").contains_key(id)
    }

    pub fn insert(&self, id: String, flow: Flow) {
        self.flows.lock().expect("flow table poisoned").insert(id, flow);
    }

    pub fn remove(&self, id: &str) -> Option<Flow> {
        self.flows.lock().expect("flow table poisoned").remove(id)
    }

    pub fn clear(&self) {
        self.flows.lock().expect("flow table poisoned").clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.flows.lock().expect("flow table poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `f` against the flow for `id`, if present.
    pub fn with<R>(&self, id: &str, f: impl FnOnce(&mut Flow) -> R) -> Option<R> {
        self.flows
            .lock()
            .expect("flow table poisoned")
            .get_mut(id)
            .map(f)
    }
}
