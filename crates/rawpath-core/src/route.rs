//! Per-path route state.
//!
//! A [`Route`] is owned by the connection/path object above the datapath.
//! The resolver fills in the link-layer addresses and queue, the framing
//! code reads them, and TCP-disguise mode keeps a shadow of the sequence
//! space in [`TcpState`].

use crate::backend::QueueId;
use crate::frame::MacAddress;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};

/// Resolution state of a route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteState {
    /// Never resolved
    #[default]
    Unresolved,
    /// Resolution in progress
    Resolving,
    /// Next hop known, ready to send
    Resolved,
    /// Previously resolved, now being re-verified
    Suspect,
}

/// TCP sequence shadow used when framing QUIC as TCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpState {
    /// Next sequence number to send
    pub sequence_number: u32,
    /// Acknowledgment number to send
    pub ack_number: u32,
    /// Whether the sequence space has been synchronized with the peer
    pub syncd: bool,
}

/// Local and remote endpoints of a path plus everything needed to frame
/// packets for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Local IP and port
    pub local_address: SocketAddr,
    /// Remote IP and port
    pub remote_address: SocketAddr,
    /// MAC of the local interface
    pub local_link_layer_address: MacAddress,
    /// MAC of the next hop toward `remote_address`
    pub next_hop_link_layer_address: MacAddress,
    /// Resolution state
    pub state: RouteState,
    /// Queue packets for this route are sent on
    pub queue: Option<QueueId>,
    /// TCP shadow state
    pub tcp_state: TcpState,
}

impl Default for Route {
    fn default() -> Self {
        let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
        Self {
            local_address: unspecified,
            remote_address: unspecified,
            local_link_layer_address: MacAddress::ZERO,
            next_hop_link_layer_address: MacAddress::ZERO,
            state: RouteState::Unresolved,
            queue: None,
            tcp_state: TcpState::default(),
        }
    }
}

impl Route {
    /// Unresolved route between two endpoints.
    ///
    /// The TCP initial sequence number is randomized.
    pub fn new(local_address: SocketAddr, remote_address: SocketAddr) -> Self {
        Self {
            local_address,
            remote_address,
            tcp_state: TcpState {
                sequence_number: rand::random(),
                ..TcpState::default()
            },
            ..Self::default()
        }
    }

    /// Whether packets can be framed for this route.
    pub fn is_resolved(&self) -> bool {
        self.state == RouteState::Resolved && self.queue.is_some()
    }

    /// Mark a resolved route as needing re-verification.
    pub fn mark_suspect(&mut self) {
        if self.state == RouteState::Resolved {
            self.state = RouteState::Suspect;
        }
    }

    /// Apply the outcome of an asynchronous resolution.
    pub fn complete_resolution(&mut self, next_hop: Option<MacAddress>) {
        match next_hop {
            Some(mac) => {
                self.next_hop_link_layer_address = mac;
                self.state = RouteState::Resolved;
            }
            None => {
                self.state = RouteState::Unresolved;
            }
        }
    }
}

/// Adopt the queue and TCP sequence space of `src` into `dst`.
///
/// `src` is normally the route parsed from a received packet. The queue is
/// copied only onto an already resolved route. The first time the TCP state
/// is synchronized we acknowledge one byte less than the peer sent and skip
/// one sequence number, leaving room for an in-order RST on teardown. Later
/// calls leave the sequence space alone; this assumes a single handshake per
/// route.
pub fn update_route(dst: &mut Route, src: &Route) {
    if dst.state == RouteState::Resolved && dst.queue != src.queue {
        dst.queue = src.queue;
    }

    if !dst.tcp_state.syncd {
        dst.tcp_state.syncd = true;
        dst.tcp_state.ack_number = src.tcp_state.sequence_number.wrapping_sub(1);
        dst.tcp_state.sequence_number = src.tcp_state.ack_number.wrapping_add(1);
    }
}
