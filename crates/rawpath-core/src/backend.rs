//! The kernel-bypass backend seam.
//!
//! A [`RawBackend`] exposes per-queue descriptor rings that follow the AF_XDP
//! model:
//!
//! ```text
//!              fill ring            RX ring
//!   pool ────────────────▶ NIC ────────────────▶ partition
//!
//!              TX ring              completion ring
//!   partition ───────────▶ NIC ────────────────▶ pool
//! ```
//!
//! Frames are owned values. Submitting a frame moves it into the backend;
//! reserving from the RX or completion ring moves it back out. The backend
//! must never hand out a frame on a queue other than the one it was
//! submitted on.

use crate::buffer_pool::Frame;
use crate::error::BackendError;
use crate::partition::PartitionWaker;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

/// Datapath-wide queue identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueId(pub u32);

impl fmt::Display for QueueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

/// A hardware queue offered by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwQueue {
    /// OS interface index
    pub interface_index: u32,
    /// Queue number on that interface
    pub hw_queue: u32,
}

/// Flags passed to [`RawBackend::bind`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BindFlags {
    /// Request zero-copy mode
    pub zero_copy: bool,
    /// Request need-wakeup semantics on the TX ring
    pub need_wakeup: bool,
}

/// Checksums the NIC computes on transmit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChecksumOffloads {
    /// IPv4 header checksum
    pub l3: bool,
    /// TCP/UDP checksum
    pub l4: bool,
}

/// Traffic steering rule installed on the NIC for a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SteeringRule {
    /// All UDP traffic to a port
    UdpDst {
        /// Local port
        port: u16,
    },
    /// All TCP traffic to a port
    TcpDst {
        /// Local port
        port: u16,
    },
    /// QUIC long-header packets whose source CID carries `id` at `offset`
    QuicFlowSrcCid {
        /// Local port
        port: u16,
        /// Offset of the id within the CID
        offset: u8,
        /// Routing id bytes
        id: Vec<u8>,
    },
    /// QUIC packets whose destination CID carries `id` at `offset`
    QuicFlowDstCid {
        /// Local port
        port: u16,
        /// Offset of the id within the CID
        offset: u8,
        /// Routing id bytes
        id: Vec<u8>,
    },
    /// TCP control segments (SYN/FIN) to a port
    TcpControlDst {
        /// Local port
        port: u16,
    },
    /// Connected IPv4 socket
    Ipv4PortSet {
        /// Local address
        address: Ipv4Addr,
        /// Local port
        port: u16,
        /// TCP instead of UDP
        tcp: bool,
    },
    /// Connected IPv6 socket
    Ipv6PortSet {
        /// Local address
        address: Ipv6Addr,
        /// Local port
        port: u16,
        /// TCP instead of UDP
        tcp: bool,
    },
}

impl SteeringRule {
    /// Local port the rule matches on.
    pub fn port(&self) -> u16 {
        match self {
            Self::UdpDst { port }
            | Self::TcpDst { port }
            | Self::QuicFlowSrcCid { port, .. }
            | Self::QuicFlowDstCid { port, .. }
            | Self::TcpControlDst { port }
            | Self::Ipv4PortSet { port, .. }
            | Self::Ipv6PortSet { port, .. } => *port,
        }
    }
}

/// Ring a wakeup notification is armed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyDirection {
    /// Wake when RX descriptors arrive
    Rx,
    /// Wake when TX completions arrive
    Tx,
}

/// Outcome of arming a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyOutcome {
    /// The waker will be signalled later
    Pending,
    /// Work is already available; keep polling
    Immediate,
}

/// A received frame handed up from the RX ring.
#[derive(Debug)]
pub struct RxDescriptor {
    /// Frame buffer
    pub frame: Frame,
    /// Start of the Ethernet frame within the buffer
    pub offset: usize,
    /// Length of the Ethernet frame
    pub len: usize,
}

/// A framed packet handed down to the TX ring.
#[derive(Debug)]
pub struct TxDescriptor {
    /// Frame buffer
    pub frame: Frame,
    /// Start of the Ethernet frame within the buffer
    pub offset: usize,
    /// Length of the Ethernet frame
    pub len: usize,
}

/// A kernel-bypass NIC backend (AF_XDP, DPDK, software rings).
///
/// Ring methods for one queue are only ever called from the partition that
/// owns the queue; rule and bind methods may be called from any thread.
pub trait RawBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Hardware queues available to the datapath, in a stable order.
    fn queue_layout(&self) -> Vec<HwQueue>;

    /// Attach `queue` to `hw`.
    fn bind(&self, queue: QueueId, hw: HwQueue, flags: BindFlags) -> Result<(), BackendError>;

    /// Start steering matching traffic to the datapath.
    fn install_rule(&self, rule: &SteeringRule) -> Result<(), BackendError>;

    /// Stop steering traffic for a previously installed rule.
    fn remove_rule(&self, rule: &SteeringRule) -> Result<(), BackendError>;

    /// Free slots in the fill ring.
    fn fill_ring_space(&self, queue: QueueId) -> usize;

    /// Post empty frames to the fill ring.
    ///
    /// Accepted frames are drained from the front of `frames`; whatever is
    /// left stays with the caller.
    fn fill_submit(&self, queue: QueueId, frames: &mut Vec<Frame>) -> Result<(), BackendError>;

    /// Move up to `max` received frames into `out`; returns the count.
    fn rx_reserve(
        &self,
        queue: QueueId,
        max: usize,
        out: &mut Vec<RxDescriptor>,
    ) -> Result<usize, BackendError>;

    /// Acknowledge `count` RX descriptors previously reserved.
    fn rx_release(&self, queue: QueueId, count: usize);

    /// Free slots in the TX ring, at most `max`.
    fn tx_reserve(&self, queue: QueueId, max: usize) -> usize;

    /// Hand framed packets to the TX ring.
    ///
    /// Accepted descriptors are drained from the front of `descriptors`.
    fn tx_submit(
        &self,
        queue: QueueId,
        descriptors: &mut Vec<TxDescriptor>,
    ) -> Result<(), BackendError>;

    /// Move up to `max` transmitted frames into `out`; returns the count.
    fn tx_completions_reserve(
        &self,
        queue: QueueId,
        max: usize,
        out: &mut Vec<Frame>,
    ) -> Result<usize, BackendError>;

    /// Acknowledge `count` completions previously reserved.
    fn tx_completions_release(&self, queue: QueueId, count: usize);

    /// Whether the TX ring needs an explicit kick.
    fn needs_wakeup(&self, queue: QueueId) -> bool;

    /// Kick the TX ring.
    fn poke_tx(&self, queue: QueueId) -> Result<(), BackendError>;

    /// Arm a one-shot notification for `direction` on `queue`.
    fn notify_async(
        &self,
        queue: QueueId,
        direction: NotifyDirection,
        waker: Arc<PartitionWaker>,
    ) -> Result<NotifyOutcome, BackendError>;

    /// Checksums the hardware computes for `queue`.
    fn offloads(&self, queue: QueueId) -> ChecksumOffloads;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_port() {
        let rules = [
            SteeringRule::UdpDst { port: 1 },
            SteeringRule::QuicFlowDstCid {
                port: 1,
                offset: 2,
                id: vec![9],
            },
            SteeringRule::Ipv6PortSet {
                address: Ipv6Addr::LOCALHOST,
                port: 1,
                tcp: true,
            },
        ];
        assert!(rules.iter().all(|rule| rule.port() == 1));
    }

    #[test]
    fn test_queue_id_display() {
        assert_eq!(QueueId(3).to_string(), "q3");
    }
}
