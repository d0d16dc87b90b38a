//! # RAWPATH Core
//!
//! Backend-agnostic core of a kernel-bypass datapath for QUIC.
//!
//! This crate provides:
//! - Ethernet/IPv4/IPv6/UDP/TCP framing (parse and write, with checksums)
//! - Socket demultiplexing keyed by local port, with rundown-protected lookups
//! - Next-hop route resolution against the OS route and neighbor tables
//! - Per-queue frame pools and worker partitions driving descriptor rings
//! - TCP disguise: QUIC payloads framed as TCP with a minimal handshake
//! - The [`RawBackend`] trait implemented by AF_XDP style backends
//!
//! The entry point is [`RawDatapath`].

#![warn(missing_docs)]
#![warn(clippy::all)]

// Framing and lookup structures
pub mod frame;
pub mod hash_index;
pub mod route;

// Sockets
pub mod rundown;
pub mod socket;
pub mod socket_pool;

// Resolution
pub mod netstack;
pub mod resolver;

// Queues, buffers and workers
pub mod backend;
pub mod buffer_pool;
pub mod partition;
pub mod queue;

pub mod config;
pub mod datapath;
pub mod error;

pub use backend::{
    BindFlags, ChecksumOffloads, HwQueue, NotifyDirection, NotifyOutcome, QueueId, RawBackend,
    RxDescriptor, SteeringRule, TxDescriptor,
};
pub use buffer_pool::{Frame, FramePool, RxPacket, TxPacket};
pub use config::DatapathConfig;
pub use datapath::{RawDatapath, ReceiveHandler};
pub use error::{BackendError, DatapathError, Result};
pub use frame::{MacAddress, PacketType, ParsedFrame, TcpFlags};
pub use netstack::{BestRoute, InterfaceInfo, NeighborEntry, NeighborState, NetworkStack};
pub use partition::PartitionWaker;
pub use queue::{Queue, QueueStats, QueueStatsSnapshot};
pub use resolver::{ResolveStatus, RouteCallback, RouteCompletion, RouteResolver};
pub use route::{Route, RouteState, TcpState};
pub use socket::{CibirId, RawSocket, SocketConfig};
pub use socket_pool::SocketPool;
