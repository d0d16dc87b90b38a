//! # RAWPATH Transport
//!
//! Backends and network stack providers for [`rawpath_core`].
//!
//! - [`LoopbackBackend`]: a software NIC over in-memory descriptor rings,
//!   for tests and for running the datapath without hardware
//! - [`ProcNetStack`]: route and neighbor lookups through Linux procfs
//! - [`StaticNetworkStack`]: table-driven lookups for tests
//!
//! ## Example
//!
//! ```no_run
//! use rawpath_core::{DatapathConfig, MacAddress, RawDatapath};
//! use rawpath_transport::{LoopbackBackend, LoopbackConfig, StaticNetworkStack};
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = LoopbackBackend::new(LoopbackConfig::default())?;
//! let stack = StaticNetworkStack::single_interface(
//!     1,
//!     MacAddress([0x02, 0, 0, 0, 0, 0x01]),
//!     1,
//!     "10.0.0.1".parse()?,
//! );
//! let datapath = RawDatapath::new(
//!     DatapathConfig::default(),
//!     backend,
//!     Arc::new(stack),
//!     |socket, packets| {
//!         tracing::info!(socket = socket.id(), count = packets.len(), "received");
//!     },
//! )?;
//! datapath.start()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod loopback;
pub mod proc_net;
pub mod ring;
pub mod static_stack;

pub use loopback::{
    LoopbackBackend, LoopbackConfig, LoopbackStats, LoopbackStatsSnapshot, TransmittedFrame,
};
pub use proc_net::{ProcNetStack, ProcParseError};
pub use ring::SoftRing;
pub use static_stack::StaticNetworkStack;
