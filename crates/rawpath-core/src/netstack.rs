//! The OS network stack as seen by the resolver.
//!
//! Route and neighbor tables stay owned by the operating system; the
//! datapath only queries them. Implementations live next to the backends.

use crate::frame::MacAddress;
use std::io;
use std::net::IpAddr;

/// A network interface the datapath may send on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceInfo {
    /// OS interface index
    pub index: u32,
    /// Interface name
    pub name: String,
    /// Hardware address
    pub mac: MacAddress,
    /// Number of hardware queues
    pub queue_count: u32,
}

/// Result of a best-route lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BestRoute {
    /// Outgoing interface
    pub interface_index: u32,
    /// Source address to use
    pub local_ip: IpAddr,
    /// Gateway, or unspecified for on-link destinations
    pub next_hop: IpAddr,
}

/// Neighbor cache entry state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NeighborState {
    /// Resolution in progress or failed; MAC not usable
    Incomplete,
    /// MAC usable
    Reachable,
    /// MAC usable but not recently confirmed
    Stale,
    /// Statically configured
    Permanent,
}

impl NeighborState {
    /// Whether the cached MAC can be used to send.
    pub fn is_usable(self) -> bool {
        !matches!(self, Self::Incomplete)
    }
}

/// A neighbor cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborEntry {
    /// Link-layer address
    pub mac: MacAddress,
    /// Entry state
    pub state: NeighborState,
}

/// Route and neighbor lookups against the OS.
pub trait NetworkStack: Send + Sync {
    /// Interfaces known to the stack.
    fn interfaces(&self) -> io::Result<Vec<InterfaceInfo>>;

    /// Best route to `remote`, preferring `local_hint` as source when it is
    /// specified.
    fn best_route(&self, remote: IpAddr, local_hint: Option<IpAddr>) -> io::Result<BestRoute>;

    /// Cached neighbor entry for `ip` on `interface_index`, if any.
    fn neighbor(&self, ip: IpAddr, interface_index: u32) -> io::Result<Option<NeighborEntry>>;

    /// Resolve `ip` on the wire. May block; only called from the resolver
    /// worker.
    fn resolve_neighbor(&self, ip: IpAddr, interface_index: u32) -> io::Result<MacAddress>;
}
