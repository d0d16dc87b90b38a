//! Scripted network stack.
//!
//! [`StaticNetworkStack`] answers route and neighbor queries from tables set
//! up in advance. It pairs with [`crate::LoopbackBackend`] to run the whole
//! datapath without touching the OS.

use rawpath_core::frame::MacAddress;
use rawpath_core::netstack::{BestRoute, InterfaceInfo, NeighborEntry, NeighborState, NetworkStack};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::thread;
use std::time::Duration;

#[derive(Debug, Default)]
struct Tables {
    interfaces: Vec<InterfaceInfo>,
    /// Per-destination routes; anything else uses `default_route`
    routes: HashMap<IpAddr, BestRoute>,
    default_route: Option<BestRoute>,
    /// Neighbor cache
    neighbors: HashMap<(IpAddr, u32), NeighborEntry>,
    /// Answers to on-wire solicitation
    solicit: HashMap<IpAddr, MacAddress>,
    solicit_delay: Option<Duration>,
}

/// Table-driven [`NetworkStack`].
#[derive(Debug, Default)]
pub struct StaticNetworkStack {
    tables: Mutex<Tables>,
    solicitations: AtomicU64,
}

impl StaticNetworkStack {
    /// Empty stack: no interfaces, no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stack with one interface and a default on-link route sourced from
    /// `local_ip`.
    pub fn single_interface(
        interface_index: u32,
        mac: MacAddress,
        queue_count: u32,
        local_ip: IpAddr,
    ) -> Self {
        let stack = Self::new();
        stack.add_interface(InterfaceInfo {
            index: interface_index,
            name: format!("lo{interface_index}"),
            mac,
            queue_count,
        });
        let next_hop = match local_ip {
            IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        };
        stack.set_default_route(BestRoute {
            interface_index,
            local_ip,
            next_hop,
        });
        stack
    }

    fn tables(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an interface.
    pub fn add_interface(&self, info: InterfaceInfo) {
        self.tables().interfaces.push(info);
    }

    /// Route used for destinations without a specific entry.
    pub fn set_default_route(&self, route: BestRoute) {
        self.tables().default_route = Some(route);
    }

    /// Route for one destination.
    pub fn add_route(&self, remote: IpAddr, route: BestRoute) {
        self.tables().routes.insert(remote, route);
    }

    /// Put an entry in the neighbor cache.
    pub fn add_neighbor(&self, ip: IpAddr, interface_index: u32, mac: MacAddress, state: NeighborState) {
        self.tables()
            .neighbors
            .insert((ip, interface_index), NeighborEntry { mac, state });
    }

    /// Make solicitation for `ip` succeed with `mac`. The answer is also
    /// cached as reachable, like a real stack would.
    pub fn answer_solicitation(&self, ip: IpAddr, mac: MacAddress) {
        self.tables().solicit.insert(ip, mac);
    }

    /// Delay every solicitation.
    pub fn set_solicit_delay(&self, delay: Duration) {
        self.tables().solicit_delay = Some(delay);
    }

    /// Number of solicitations performed.
    pub fn solicitations(&self) -> u64 {
        self.solicitations.load(Ordering::Relaxed)
    }
}

impl NetworkStack for StaticNetworkStack {
    fn interfaces(&self) -> io::Result<Vec<InterfaceInfo>> {
        Ok(self.tables().interfaces.clone())
    }

    fn best_route(&self, remote: IpAddr, local_hint: Option<IpAddr>) -> io::Result<BestRoute> {
        let tables = self.tables();
        let mut route = tables
            .routes
            .get(&remote)
            .or(tables.default_route.as_ref())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no route to {remote}")))?;
        if let Some(hint) = local_hint.filter(|ip| !ip.is_unspecified()) {
            route.local_ip = hint;
        }
        Ok(route)
    }

    fn neighbor(&self, ip: IpAddr, interface_index: u32) -> io::Result<Option<NeighborEntry>> {
        Ok(self.tables().neighbors.get(&(ip, interface_index)).copied())
    }

    fn resolve_neighbor(&self, ip: IpAddr, interface_index: u32) -> io::Result<MacAddress> {
        self.solicitations.fetch_add(1, Ordering::Relaxed);
        let delay = self.tables().solicit_delay;
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let mut tables = self.tables();
        let mac = tables.solicit.get(&ip).copied().ok_or_else(|| {
            io::Error::new(io::ErrorKind::TimedOut, format!("no answer from {ip}"))
        })?;
        tables.neighbors.insert(
            (ip, interface_index),
            NeighborEntry {
                mac,
                state: NeighborState::Reachable,
            },
        );
        Ok(mac)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
    const PEER: MacAddress = MacAddress([0x02, 0, 0, 0, 0, 0x02]);

    #[test]
    fn test_single_interface() {
        let stack = StaticNetworkStack::single_interface(3, MAC, 2, "10.0.0.1".parse().unwrap());
        let interfaces = stack.interfaces().unwrap();
        assert_eq!(interfaces.len(), 1);
        assert_eq!(interfaces[0].index, 3);
        assert_eq!(interfaces[0].queue_count, 2);

        let route = stack.best_route("10.0.0.2".parse().unwrap(), None).unwrap();
        assert_eq!(route.interface_index, 3);
        assert_eq!(route.local_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert!(route.next_hop.is_unspecified());
    }

    #[test]
    fn test_hint_overrides_source() {
        let stack = StaticNetworkStack::single_interface(1, MAC, 1, "10.0.0.1".parse().unwrap());
        let hint: IpAddr = "10.0.0.9".parse().unwrap();
        let route = stack.best_route("10.0.0.2".parse().unwrap(), Some(hint)).unwrap();
        assert_eq!(route.local_ip, hint);
        let route = stack
            .best_route("10.0.0.2".parse().unwrap(), Some("0.0.0.0".parse().unwrap()))
            .unwrap();
        assert_eq!(route.local_ip, "10.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn test_no_route() {
        let stack = StaticNetworkStack::new();
        let err = stack.best_route("10.0.0.2".parse().unwrap(), None).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn test_solicitation_populates_cache() {
        let stack = StaticNetworkStack::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert!(stack.neighbor(ip, 1).unwrap().is_none());
        assert!(stack.resolve_neighbor(ip, 1).is_err());

        stack.answer_solicitation(ip, PEER);
        assert_eq!(stack.resolve_neighbor(ip, 1).unwrap(), PEER);
        assert_eq!(stack.solicitations(), 2);
        let entry = stack.neighbor(ip, 1).unwrap().unwrap();
        assert_eq!(entry.mac, PEER);
        assert!(entry.state.is_usable());
    }
}
