//! Linux network stack provider.
//!
//! Reads the route and neighbor tables the kernel exposes under `/proc/net`
//! and interface details from `/sys/class/net`. Neighbor solicitation is
//! left to the kernel: a datagram sent to the neighbor through the right
//! interface makes it ARP, and the answer shows up in `/proc/net/arp`.
//!
//! Only IPv4 neighbors are available this way; IPv6 neighbor queries return
//! [`io::ErrorKind::Unsupported`].

use rawpath_core::frame::MacAddress;
use rawpath_core::netstack::{BestRoute, InterfaceInfo, NeighborEntry, NeighborState, NetworkStack};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fs;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Route is up
const RTF_UP: u32 = 0x0001;
/// Route rejects traffic
const RTF_REJECT: u32 = 0x0200;
/// ARP entry complete
const ATF_COM: u32 = 0x02;
/// ARP entry permanent
const ATF_PERM: u32 = 0x04;

/// Discard service; solicitation datagrams go here.
const SOLICIT_PORT: u16 = 9;

/// Default time to wait for a neighbor to answer.
pub const DEFAULT_SOLICIT_TIMEOUT: Duration = Duration::from_secs(1);

/// A malformed line in a kernel table.
#[derive(Debug, Error)]
#[error("{table} line {line}: {reason}")]
pub struct ProcParseError {
    /// Table being parsed
    pub table: &'static str,
    /// 1-based line number
    pub line: usize,
    /// What was wrong
    pub reason: String,
}

impl From<ProcParseError> for io::Error {
    fn from(e: ProcParseError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// A kernel routing table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    /// Interface name
    pub interface: String,
    /// Destination prefix
    pub destination: IpAddr,
    /// Prefix length
    pub prefix_len: u8,
    /// Gateway, unspecified when on-link
    pub gateway: IpAddr,
    /// Route metric
    pub metric: u32,
}

impl RouteEntry {
    /// Whether `ip` falls inside this entry's prefix.
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.destination, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = prefix_mask_v4(self.prefix_len);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = prefix_mask_v6(self.prefix_len);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

fn prefix_mask_v4(len: u8) -> u32 {
    match len {
        0 => 0,
        n => u32::MAX << (32 - u32::from(n.min(32))),
    }
}

fn prefix_mask_v6(len: u8) -> u128 {
    match len {
        0 => 0,
        n => u128::MAX << (128 - u32::from(n.min(128))),
    }
}

/// An entry of `/proc/net/arp`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpEntry {
    /// Neighbor address
    pub ip: Ipv4Addr,
    /// Link-layer address
    pub mac: MacAddress,
    /// ATF_* flags
    pub flags: u32,
    /// Interface name
    pub device: String,
}

impl ArpEntry {
    /// Neighbor state implied by the flags. procfs does not distinguish
    /// stale from reachable.
    pub fn state(&self) -> NeighborState {
        if self.flags & ATF_PERM != 0 {
            NeighborState::Permanent
        } else if self.flags & ATF_COM != 0 {
            NeighborState::Reachable
        } else {
            NeighborState::Incomplete
        }
    }
}

fn malformed(table: &'static str, line: usize, reason: impl Into<String>) -> ProcParseError {
    ProcParseError {
        table,
        line: line + 1,
        reason: reason.into(),
    }
}

fn hex_u32(table: &'static str, line: usize, field: &str) -> Result<u32, ProcParseError> {
    u32::from_str_radix(field, 16).map_err(|e| malformed(table, line, format!("{field:?}: {e}")))
}

fn hex_ipv6(table: &'static str, line: usize, field: &str) -> Result<Ipv6Addr, ProcParseError> {
    u128::from_str_radix(field, 16)
        .map(Ipv6Addr::from)
        .map_err(|e| malformed(table, line, format!("{field:?}: {e}")))
}

/// Parse `/proc/net/route`.
///
/// Addresses are printed as native-endian hex of network-order words.
/// Routes that are down are skipped.
pub fn parse_ipv4_routes(text: &str) -> Result<Vec<RouteEntry>, ProcParseError> {
    const TABLE: &str = "route";
    let mut routes = Vec::new();
    for (n, line) in text.lines().enumerate().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 8 {
            return Err(malformed(TABLE, n, "too few fields"));
        }
        let flags = hex_u32(TABLE, n, fields[3])?;
        if flags & RTF_UP == 0 {
            continue;
        }
        let destination = Ipv4Addr::from(hex_u32(TABLE, n, fields[1])?.to_ne_bytes());
        let gateway = Ipv4Addr::from(hex_u32(TABLE, n, fields[2])?.to_ne_bytes());
        let metric = fields[6]
            .parse()
            .map_err(|e| malformed(TABLE, n, format!("metric: {e}")))?;
        let mask = Ipv4Addr::from(hex_u32(TABLE, n, fields[7])?.to_ne_bytes());
        routes.push(RouteEntry {
            interface: fields[0].to_string(),
            destination: IpAddr::V4(destination),
            prefix_len: u32::from(mask).count_ones() as u8,
            gateway: IpAddr::V4(gateway),
            metric,
        });
    }
    Ok(routes)
}

/// Parse `/proc/net/ipv6_route`. Rejecting routes and routes that are down
/// are skipped.
pub fn parse_ipv6_routes(text: &str) -> Result<Vec<RouteEntry>, ProcParseError> {
    const TABLE: &str = "ipv6_route";
    let mut routes = Vec::new();
    for (n, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 10 {
            return Err(malformed(TABLE, n, "too few fields"));
        }
        let flags = hex_u32(TABLE, n, fields[8])?;
        if flags & RTF_UP == 0 || flags & RTF_REJECT != 0 {
            continue;
        }
        routes.push(RouteEntry {
            interface: fields[9].to_string(),
            destination: IpAddr::V6(hex_ipv6(TABLE, n, fields[0])?),
            prefix_len: hex_u32(TABLE, n, fields[1])? as u8,
            gateway: IpAddr::V6(hex_ipv6(TABLE, n, fields[4])?),
            metric: hex_u32(TABLE, n, fields[5])?,
        });
    }
    Ok(routes)
}

/// Parse `/proc/net/arp`.
pub fn parse_arp(text: &str) -> Result<Vec<ArpEntry>, ProcParseError> {
    const TABLE: &str = "arp";
    let mut entries = Vec::new();
    for (n, line) in text.lines().enumerate().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < 6 {
            return Err(malformed(TABLE, n, "too few fields"));
        }
        let ip = fields[0]
            .parse()
            .map_err(|e| malformed(TABLE, n, format!("address: {e}")))?;
        let flags = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16)
            .map_err(|e| malformed(TABLE, n, format!("flags: {e}")))?;
        let mac = MacAddress::parse(fields[3])
            .ok_or_else(|| malformed(TABLE, n, format!("hardware address {:?}", fields[3])))?;
        entries.push(ArpEntry {
            ip,
            mac,
            flags,
            device: fields[5].to_string(),
        });
    }
    Ok(entries)
}

/// Longest-prefix match, lowest metric first among equal prefixes.
pub fn best_match(routes: &[RouteEntry], remote: IpAddr) -> Option<&RouteEntry> {
    routes
        .iter()
        .filter(|r| r.contains(remote))
        .min_by(|a, b| b.prefix_len.cmp(&a.prefix_len).then(a.metric.cmp(&b.metric)))
}

/// [`NetworkStack`] over Linux procfs and sysfs.
#[derive(Debug, Clone)]
pub struct ProcNetStack {
    proc_root: PathBuf,
    sys_root: PathBuf,
    solicit_timeout: Duration,
    poll_interval: Duration,
}

impl Default for ProcNetStack {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcNetStack {
    /// Stack reading `/proc` and `/sys`.
    pub fn new() -> Self {
        Self::with_roots("/proc", "/sys")
    }

    /// Stack reading tables from alternative mount points.
    pub fn with_roots(proc_root: impl Into<PathBuf>, sys_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
            sys_root: sys_root.into(),
            solicit_timeout: DEFAULT_SOLICIT_TIMEOUT,
            poll_interval: Duration::from_millis(10),
        }
    }

    /// Set how long [`NetworkStack::resolve_neighbor`] waits for an answer.
    pub fn with_solicit_timeout(mut self, timeout: Duration) -> Self {
        self.solicit_timeout = timeout;
        self
    }

    fn read_proc(&self, table: &str) -> io::Result<String> {
        fs::read_to_string(self.proc_root.join("net").join(table))
    }

    fn read_sys(&self, interface: &str, attribute: &str) -> io::Result<String> {
        fs::read_to_string(self.sys_root.join("class/net").join(interface).join(attribute))
    }

    fn interface_index(&self, name: &str) -> io::Result<u32> {
        self.read_sys(name, "ifindex")?
            .trim()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("{name} ifindex: {e}")))
    }

    fn interface_name(&self, index: u32) -> io::Result<String> {
        for entry in fs::read_dir(self.sys_root.join("class/net"))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            if self.interface_index(&name).ok() == Some(index) {
                return Ok(name);
            }
        }
        Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("no interface with index {index}"),
        ))
    }

    fn queue_count(&self, name: &str) -> u32 {
        let Ok(dir) = fs::read_dir(self.sys_root.join("class/net").join(name).join("queues")) else {
            return 1;
        };
        let rx = dir
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("rx-"))
            .count() as u32;
        rx.max(1)
    }

    fn routes(&self, remote: IpAddr) -> io::Result<Vec<RouteEntry>> {
        Ok(match remote {
            IpAddr::V4(_) => parse_ipv4_routes(&self.read_proc("route")?)?,
            IpAddr::V6(_) => parse_ipv6_routes(&self.read_proc("ipv6_route")?)?,
        })
    }

    /// Source address the kernel would pick for `remote`.
    fn source_for(remote: IpAddr) -> io::Result<IpAddr> {
        let target = SocketAddr::new(remote, SOLICIT_PORT);
        let socket = Socket::new(Domain::for_address(target), Type::DGRAM, Some(Protocol::UDP))?;
        socket.connect(&SockAddr::from(target))?;
        socket
            .local_addr()?
            .as_socket()
            .map(|addr| addr.ip())
            .ok_or_else(|| io::Error::new(io::ErrorKind::AddrNotAvailable, "no source address"))
    }

    fn solicit(&self, ip: Ipv4Addr, interface: &str) -> io::Result<()> {
        let target = SocketAddr::new(IpAddr::V4(ip), SOLICIT_PORT);
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        #[cfg(any(target_os = "linux", target_os = "android"))]
        socket.bind_device(Some(interface.as_bytes()))?;
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let _ = interface;
        socket.set_nonblocking(true)?;
        socket.send_to(&[], &SockAddr::from(target))?;
        Ok(())
    }
}

fn ipv6_unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "IPv6 neighbor table is not available through procfs",
    )
}

impl NetworkStack for ProcNetStack {
    fn interfaces(&self) -> io::Result<Vec<InterfaceInfo>> {
        let mut interfaces = Vec::new();
        for entry in fs::read_dir(self.sys_root.join("class/net"))? {
            let name = entry?.file_name().to_string_lossy().into_owned();
            let Ok(index) = self.interface_index(&name) else {
                continue;
            };
            let Some(mac) = self
                .read_sys(&name, "address")
                .ok()
                .and_then(|s| MacAddress::parse(&s))
            else {
                tracing::trace!(interface = %name, "Skipping interface without Ethernet address");
                continue;
            };
            interfaces.push(InterfaceInfo {
                index,
                queue_count: self.queue_count(&name),
                name,
                mac,
            });
        }
        interfaces.sort_by_key(|i| i.index);
        Ok(interfaces)
    }

    fn best_route(&self, remote: IpAddr, local_hint: Option<IpAddr>) -> io::Result<BestRoute> {
        let routes = self.routes(remote)?;
        let entry = best_match(&routes, remote).ok_or_else(|| {
            io::Error::new(io::ErrorKind::NetworkUnreachable, format!("no route to {remote}"))
        })?;
        let interface_index = self.interface_index(&entry.interface)?;
        let local_ip = match local_hint.filter(|ip| !ip.is_unspecified()) {
            Some(hint) => hint,
            None => Self::source_for(remote)?,
        };
        tracing::trace!(
            %remote,
            interface = %entry.interface,
            prefix_len = entry.prefix_len,
            gateway = %entry.gateway,
            "Best route"
        );
        Ok(BestRoute {
            interface_index,
            local_ip,
            next_hop: entry.gateway,
        })
    }

    fn neighbor(&self, ip: IpAddr, interface_index: u32) -> io::Result<Option<NeighborEntry>> {
        let IpAddr::V4(ip) = ip else {
            return Err(ipv6_unsupported());
        };
        let device = self.interface_name(interface_index)?;
        let table = parse_arp(&self.read_proc("arp")?)?;
        Ok(table
            .into_iter()
            .find(|e| e.ip == ip && e.device == device)
            .map(|e| NeighborEntry {
                mac: e.mac,
                state: e.state(),
            }))
    }

    fn resolve_neighbor(&self, ip: IpAddr, interface_index: u32) -> io::Result<MacAddress> {
        let IpAddr::V4(v4) = ip else {
            return Err(ipv6_unsupported());
        };
        let device = self.interface_name(interface_index)?;
        self.solicit(v4, &device)?;

        let deadline = Instant::now() + self.solicit_timeout;
        loop {
            if let Some(entry) = self.neighbor(ip, interface_index)? {
                if entry.state.is_usable() {
                    tracing::debug!(%ip, mac = %entry.mac, interface = %device, "Neighbor resolved");
                    return Ok(entry.mac);
                }
            }
            if Instant::now() >= deadline {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer from {ip} on {device}"),
                ));
            }
            thread::sleep(self.poll_interval);
        }
    }
}
