//! Raw sockets.
//!
//! A [`RawSocket`] never touches the OS stack for data. It exists so the
//! receive path can demultiplex frames to a protocol-engine binding, and so
//! the send path knows how to frame packets (UDP or TCP disguise).
//!
//! When port reservation is enabled each socket also holds an auxiliary OS
//! socket bound to the same port, which keeps the kernel from handing that
//! port to anybody else while the raw socket lives.

use crate::backend::SteeringRule;
use crate::buffer_pool::TxPacket;
use crate::rundown::Rundown;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

/// Longest CIBIR id accepted.
pub const MAX_CIBIR_ID_LENGTH: usize = 6;

static NEXT_SOCKET_ID: AtomicU32 = AtomicU32::new(1);

/// CID-based routing id: a byte pattern embedded in QUIC connection ids that
/// lets several sockets share one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CibirId {
    /// Pattern bytes, at most [`MAX_CIBIR_ID_LENGTH`]
    pub id: Vec<u8>,
    /// Offset of the pattern within the source CID
    pub offset_src: u8,
    /// Offset of the pattern within the destination CID
    pub offset_dst: u8,
}

/// Parameters for [`crate::datapath::RawDatapath::socket_create`].
#[derive(Debug, Clone, Default)]
pub struct SocketConfig {
    /// Local address; `None` or unspecified IP binds all addresses, port 0
    /// picks an ephemeral port
    pub local_address: Option<SocketAddr>,
    /// Remote address for a connected (client) socket
    pub remote_address: Option<SocketAddr>,
    /// Disguise QUIC as TCP
    pub use_tcp: bool,
    /// CID-based routing id
    pub cibir: Option<CibirId>,
    /// Opaque value handed back with received packets
    pub context: u64,
}

/// A raw socket bound to a local port.
pub struct RawSocket {
    id: u32,
    local_address: SocketAddr,
    remote_address: Option<SocketAddr>,
    use_tcp: bool,
    cibir: Option<CibirId>,
    context: u64,
    pub(crate) rundown: Rundown,
    reservation: Mutex<Option<PortReservation>>,
    pub(crate) paused_send: Mutex<Option<TxPacket>>,
    pub(crate) cached_rst: Mutex<Option<TxPacket>>,
}

impl RawSocket {
    pub(crate) fn new(
        local_address: SocketAddr,
        remote_address: Option<SocketAddr>,
        use_tcp: bool,
        cibir: Option<CibirId>,
        context: u64,
        reservation: Option<PortReservation>,
    ) -> Self {
        Self {
            id: NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed),
            local_address,
            remote_address,
            use_tcp,
            cibir,
            context,
            rundown: Rundown::new(),
            reservation: Mutex::new(reservation),
            paused_send: Mutex::new(None),
            cached_rst: Mutex::new(None),
        }
    }

    /// Process-unique socket id.
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Local address. The IP is unspecified for sockets bound to all
    /// addresses.
    pub fn local_address(&self) -> SocketAddr {
        self.local_address
    }

    /// Remote address of a connected socket.
    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote_address
    }

    /// Whether the socket has a fixed remote.
    pub fn is_connected(&self) -> bool {
        self.remote_address.is_some()
    }

    /// Whether the socket accepts any remote.
    pub fn is_wildcard(&self) -> bool {
        self.remote_address.is_none()
    }

    /// Whether packets are framed as TCP.
    pub fn use_tcp(&self) -> bool {
        self.use_tcp
    }

    /// CID-based routing id.
    pub fn cibir(&self) -> Option<&CibirId> {
        self.cibir.as_ref()
    }

    /// Opaque value from [`SocketConfig::context`].
    pub fn context(&self) -> u64 {
        self.context
    }

    /// Largest IP packet the socket sends, leaving room for the TCP header
    /// in disguise mode.
    pub fn local_mtu(&self) -> u16 {
        if self.use_tcp { 1488 } else { 1500 }
    }

    /// IPv6 flow label used on every packet this socket sends.
    pub fn flow_label(&self) -> u32 {
        self.id & 0x000F_FFFF
    }

    /// Whether a frame with these addresses belongs to this socket.
    ///
    /// Ports are compared for both kinds; a connected socket additionally
    /// requires its remote address and, unless bound to all addresses, its
    /// local IP to match.
    pub fn matches(&self, local: &SocketAddr, remote: &SocketAddr) -> bool {
        if local.port() != self.local_address.port() {
            return false;
        }
        match self.remote_address {
            None => true,
            Some(own_remote) => {
                (self.local_address.ip().is_unspecified()
                    || same_ip(local.ip(), self.local_address.ip()))
                    && same_ip(remote.ip(), own_remote.ip())
                    && remote.port() == own_remote.port()
            }
        }
    }

    /// Whether two sockets cannot share the pool.
    ///
    /// Wildcards collide with wildcards on the same port; connected sockets
    /// collide with connected sockets that have the same local IP and remote.
    pub(crate) fn conflicts_with(&self, other: &RawSocket) -> bool {
        if self.local_address.port() != other.local_address.port() {
            return false;
        }
        match (self.remote_address, other.remote_address) {
            (None, None) => true,
            (Some(a), Some(b)) => {
                same_ip(self.local_address.ip(), other.local_address.ip())
                    && same_ip(a.ip(), b.ip())
                    && a.port() == b.port()
            }
            _ => false,
        }
    }

    /// NIC steering rules that direct this socket's traffic to the datapath.
    pub fn steering_rules(&self) -> Vec<SteeringRule> {
        let port = self.local_address.port();
        match self.remote_address {
            None => {
                let mut rules = Vec::new();
                if let Some(cibir) = &self.cibir {
                    rules.push(SteeringRule::QuicFlowSrcCid {
                        port,
                        offset: cibir.offset_src,
                        id: cibir.id.clone(),
                    });
                    rules.push(SteeringRule::QuicFlowDstCid {
                        port,
                        offset: cibir.offset_dst,
                        id: cibir.id.clone(),
                    });
                    if self.use_tcp {
                        rules.push(SteeringRule::TcpControlDst { port });
                    }
                } else if self.use_tcp {
                    rules.push(SteeringRule::TcpDst { port });
                } else {
                    rules.push(SteeringRule::UdpDst { port });
                }
                rules
            }
            Some(_) => match self.local_address.ip().to_canonical() {
                IpAddr::V4(address) => vec![SteeringRule::Ipv4PortSet {
                    address,
                    port,
                    tcp: self.use_tcp,
                }],
                IpAddr::V6(address) => vec![SteeringRule::Ipv6PortSet {
                    address,
                    port,
                    tcp: self.use_tcp,
                }],
            },
        }
    }

    /// Drop the OS port reservation.
    pub(crate) fn release_reservation(&self) {
        let reservation = self
            .reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(reservation);
    }

    /// Whether the socket still holds an OS port reservation.
    pub fn has_reservation(&self) -> bool {
        self.reservation
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl fmt::Debug for RawSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawSocket")
            .field("id", &self.id)
            .field("local", &self.local_address)
            .field("remote", &self.remote_address)
            .field("tcp", &self.use_tcp)
            .finish()
    }
}

fn same_ip(a: IpAddr, b: IpAddr) -> bool {
    a.to_canonical() == b.to_canonical()
}

fn to_mapped_v6(address: SocketAddr) -> SocketAddr {
    match address {
        SocketAddr::V4(v4) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        v6 => v6,
    }
}

fn from_mapped_v6(address: SocketAddr) -> SocketAddr {
    SocketAddr::new(address.ip().to_canonical(), address.port())
}

fn sock_addr_to_std(address: SockAddr) -> io::Result<SocketAddr> {
    address
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP socket address"))
}

fn dual_stack(ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::IPV6, ty, Some(protocol))?;
    socket.set_only_v6(false)?;
    Ok(socket)
}

/// An auxiliary dual-stack OS socket holding a local port.
pub(crate) struct PortReservation {
    _socket: Socket,
}

impl PortReservation {
    /// Bind an auxiliary socket for `local` and report the address the OS
    /// assigned.
    ///
    /// For connected sockets the OS also picks the source IP: UDP sockets
    /// connect the auxiliary socket itself, TCP sockets use a throwaway UDP
    /// socket because connecting a stream socket would start a handshake.
    pub(crate) fn reserve(
        local: SocketAddr,
        remote: Option<SocketAddr>,
        use_tcp: bool,
        reuse_address: bool,
    ) -> io::Result<(Self, SocketAddr)> {
        let (ty, protocol) = if use_tcp {
            (Type::STREAM, Protocol::TCP)
        } else {
            (Type::DGRAM, Protocol::UDP)
        };
        let socket = dual_stack(ty, protocol)?;
        if reuse_address {
            socket.set_reuse_address(true)?;
        }
        socket.bind(&to_mapped_v6(local).into())?;

        let assigned = match remote {
            None => from_mapped_v6(sock_addr_to_std(socket.local_addr()?)?),
            Some(remote) if use_tcp => {
                let port = sock_addr_to_std(socket.local_addr()?)?.port();
                let temp = dual_stack(Type::DGRAM, Protocol::UDP)?;
                temp.bind(&to_mapped_v6(SocketAddr::new(local.ip(), 0)).into())?;
                temp.connect(&to_mapped_v6(remote).into())?;
                let chosen = from_mapped_v6(sock_addr_to_std(temp.local_addr()?)?);
                SocketAddr::new(chosen.ip(), port)
            }
            Some(remote) => {
                socket.connect(&to_mapped_v6(remote).into())?;
                from_mapped_v6(sock_addr_to_std(socket.local_addr()?)?)
            }
        };

        Ok((Self { _socket: socket }, assigned))
    }
}

impl fmt::Debug for PortReservation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PortReservation").finish_non_exhaustive()
    }
}

/// Unspecified address of the same family as `address`, IPv6 when unknown.
pub(crate) fn unspecified_like(address: Option<&SocketAddr>) -> IpAddr {
    match address {
        Some(SocketAddr::V4(_)) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        _ => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}
