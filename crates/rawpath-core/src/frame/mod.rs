//! Ethernet/IPv4/IPv6/UDP/TCP framing.
//!
//! Parsing turns a received Ethernet II frame into a [`ParsedFrame`]: the
//! route as seen from the local side, the transport classification and the
//! payload window. Writing prepends the inverse headers in front of an
//! outbound payload, growing the frame backward into reserved backfill.
//!
//! ```text
//!  ┌──────────┬───────────────┬──────────────┬───────────────────┐
//!  │ Ethernet │  IPv4 / IPv6  │  UDP / TCP   │      payload      │
//!  │   14 B   │   20 / 40 B   │   8 / 20 B   │                   │
//!  └──────────┴───────────────┴──────────────┴───────────────────┘
//!  ◀──────────────── header backfill ─────────▶
//! ```
//!
//! Every multi-byte field is read and written at an explicit byte offset in
//! network byte order. Nothing here panics on hostile input; a frame that
//! does not parse is reported as a [`ParseError`] and dropped by the caller.

pub mod checksum;
pub mod parse;
pub mod write;

pub use checksum::{checksum, checksum_accumulate, checksum_fold, transport_checksum};
pub use parse::{parse_ethernet, parse_ipv4, parse_ipv6, parse_tcp, parse_udp};
pub use write::{HeaderOptions, calculate_header_backfill, write_headers};

use crate::route::Route;
use std::fmt;
use std::ops::Range;
use thiserror::Error;

/// Ethernet II header size (no VLAN tag).
pub const ETHERNET_HEADER_SIZE: usize = 14;
/// IPv4 header size without options.
pub const IPV4_HEADER_SIZE: usize = 20;
/// IPv6 fixed header size.
pub const IPV6_HEADER_SIZE: usize = 40;
/// UDP header size.
pub const UDP_HEADER_SIZE: usize = 8;
/// TCP header size without options.
pub const TCP_HEADER_SIZE: usize = 20;

/// EtherType for IPv4.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// EtherType for IPv6.
pub const ETHERTYPE_IPV6: u16 = 0x86DD;

/// IP protocol number for TCP.
pub const IPPROTO_TCP: u8 = 6;
/// IP protocol number for UDP.
pub const IPPROTO_UDP: u8 = 17;

/// IPv4 version 4 with a 5-word header. Anything else is rejected.
pub const IPV4_VERSION_AND_HEADER_LENGTH: u8 = 0x45;
/// IP version number written in IPv6 headers.
pub const IPV6_VERSION: u8 = 6;
/// TTL / hop limit written on outbound packets.
pub const IP_DEFAULT_HOP_LIMIT: u8 = 128;
/// TCP window advertised on every segment.
pub const TCP_DEFAULT_WINDOW: u16 = 0xFFFF;

/// A 48-bit Ethernet MAC address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; 6]);

impl MacAddress {
    /// All-zero address.
    pub const ZERO: Self = Self([0; 6]);
    /// Broadcast address.
    pub const BROADCAST: Self = Self([0xFF; 6]);

    /// Whether this is the broadcast address.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Whether the group bit is set.
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// Whether this is a unicast address.
    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }

    /// Whether all octets are zero.
    pub fn is_zero(&self) -> bool {
        *self == Self::ZERO
    }

    /// Parse `aa:bb:cc:dd:ee:ff` notation.
    pub fn parse(s: &str) -> Option<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.trim().split(':');
        for octet in &mut octets {
            *octet = u8::from_str_radix(parts.next()?, 16).ok()?;
        }
        if parts.next().is_some() {
            return None;
        }
        Some(Self(octets))
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl fmt::Debug for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MacAddress({self})")
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

/// Classification of a received frame.
///
/// Ordered: everything at or above [`PacketType::Udp`] carries a transport
/// header and is eligible for socket demux.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum PacketType {
    /// Nothing parsed yet
    #[default]
    Unknown,
    /// IPv4 header parsed
    Ipv4,
    /// IPv6 header parsed
    Ipv6,
    /// UDP datagram
    Udp,
    /// TCP segment carrying data (pure ACK with payload)
    Tcp,
    /// TCP SYN
    TcpSyn,
    /// TCP SYN+ACK
    TcpSynAck,
    /// TCP FIN
    TcpFin,
}

impl PacketType {
    /// Whether this is a data-bearing packet (UDP or TCP data).
    pub fn is_data(self) -> bool {
        matches!(self, Self::Udp | Self::Tcp)
    }

    /// Whether this is a TCP control segment.
    pub fn is_tcp_control(self) -> bool {
        matches!(self, Self::TcpSyn | Self::TcpSynAck | Self::TcpFin)
    }
}

/// TCP header flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcpFlags(u8);

impl TcpFlags {
    /// No more data from sender
    pub const FIN: u8 = 0x01;
    /// Synchronize sequence numbers
    pub const SYN: u8 = 0x02;
    /// Reset the connection
    pub const RST: u8 = 0x04;
    /// Push function
    pub const PSH: u8 = 0x08;
    /// Acknowledgment field significant
    pub const ACK: u8 = 0x10;

    /// Create empty flags.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Create from raw bits.
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    /// Get raw bits.
    #[must_use]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check if a specific flag is set.
    #[must_use]
    pub const fn contains(self, flag: u8) -> bool {
        self.0 & flag != 0
    }

    /// Set a flag.
    #[must_use]
    pub const fn with(self, flag: u8) -> Self {
        Self(self.0 | flag)
    }
}

/// Result of parsing a received frame.
#[derive(Debug, Clone, Default)]
pub struct ParsedFrame {
    /// Addresses from the local point of view: destination fields become
    /// `local_*`, source fields become `remote_*` / next hop.
    pub route: Route,
    /// Transport classification.
    pub packet_type: PacketType,
    /// ECN bits from the IP header.
    pub ecn: u8,
    /// Payload window within the frame.
    pub payload: Range<usize>,
    /// TCP header length in bytes (0 for UDP).
    pub reserved_ex: u8,
    /// Sequence number of a TCP segment.
    pub tcp_seq: u32,
    /// Acknowledgment number of a TCP segment.
    pub tcp_ack: u32,
}

impl ParsedFrame {
    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }
}

/// Why a frame was not accepted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    /// A header did not fit in the remaining bytes
    #[error("{layer} header truncated: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Layer being parsed
        layer: &'static str,
        /// Bytes required
        expected: usize,
        /// Bytes available
        actual: usize,
    },

    /// Destination MAC is broadcast or multicast
    #[error("Destination {0} is not unicast")]
    NotUnicast(MacAddress),

    /// EtherType other than IPv4/IPv6
    #[error("Unsupported EtherType 0x{0:04x}")]
    UnsupportedEtherType(u16),

    /// IPv4 version/header length byte other than 0x45
    #[error("Unsupported IPv4 version/header length 0x{0:02x}")]
    InvalidIpv4Header(u8),

    /// IPv6 version nibble other than 6
    #[error("Unsupported IP version {0}")]
    InvalidIpVersion(u8),

    /// Declared length exceeds the buffer
    #[error("{layer} length {declared} exceeds available {available}")]
    LengthMismatch {
        /// Layer being parsed
        layer: &'static str,
        /// Length field value
        declared: usize,
        /// Bytes available
        available: usize,
    },

    /// IP protocol other than UDP/TCP
    #[error("Unsupported IP protocol {0}")]
    UnsupportedProtocol(u8),

    /// TCP flag combination that carries nothing for us
    #[error("Ignored TCP flags 0x{0:02x}")]
    IgnoredTcpFlags(u8),
}

impl ParseError {
    /// Whether this is expected protocol noise rather than a malformed frame.
    pub fn is_noise(&self) -> bool {
        matches!(self, Self::IgnoredTcpFlags(_))
    }
}

/// Why headers could not be written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WriteError {
    /// Not enough bytes in front of the payload
    #[error("Insufficient backfill: need {needed} bytes, have {available}")]
    InsufficientBackfill {
        /// Bytes of headers to write
        needed: usize,
        /// Bytes available before the payload
        available: usize,
    },

    /// Payload window does not fit inside the buffer
    #[error("Payload window {start}..{end} exceeds buffer of {len} bytes")]
    PayloadOutOfBounds {
        /// Window start
        start: usize,
        /// Window end
        end: usize,
        /// Buffer length
        len: usize,
    },

    /// Payload does not fit in a 16-bit length field
    #[error("Payload of {0} bytes too large")]
    PayloadTooLarge(usize),

    /// Local and remote addresses have different families
    #[error("Address family mismatch between local and remote")]
    FamilyMismatch,
}
