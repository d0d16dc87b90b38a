//! Receive-side header parsing.
//!
//! Each layer validates its own lengths before touching a byte and then
//! hands the remaining window to the next layer. Offsets stored in the
//! [`ParsedFrame`] are relative to the start of the Ethernet frame.
//!
//! ```text
//!  Ethernet        IPv4                      IPv6
//!  0   6  dst      0   1  ver/ihl (0x45)     0   4  ver|class|ecn|flow
//!  6   6  src      1   1  tos (ecn = & 3)    4   2  payload length
//!  12  2  type     2   2  total length       6   1  next header
//!                  9   1  protocol           7   1  hop limit
//!                  12  4  source             8   16 source
//!                  16  4  destination        24  16 destination
//!
//!  UDP             TCP
//!  0   2  src      0   2  src        12  1  data offset << 4
//!  2   2  dst      2   2  dst        13  1  flags
//!  4   2  length   4   4  seq        14  2  window
//!  6   2  csum     8   4  ack        16  2  csum
//! ```

use super::{
    ETHERNET_HEADER_SIZE, ETHERTYPE_IPV4, ETHERTYPE_IPV6, IPPROTO_TCP, IPPROTO_UDP,
    IPV4_HEADER_SIZE, IPV4_VERSION_AND_HEADER_LENGTH, IPV6_HEADER_SIZE, IPV6_VERSION, MacAddress,
    PacketType, ParseError, ParsedFrame, TCP_HEADER_SIZE, TcpFlags, UDP_HEADER_SIZE,
};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn require(layer: &'static str, expected: usize, actual: usize) -> Result<(), ParseError> {
    if actual < expected {
        return Err(ParseError::TooShort {
            layer,
            expected,
            actual,
        });
    }
    Ok(())
}

/// Parse an Ethernet II frame and everything above it.
///
/// # Errors
///
/// Returns a [`ParseError`] for anything that is not a unicast IPv4/IPv6
/// UDP datagram or an interesting TCP segment. The frame should be dropped.
pub fn parse_ethernet(frame: &[u8]) -> Result<ParsedFrame, ParseError> {
    require("Ethernet", ETHERNET_HEADER_SIZE, frame.len())?;

    let mut destination = [0u8; 6];
    destination.copy_from_slice(&frame[0..6]);
    let destination = MacAddress(destination);
    if destination.is_broadcast() || destination.is_multicast() {
        return Err(ParseError::NotUnicast(destination));
    }

    let mut source = [0u8; 6];
    source.copy_from_slice(&frame[6..12]);

    let mut parsed = ParsedFrame::default();
    parsed.route.local_link_layer_address = destination;
    parsed.route.next_hop_link_layer_address = MacAddress(source);

    let remaining = frame.len() - ETHERNET_HEADER_SIZE;
    match read_u16(frame, 12) {
        ETHERTYPE_IPV4 => parse_ipv4(&mut parsed, frame, ETHERNET_HEADER_SIZE, remaining)?,
        ETHERTYPE_IPV6 => parse_ipv6(&mut parsed, frame, ETHERNET_HEADER_SIZE, remaining)?,
        other => return Err(ParseError::UnsupportedEtherType(other)),
    }

    Ok(parsed)
}

/// Parse an IPv4 header at `offset` with `len` bytes available.
///
/// # Errors
///
/// Rejects headers with options (`0x45` is the only accepted
/// version/header-length byte), total lengths larger than the buffer and
/// protocols other than UDP/TCP.
pub fn parse_ipv4(
    parsed: &mut ParsedFrame,
    frame: &[u8],
    offset: usize,
    len: usize,
) -> Result<(), ParseError> {
    let len = len.min(frame.len().saturating_sub(offset));
    require("IPv4", IPV4_HEADER_SIZE, len)?;
    let header = &frame[offset..offset + IPV4_HEADER_SIZE];

    if header[0] != IPV4_VERSION_AND_HEADER_LENGTH {
        return Err(ParseError::InvalidIpv4Header(header[0]));
    }

    let total_length = usize::from(read_u16(header, 2));
    if total_length > len {
        return Err(ParseError::LengthMismatch {
            layer: "IPv4",
            declared: total_length,
            available: len,
        });
    }
    // Covers the header itself; the transport parser sees nothing otherwise.
    require("IPv4 total length", IPV4_HEADER_SIZE, total_length)?;

    parsed.packet_type = PacketType::Ipv4;
    parsed.ecn = header[1] & 0x03;

    let source = Ipv4Addr::new(header[12], header[13], header[14], header[15]);
    let destination = Ipv4Addr::new(header[16], header[17], header[18], header[19]);
    parsed.route.remote_address = SocketAddr::new(IpAddr::V4(source), 0);
    parsed.route.local_address = SocketAddr::new(IpAddr::V4(destination), 0);

    let l4_offset = offset + IPV4_HEADER_SIZE;
    let l4_len = total_length - IPV4_HEADER_SIZE;
    match header[9] {
        IPPROTO_UDP => parse_udp(parsed, frame, l4_offset, l4_len),
        IPPROTO_TCP => parse_tcp(parsed, frame, l4_offset, l4_len),
        other => Err(ParseError::UnsupportedProtocol(other)),
    }
}

/// Parse a fixed IPv6 header at `offset` with `len` bytes available.
///
/// # Errors
///
/// Rejects truncated headers, payload lengths larger than the buffer,
/// extension headers and protocols other than UDP/TCP.
pub fn parse_ipv6(
    parsed: &mut ParsedFrame,
    frame: &[u8],
    offset: usize,
    len: usize,
) -> Result<(), ParseError> {
    let len = len.min(frame.len().saturating_sub(offset));
    require("IPv6", IPV6_HEADER_SIZE, len)?;
    let header = &frame[offset..offset + IPV6_HEADER_SIZE];

    let word = read_u32(header, 0);
    let version = (word >> 28) as u8;
    if version != IPV6_VERSION {
        return Err(ParseError::InvalidIpVersion(version));
    }

    let payload_length = usize::from(read_u16(header, 4));
    if payload_length + IPV6_HEADER_SIZE > len {
        return Err(ParseError::LengthMismatch {
            layer: "IPv6",
            declared: payload_length + IPV6_HEADER_SIZE,
            available: len,
        });
    }

    parsed.packet_type = PacketType::Ipv6;
    parsed.ecn = ((word >> 20) & 0x03) as u8;

    let mut source = [0u8; 16];
    source.copy_from_slice(&header[8..24]);
    let mut destination = [0u8; 16];
    destination.copy_from_slice(&header[24..40]);
    parsed.route.remote_address = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(source)), 0);
    parsed.route.local_address = SocketAddr::new(IpAddr::V6(Ipv6Addr::from(destination)), 0);

    let l4_offset = offset + IPV6_HEADER_SIZE;
    match header[6] {
        IPPROTO_UDP => parse_udp(parsed, frame, l4_offset, payload_length),
        IPPROTO_TCP => parse_tcp(parsed, frame, l4_offset, payload_length),
        other => Err(ParseError::UnsupportedProtocol(other)),
    }
}

/// Parse a UDP header at `offset` with `len` bytes of IP payload.
///
/// # Errors
///
/// Rejects buffers shorter than the header and declared lengths that run
/// past the IP payload.
pub fn parse_udp(
    parsed: &mut ParsedFrame,
    frame: &[u8],
    offset: usize,
    len: usize,
) -> Result<(), ParseError> {
    let len = len.min(frame.len().saturating_sub(offset));
    require("UDP", UDP_HEADER_SIZE, len)?;
    let header = &frame[offset..offset + UDP_HEADER_SIZE];

    let declared = usize::from(read_u16(header, 4));
    if declared > len {
        return Err(ParseError::LengthMismatch {
            layer: "UDP",
            declared,
            available: len,
        });
    }

    parsed.packet_type = PacketType::Udp;
    parsed.route.remote_address.set_port(read_u16(header, 0));
    parsed.route.local_address.set_port(read_u16(header, 2));
    parsed.reserved_ex = 0;
    parsed.payload = offset + UDP_HEADER_SIZE..offset + len;
    Ok(())
}

/// Parse a TCP header at `offset` with `len` bytes of IP payload.
///
/// Only the segments the TCP disguise cares about are accepted: data with a
/// bare ACK, SYN, SYN+ACK and FIN.
///
/// # Errors
///
/// Truncated headers are malformed; any other flag combination returns
/// [`ParseError::IgnoredTcpFlags`], which callers treat as noise.
pub fn parse_tcp(
    parsed: &mut ParsedFrame,
    frame: &[u8],
    offset: usize,
    len: usize,
) -> Result<(), ParseError> {
    let len = len.min(frame.len().saturating_sub(offset));
    require("TCP", TCP_HEADER_SIZE, len)?;
    let header = &frame[offset..offset + TCP_HEADER_SIZE];

    let header_length = usize::from(header[12] >> 4) * 4;
    require("TCP options", header_length, len)?;
    require("TCP data offset", TCP_HEADER_SIZE, header_length)?;

    let flags = TcpFlags::from_bits(header[13]);
    let payload_len = len - header_length;
    let seq = read_u32(header, 4);
    let ack = read_u32(header, 8);

    let packet_type = if flags.bits() == TcpFlags::ACK && payload_len > 0 {
        parsed.route.tcp_state.sequence_number = seq;
        parsed.route.tcp_state.ack_number = ack;
        PacketType::Tcp
    } else if flags.contains(TcpFlags::SYN) {
        if flags.contains(TcpFlags::ACK) {
            PacketType::TcpSynAck
        } else {
            PacketType::TcpSyn
        }
    } else if flags.contains(TcpFlags::FIN) {
        PacketType::TcpFin
    } else {
        return Err(ParseError::IgnoredTcpFlags(flags.bits()));
    };

    parsed.packet_type = packet_type;
    parsed.route.remote_address.set_port(read_u16(header, 0));
    parsed.route.local_address.set_port(read_u16(header, 2));
    parsed.tcp_seq = seq;
    parsed.tcp_ack = ack;
    parsed.reserved_ex = header_length as u8;
    parsed.payload = offset + header_length..offset + len;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ethernet(ether_type: u16, body: &[u8]) -> Vec<u8> {
        let mut frame = vec![0x02, 0, 0, 0, 0, 0x01, 0x02, 0, 0, 0, 0, 0x02];
        frame.extend_from_slice(&ether_type.to_be_bytes());
        frame.extend_from_slice(body);
        frame
    }

    fn ipv4_udp(payload: &[u8]) -> Vec<u8> {
        let total = (IPV4_HEADER_SIZE + UDP_HEADER_SIZE + payload.len()) as u16;
        let mut ip = vec![0x45, 0x02];
        ip.extend_from_slice(&total.to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0, 0, 128, IPPROTO_UDP, 0, 0]);
        ip.extend_from_slice(&[10, 0, 0, 2, 10, 0, 0, 1]);
        ip.extend_from_slice(&50000u16.to_be_bytes());
        ip.extend_from_slice(&443u16.to_be_bytes());
        ip.extend_from_slice(&((UDP_HEADER_SIZE + payload.len()) as u16).to_be_bytes());
        ip.extend_from_slice(&[0, 0]);
        ip.extend_from_slice(payload);
        ip
    }

    fn ipv4_tcp(flags: u8, payload: &[u8]) -> Vec<u8> {
        let total = (IPV4_HEADER_SIZE + TCP_HEADER_SIZE + payload.len()) as u16;
        let mut ip = vec![0x45, 0x00];
        ip.extend_from_slice(&total.to_be_bytes());
        ip.extend_from_slice(&[0, 0, 0, 0, 128, IPPROTO_TCP, 0, 0]);
        ip.extend_from_slice(&[10, 0, 0, 2, 10, 0, 0, 1]);
        ip.extend_from_slice(&50000u16.to_be_bytes());
        ip.extend_from_slice(&443u16.to_be_bytes());
        ip.extend_from_slice(&1000u32.to_be_bytes());
        ip.extend_from_slice(&2000u32.to_be_bytes());
        ip.extend_from_slice(&[0x50, flags, 0xFF, 0xFF, 0, 0, 0, 0]);
        ip.extend_from_slice(payload);
        ip
    }

    #[test]
    fn test_parse_udp_ipv4() {
        let frame = ethernet(ETHERTYPE_IPV4, &ipv4_udp(b"hello"));
        let parsed = parse_ethernet(&frame).unwrap();

        assert_eq!(parsed.packet_type, PacketType::Udp);
        assert_eq!(parsed.ecn, 0x02);
        assert_eq!(parsed.route.local_address, "10.0.0.1:443".parse().unwrap());
        assert_eq!(parsed.route.remote_address, "10.0.0.2:50000".parse().unwrap());
        assert_eq!(&frame[parsed.payload.clone()], b"hello");
        assert_eq!(
            parsed.route.local_link_layer_address,
            MacAddress([0x02, 0, 0, 0, 0, 0x01])
        );
        assert_eq!(
            parsed.route.next_hop_link_layer_address,
            MacAddress([0x02, 0, 0, 0, 0, 0x02])
        );
    }

    #[test]
    fn test_reject_broadcast_and_multicast() {
        let mut frame = ethernet(ETHERTYPE_IPV4, &ipv4_udp(b"x"));
        frame[0..6].copy_from_slice(&[0xFF; 6]);
        assert!(matches!(parse_ethernet(&frame), Err(ParseError::NotUnicast(_))));

        frame[0..6].copy_from_slice(&[0x01, 0x00, 0x5e, 0, 0, 1]);
        assert!(matches!(parse_ethernet(&frame), Err(ParseError::NotUnicast(_))));
    }

    #[test]
    fn test_reject_unknown_ethertype() {
        let frame = ethernet(0x0806, &[0u8; 28]);
        assert_eq!(
            parse_ethernet(&frame).unwrap_err(),
            ParseError::UnsupportedEtherType(0x0806)
        );
    }

    #[test]
    fn test_ipv4_options_rejected() {
        let mut ip = ipv4_udp(b"payload");
        ip[0] = 0x46;
        // Extra padding so the buffer could hold an options word.
        ip.extend_from_slice(&[0u8; 64]);
        let mut parsed = ParsedFrame::default();
        assert_eq!(
            parse_ipv4(&mut parsed, &ip, 0, ip.len()),
            Err(ParseError::InvalidIpv4Header(0x46))
        );
    }

    #[test]
    fn test_ipv4_total_length_exceeds_buffer() {
        let mut ip = ipv4_udp(b"payload");
        ip[2..4].copy_from_slice(&1000u16.to_be_bytes());
        let mut parsed = ParsedFrame::default();
        assert!(matches!(
            parse_ipv4(&mut parsed, &ip, 0, ip.len()),
            Err(ParseError::LengthMismatch { layer: "IPv4", .. })
        ));
    }

    #[test]
    fn test_ipv4_trailing_padding_ignored() {
        let mut body = ipv4_udp(b"abc");
        body.extend_from_slice(&[0u8; 20]);
        let frame = ethernet(ETHERTYPE_IPV4, &body);
        let parsed = parse_ethernet(&frame).unwrap();
        assert_eq!(&frame[parsed.payload.clone()], b"abc");
    }

    #[test]
    fn test_udp_length_exceeds_payload() {
        let mut ip = ipv4_udp(b"abcd");
        ip[24..26].copy_from_slice(&100u16.to_be_bytes());
        let frame = ethernet(ETHERTYPE_IPV4, &ip);
        assert!(matches!(
            parse_ethernet(&frame),
            Err(ParseError::LengthMismatch { layer: "UDP", .. })
        ));
    }

    #[test]
    fn test_unsupported_protocol() {
        let mut ip = ipv4_udp(b"abcd");
        ip[9] = 1;
        let frame = ethernet(ETHERTYPE_IPV4, &ip);
        assert_eq!(
            parse_ethernet(&frame).unwrap_err(),
            ParseError::UnsupportedProtocol(1)
        );
    }

    #[test]
    fn test_tcp_classification() {
        let ack_data = ethernet(ETHERTYPE_IPV4, &ipv4_tcp(TcpFlags::ACK, b"data"));
        let parsed = parse_ethernet(&ack_data).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Tcp);
        assert_eq!(parsed.route.tcp_state.sequence_number, 1000);
        assert_eq!(parsed.route.tcp_state.ack_number, 2000);
        assert_eq!(parsed.reserved_ex, 20);
        assert_eq!(&ack_data[parsed.payload.clone()], b"data");

        let syn = ethernet(ETHERTYPE_IPV4, &ipv4_tcp(TcpFlags::SYN, b""));
        assert_eq!(parse_ethernet(&syn).unwrap().packet_type, PacketType::TcpSyn);

        let syn_ack = ethernet(
            ETHERTYPE_IPV4,
            &ipv4_tcp(TcpFlags::SYN | TcpFlags::ACK, b""),
        );
        let parsed = parse_ethernet(&syn_ack).unwrap();
        assert_eq!(parsed.packet_type, PacketType::TcpSynAck);
        assert_eq!(parsed.tcp_seq, 1000);
        assert_eq!(parsed.route.tcp_state.sequence_number, 0);

        let fin = ethernet(ETHERTYPE_IPV4, &ipv4_tcp(TcpFlags::FIN | TcpFlags::ACK, b""));
        assert_eq!(parse_ethernet(&fin).unwrap().packet_type, PacketType::TcpFin);
    }

    #[test]
    fn test_tcp_noise_dropped() {
        let bare_ack = ethernet(ETHERTYPE_IPV4, &ipv4_tcp(TcpFlags::ACK, b""));
        let err = parse_ethernet(&bare_ack).unwrap_err();
        assert!(err.is_noise());

        let rst = ethernet(ETHERTYPE_IPV4, &ipv4_tcp(TcpFlags::RST, b""));
        assert!(parse_ethernet(&rst).unwrap_err().is_noise());

        let psh_ack = ethernet(
            ETHERTYPE_IPV4,
            &ipv4_tcp(TcpFlags::PSH | TcpFlags::ACK, b"data"),
        );
        assert!(parse_ethernet(&psh_ack).unwrap_err().is_noise());
    }

    #[test]
    fn test_tcp_data_offset_beyond_segment() {
        let mut ip = ipv4_tcp(TcpFlags::ACK, b"");
        ip[IPV4_HEADER_SIZE + 12] = 0xF0;
        let frame = ethernet(ETHERTYPE_IPV4, &ip);
        assert!(matches!(
            parse_ethernet(&frame),
            Err(ParseError::TooShort { layer: "TCP options", .. })
        ));
    }

    #[test]
    fn test_tcp_data_offset_below_minimum() {
        let mut ip = ipv4_tcp(TcpFlags::ACK, b"data");
        ip[IPV4_HEADER_SIZE + 12] = 0x10;
        let frame = ethernet(ETHERTYPE_IPV4, &ip);
        assert!(matches!(
            parse_ethernet(&frame),
            Err(ParseError::TooShort { layer: "TCP data offset", .. })
        ));
    }

    #[test]
    fn test_parse_ipv6_udp_ecn() {
        let payload = b"v6";
        let mut ip = Vec::new();
        // version 6, ECN 0b11 in bits 20..22
        ip.extend_from_slice(&((6u32 << 28) | (3 << 20)).to_be_bytes());
        ip.extend_from_slice(&((UDP_HEADER_SIZE + payload.len()) as u16).to_be_bytes());
        ip.push(IPPROTO_UDP);
        ip.push(128);
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "fd00::1".parse().unwrap();
        ip.extend_from_slice(&src.octets());
        ip.extend_from_slice(&dst.octets());
        ip.extend_from_slice(&9000u16.to_be_bytes());
        ip.extend_from_slice(&4433u16.to_be_bytes());
        ip.extend_from_slice(&((UDP_HEADER_SIZE + payload.len()) as u16).to_be_bytes());
        ip.extend_from_slice(&[0, 0]);
        ip.extend_from_slice(payload);

        let frame = ethernet(ETHERTYPE_IPV6, &ip);
        let parsed = parse_ethernet(&frame).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Udp);
        assert_eq!(parsed.ecn, 3);
        assert_eq!(parsed.route.local_address, "[fd00::1]:4433".parse().unwrap());
        assert_eq!(parsed.route.remote_address, "[fd00::2]:9000".parse().unwrap());
        assert_eq!(&frame[parsed.payload.clone()], payload);
    }

    #[test]
    fn test_every_truncation_rejected() {
        let frame = ethernet(ETHERTYPE_IPV4, &ipv4_udp(b""));
        for len in 0..frame.len() {
            assert!(parse_ethernet(&frame[..len]).is_err(), "prefix {len}");
        }
        assert!(parse_ethernet(&frame).is_ok());
    }
}
