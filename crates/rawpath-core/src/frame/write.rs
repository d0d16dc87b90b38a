//! Transmit-side header construction.
//!
//! Headers are written right-to-left into the backfill that precedes the
//! payload: transport first, then IP, then Ethernet. Nothing is moved; the
//! caller reserves [`calculate_header_backfill`] bytes up front.

use super::{
    ETHERNET_HEADER_SIZE, ETHERTYPE_IPV4, ETHERTYPE_IPV6, IP_DEFAULT_HOP_LIMIT, IPPROTO_TCP,
    IPPROTO_UDP, IPV4_HEADER_SIZE, IPV4_VERSION_AND_HEADER_LENGTH, IPV6_HEADER_SIZE, IPV6_VERSION,
    TCP_DEFAULT_WINDOW, TCP_HEADER_SIZE, TcpFlags, UDP_HEADER_SIZE, WriteError, checksum,
    transport_checksum,
};
use crate::route::Route;
use std::net::IpAddr;

/// Per-packet parameters for [`write_headers`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaderOptions {
    /// Frame as TCP instead of UDP
    pub use_tcp: bool,
    /// ECN codepoint (2 bits)
    pub ecn: u8,
    /// DSCP value (6 bits)
    pub dscp: u8,
    /// IPv6 flow label (20 bits)
    pub flow_label: u32,
    /// Leave the IPv4 header checksum to hardware
    pub skip_l3_checksum: bool,
    /// Leave the TCP/UDP checksum to hardware
    pub skip_l4_checksum: bool,
    /// TCP sequence number
    pub seq: u32,
    /// TCP acknowledgment number
    pub ack: u32,
    /// TCP flags
    pub flags: TcpFlags,
}

/// Bytes of header that precede the payload for a family/transport pair.
pub fn calculate_header_backfill(is_ipv6: bool, is_tcp: bool) -> usize {
    let network = if is_ipv6 {
        IPV6_HEADER_SIZE
    } else {
        IPV4_HEADER_SIZE
    };
    let transport = if is_tcp {
        TCP_HEADER_SIZE
    } else {
        UDP_HEADER_SIZE
    };
    ETHERNET_HEADER_SIZE + network + transport
}

/// Write Ethernet, IP and UDP/TCP headers in front of `payload_len` bytes
/// starting at `payload_start`.
///
/// Returns the offset at which the finished frame begins.
///
/// # Errors
///
/// Fails when the backfill is too small, the payload window lies outside
/// `buf`, or local and remote addresses disagree on family.
pub fn write_headers(
    route: &Route,
    buf: &mut [u8],
    payload_start: usize,
    payload_len: usize,
    options: &HeaderOptions,
) -> Result<usize, WriteError> {
    let payload_end = payload_start + payload_len;
    if payload_end > buf.len() {
        return Err(WriteError::PayloadOutOfBounds {
            start: payload_start,
            end: payload_end,
            len: buf.len(),
        });
    }

    let local = route.local_address.ip().to_canonical();
    let remote = route.remote_address.ip().to_canonical();
    let is_ipv6 = match (local, remote) {
        (IpAddr::V4(_), IpAddr::V4(_)) => false,
        (IpAddr::V6(_), IpAddr::V6(_)) => true,
        _ => return Err(WriteError::FamilyMismatch),
    };

    let needed = calculate_header_backfill(is_ipv6, options.use_tcp);
    if needed > payload_start {
        return Err(WriteError::InsufficientBackfill {
            needed,
            available: payload_start,
        });
    }

    let (transport_len, protocol) = if options.use_tcp {
        (TCP_HEADER_SIZE, IPPROTO_TCP)
    } else {
        (UDP_HEADER_SIZE, IPPROTO_UDP)
    };
    let segment_len = transport_len + payload_len;
    let ip_header_len = if is_ipv6 {
        IPV6_HEADER_SIZE
    } else {
        IPV4_HEADER_SIZE
    };
    if segment_len + ip_header_len > usize::from(u16::MAX) {
        return Err(WriteError::PayloadTooLarge(payload_len));
    }

    // Transport header.
    let transport_start = payload_start - transport_len;
    {
        let header = &mut buf[transport_start..payload_start];
        header[0..2].copy_from_slice(&route.local_address.port().to_be_bytes());
        header[2..4].copy_from_slice(&route.remote_address.port().to_be_bytes());
        if options.use_tcp {
            header[4..8].copy_from_slice(&options.seq.to_be_bytes());
            header[8..12].copy_from_slice(&options.ack.to_be_bytes());
            header[12] = ((TCP_HEADER_SIZE / 4) as u8) << 4;
            header[13] = options.flags.bits();
            header[14..16].copy_from_slice(&TCP_DEFAULT_WINDOW.to_be_bytes());
            header[16..18].copy_from_slice(&[0, 0]);
            header[18..20].copy_from_slice(&[0, 0]);
        } else {
            header[4..6].copy_from_slice(&(segment_len as u16).to_be_bytes());
            header[6..8].copy_from_slice(&[0, 0]);
        }
    }

    if !options.skip_l4_checksum {
        let sum = transport_checksum(local, remote, protocol, &buf[transport_start..payload_end]);
        let field = if options.use_tcp { 16 } else { 6 };
        // A computed zero is sent as all ones for UDP; zero means "no checksum".
        let sum = if !options.use_tcp && sum == 0 { 0xFFFF } else { sum };
        buf[transport_start + field..transport_start + field + 2]
            .copy_from_slice(&sum.to_be_bytes());
    }

    // Network header.
    let ip_start = transport_start - ip_header_len;
    let ether_type = match (local, remote) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            let header = &mut buf[ip_start..transport_start];
            header[0] = IPV4_VERSION_AND_HEADER_LENGTH;
            header[1] = (options.dscp << 2) | (options.ecn & 0x03);
            header[2..4].copy_from_slice(&((IPV4_HEADER_SIZE + segment_len) as u16).to_be_bytes());
            header[4..8].copy_from_slice(&[0, 0, 0, 0]);
            header[8] = IP_DEFAULT_HOP_LIMIT;
            header[9] = protocol;
            header[10..12].copy_from_slice(&[0, 0]);
            header[12..16].copy_from_slice(&src.octets());
            header[16..20].copy_from_slice(&dst.octets());
            if !options.skip_l3_checksum {
                let sum = checksum(header);
                header[10..12].copy_from_slice(&sum.to_be_bytes());
            }
            ETHERTYPE_IPV4
        }
        (IpAddr::V6(src), IpAddr::V6(dst)) => {
            let header = &mut buf[ip_start..transport_start];
            let word = (u32::from(IPV6_VERSION) << 28)
                | (u32::from(options.dscp & 0x3F) << 22)
                | (u32::from(options.ecn & 0x03) << 20)
                | (options.flow_label & 0x000F_FFFF);
            header[0..4].copy_from_slice(&word.to_be_bytes());
            header[4..6].copy_from_slice(&(segment_len as u16).to_be_bytes());
            header[6] = protocol;
            header[7] = IP_DEFAULT_HOP_LIMIT;
            header[8..24].copy_from_slice(&src.octets());
            header[24..40].copy_from_slice(&dst.octets());
            ETHERTYPE_IPV6
        }
        _ => return Err(WriteError::FamilyMismatch),
    };

    // Link header.
    let frame_start = ip_start - ETHERNET_HEADER_SIZE;
    let header = &mut buf[frame_start..ip_start];
    header[0..6].copy_from_slice(&route.next_hop_link_layer_address.0);
    header[6..12].copy_from_slice(&route.local_link_layer_address.0);
    header[12..14].copy_from_slice(&ether_type.to_be_bytes());

    Ok(frame_start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{MacAddress, PacketType, checksum_accumulate, checksum_fold, parse_ethernet};
    use proptest::prelude::*;
    use std::net::SocketAddr;

    fn route(local: &str, remote: &str) -> Route {
        let mut route = Route::new(local.parse().unwrap(), remote.parse().unwrap());
        route.local_link_layer_address = MacAddress([0x02, 0, 0, 0, 0, 0x01]);
        route.next_hop_link_layer_address = MacAddress([0x02, 0, 0, 0, 0, 0x02]);
        route
    }

    /// Turn the route around as the receiver would see it.
    fn reversed(route: &Route) -> Route {
        let mut peer = route.clone();
        peer.local_address = route.remote_address;
        peer.remote_address = route.local_address;
        peer.local_link_layer_address = route.next_hop_link_layer_address;
        peer.next_hop_link_layer_address = route.local_link_layer_address;
        peer
    }

    fn frame_with(route: &Route, payload: &[u8], options: &HeaderOptions) -> Vec<u8> {
        let backfill = calculate_header_backfill(route.remote_address.is_ipv6(), options.use_tcp);
        let mut buf = vec![0u8; backfill + payload.len()];
        buf[backfill..].copy_from_slice(payload);
        let start = write_headers(route, &mut buf, backfill, payload.len(), options).unwrap();
        assert_eq!(start, 0);
        buf
    }

    #[test]
    fn test_backfill_sizes() {
        assert_eq!(calculate_header_backfill(false, false), 42);
        assert_eq!(calculate_header_backfill(false, true), 54);
        assert_eq!(calculate_header_backfill(true, false), 62);
        assert_eq!(calculate_header_backfill(true, true), 74);
    }

    #[test]
    fn test_udp_ipv4_round_trip() {
        let route = route("10.0.0.1:443", "10.0.0.2:50000");
        let frame = frame_with(&route, b"quic", &HeaderOptions::default());

        // The peer (10.0.0.2) receives it.
        let parsed = parse_ethernet(&frame).unwrap();
        let peer = reversed(&route);
        assert_eq!(parsed.packet_type, PacketType::Udp);
        assert_eq!(parsed.route.local_address, peer.local_address);
        assert_eq!(parsed.route.remote_address, peer.remote_address);
        assert_eq!(&frame[parsed.payload.clone()], b"quic");

        // IPv4 header and UDP checksum verify.
        assert_eq!(checksum(&frame[14..34]), 0);
        let sum = transport_checksum(
            route.local_address.ip(),
            route.remote_address.ip(),
            IPPROTO_UDP,
            &frame[34..],
        );
        assert_eq!(sum, 0);
    }

    #[test]
    fn test_tcp_ipv6_fields() {
        let route = route("[fd00::1]:443", "[fd00::2]:50000");
        let options = HeaderOptions {
            use_tcp: true,
            ecn: 1,
            flow_label: 0xABCDE,
            seq: 7,
            ack: 9,
            flags: TcpFlags::from_bits(TcpFlags::ACK),
            ..Default::default()
        };
        let frame = frame_with(&route, b"segment", &options);

        let parsed = parse_ethernet(&frame).unwrap();
        assert_eq!(parsed.packet_type, PacketType::Tcp);
        assert_eq!(parsed.ecn, 1);
        assert_eq!(parsed.tcp_seq, 7);
        assert_eq!(parsed.tcp_ack, 9);
        assert_eq!(&frame[14..18], &(0x601A_BCDEu32).to_be_bytes());
        assert_eq!(u16::from_be_bytes([frame[54 + 14], frame[54 + 15]]), 0xFFFF);

        let segment = &frame[54..];
        assert_eq!(
            transport_checksum(
                route.local_address.ip(),
                route.remote_address.ip(),
                IPPROTO_TCP,
                segment
            ),
            0
        );
    }

    #[test]
    fn test_skipped_checksums_left_zero() {
        let route = route("10.0.0.1:443", "10.0.0.2:50000");
        let options = HeaderOptions {
            skip_l3_checksum: true,
            skip_l4_checksum: true,
            ..Default::default()
        };
        let frame = frame_with(&route, b"offload", &options);
        assert_eq!(&frame[24..26], &[0, 0]);
        assert_eq!(&frame[40..42], &[0, 0]);
        assert_ne!(checksum_fold(checksum_accumulate(0, &frame[14..34])), 0xFFFF);
    }

    #[test]
    fn test_insufficient_backfill() {
        let route = route("10.0.0.1:443", "10.0.0.2:50000");
        let mut buf = vec![0u8; 64];
        let err = write_headers(&route, &mut buf, 20, 4, &HeaderOptions::default()).unwrap_err();
        assert_eq!(
            err,
            WriteError::InsufficientBackfill {
                needed: 42,
                available: 20
            }
        );
    }

    #[test]
    fn test_family_mismatch() {
        let route = route("10.0.0.1:443", "[fd00::2]:50000");
        let mut buf = vec![0u8; 128];
        assert_eq!(
            write_headers(&route, &mut buf, 80, 4, &HeaderOptions::default()),
            Err(WriteError::FamilyMismatch)
        );
    }

    #[test]
    fn test_mapped_local_address_frames_as_ipv4() {
        let route = route("[::ffff:10.0.0.1]:443", "10.0.0.2:50000");
        let frame = frame_with(&route, b"x", &HeaderOptions::default());
        assert_eq!(u16::from_be_bytes([frame[12], frame[13]]), ETHERTYPE_IPV4);
    }

    fn address_pair() -> impl Strategy<Value = (SocketAddr, SocketAddr)> {
        let v4 = (any::<[u8; 4]>(), any::<[u8; 4]>())
            .prop_map(|(a, b)| (IpAddr::from(a), IpAddr::from(b)));
        let v6 = (any::<[u8; 16]>(), any::<[u8; 16]>())
            .prop_map(|(a, b)| (IpAddr::from(a), IpAddr::from(b)));
        (prop_oneof![v4, v6], 1..=u16::MAX, 1..=u16::MAX).prop_map(|((a, b), pa, pb)| {
            (SocketAddr::new(a, pa), SocketAddr::new(b, pb))
        })
    }

    proptest! {
        #[test]
        fn prop_written_headers_parse_back(
            (local, remote) in address_pair(),
            use_tcp in any::<bool>(),
            ecn in 0u8..4,
            skip_l3_checksum in any::<bool>(),
            skip_l4_checksum in any::<bool>(),
            payload in proptest::collection::vec(any::<u8>(), 1..512),
        ) {
            prop_assume!(local.ip().to_canonical().is_ipv6() == local.is_ipv6());
            prop_assume!(remote.ip().to_canonical().is_ipv6() == remote.is_ipv6());

            let route = route(&local.to_string(), &remote.to_string());
            let options = HeaderOptions {
                use_tcp,
                ecn,
                skip_l3_checksum,
                skip_l4_checksum,
                flags: TcpFlags::from_bits(TcpFlags::ACK),
                ..Default::default()
            };
            let frame = frame_with(&route, &payload, &options);

            let parsed = parse_ethernet(&frame).unwrap();
            let expected_type = if use_tcp { PacketType::Tcp } else { PacketType::Udp };
            prop_assert_eq!(parsed.packet_type, expected_type);
            prop_assert_eq!(parsed.route.local_address, remote);
            prop_assert_eq!(parsed.route.remote_address, local);
            prop_assert_eq!(parsed.ecn, ecn);
            prop_assert_eq!(&frame[parsed.payload.clone()], &payload[..]);

            let l4_start = if local.is_ipv6() {
                14 + 40
            } else {
                if !skip_l3_checksum {
                    prop_assert_eq!(checksum(&frame[14..34]), 0);
                }
                14 + 20
            };
            if !skip_l4_checksum {
                let protocol = if use_tcp { IPPROTO_TCP } else { IPPROTO_UDP };
                prop_assert_eq!(
                    transport_checksum(local.ip(), remote.ip(), protocol, &frame[l4_start..]),
                    0
                );
            }
        }
    }

    #[test]
    fn test_payload_window_out_of_bounds() {
        let route = route("10.0.0.1:443", "10.0.0.2:50000");
        let mut buf = vec![0u8; 50];
        assert!(matches!(
            write_headers(&route, &mut buf, 42, 20, &HeaderOptions::default()),
            Err(WriteError::PayloadOutOfBounds { .. })
        ));
    }
}
