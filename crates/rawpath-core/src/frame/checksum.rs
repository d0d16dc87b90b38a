//! Internet checksum (RFC 1071).
//!
//! Sums are accumulated over big-endian 16-bit words in a `u64` so carries
//! can be folded once at the end. An odd trailing byte is padded with zero.

use std::net::IpAddr;

/// Add `data` to a running ones'-complement sum.
///
/// Ranges may be fed in pieces as long as every piece except the last has
/// an even length.
pub fn checksum_accumulate(initial: u64, data: &[u8]) -> u64 {
    let mut sum = initial;
    let mut words = data.chunks_exact(4);
    for word in &mut words {
        sum += u64::from(u32::from_be_bytes([word[0], word[1], word[2], word[3]]));
    }
    let rest = words.remainder();
    let mut pairs = rest.chunks_exact(2);
    for pair in &mut pairs {
        sum += u64::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = pairs.remainder() {
        sum += u64::from(*last) << 8;
    }
    sum
}

/// Fold carries into 16 bits without complementing.
pub fn checksum_fold(mut sum: u64) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    sum as u16
}

/// Complemented Internet checksum of `data`.
pub fn checksum(data: &[u8]) -> u16 {
    !checksum_fold(checksum_accumulate(0, data))
}

/// TCP/UDP checksum over the IP pseudo-header and `segment`.
///
/// `segment` is the transport header (checksum field zeroed) followed by the
/// payload. Both addresses must belong to the same family.
pub fn transport_checksum(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            checksum_accumulate(checksum_accumulate(0, &s.octets()), &d.octets())
        }
        (s, d) => {
            let s = match s {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            let d = match d {
                IpAddr::V4(v4) => v4.to_ipv6_mapped(),
                IpAddr::V6(v6) => v6,
            };
            checksum_accumulate(checksum_accumulate(0, &s.octets()), &d.octets())
        }
    };
    sum += u64::from(protocol);
    sum += segment.len() as u64;
    !checksum_fold(checksum_accumulate(sum, segment))
}
