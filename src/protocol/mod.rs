//! Wire protocol: length-prefixed framing and the application handshake.
//!
//! After TLS is established, a single HTTP/1.0-shaped request/response pair
//! carries JSON client info and settings (see [`handshake`]). The stream then
//! switches to length-prefixed binary frames in both directions: a `u32`
//! big-endian payload length followed by that many bytes of IPv4 packet
//! (see [`codec`]).

pub mod codec;
pub mod handshake;

pub use codec::{read_frame, write_frame};
pub use handshake::{ClientInfo, ClientSettings};

use std::net::Ipv4Addr;

/// Minimum length of a parseable IPv4 header.
pub const IPV4_HEADER_LEN: usize = 20;

/// Whether the packet's version nibble says IPv4.
pub fn is_ipv4(packet: &[u8]) -> bool {
    !packet.is_empty() && packet[0] >> 4 == 4
}

/// Source address field of an IPv4 packet (bytes 12..16).
pub fn ipv4_source(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN || !is_ipv4(packet) {
        return None;
    }
    let octets: [u8; 4] = packet[12..16].try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

/// Destination address field of an IPv4 packet (bytes 16..20).
pub fn ipv4_destination(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < IPV4_HEADER_LEN || !is_ipv4(packet) {
        return None;
    }
    let octets: [u8; 4] = packet[16..20].try_into().ok()?;
    Some(Ipv4Addr::from(octets))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut p = vec![0u8; IPV4_HEADER_LEN];
        p[0] = 0x45;
        p[12..16].copy_from_slice(&src);
        p[16..20].copy_from_slice(&dst);
        p
    }

    #[test]
    fn parses_addresses() {
        let p = packet([192, 168, 0, 2], [192, 168, 0, 3]);
        assert_eq!(ipv4_source(&p), Some(Ipv4Addr::new(192, 168, 0, 2)));
        assert_eq!(ipv4_destination(&p), Some(Ipv4Addr::new(192, 168, 0, 3)));
    }

    #[test]
    fn rejects_non_v4_and_runts() {
        let mut p = packet([10, 0, 0, 1], [10, 0, 0, 2]);
        p[0] = 0x60; // IPv6 version nibble
        assert_eq!(ipv4_source(&p), None);

        assert_eq!(ipv4_destination(&[0x45, 0, 0]), None);
    }
}
