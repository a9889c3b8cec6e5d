//! IP packet address extraction
//!
//! Reads the version nibble and fixed header offsets of a raw IP packet.
//! No checksum validation or option parsing happens here; the result is only
//! used as a peer cache key.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;

/// Extract the source address of a raw IP packet
pub fn source_addr(packet: &[u8]) -> Option<IpAddr> {
    match ip_version(packet)? {
        4 if packet.len() >= IPV4_HEADER_LEN => Some(IpAddr::V4(ipv4_at(packet, 12))),
        6 if packet.len() >= IPV6_HEADER_LEN => Some(IpAddr::V6(ipv6_at(packet, 8))),
        _ => None,
    }
}

/// Extract the destination address of a raw IP packet
pub fn destination_addr(packet: &[u8]) -> Option<IpAddr> {
    match ip_version(packet)? {
        4 if packet.len() >= IPV4_HEADER_LEN => Some(IpAddr::V4(ipv4_at(packet, 16))),
        6 if packet.len() >= IPV6_HEADER_LEN => Some(IpAddr::V6(ipv6_at(packet, 24))),
        _ => None,
    }
}

/// Peer cache key for the packet's source address.
///
/// `None` means the packet cannot be attributed to a peer and must be dropped
/// without reporting an error.
pub fn source_key(packet: &[u8]) -> Option<String> {
    source_addr(packet).map(|addr| addr_key(&addr))
}

/// Peer cache key for the packet's destination address
pub fn destination_key(packet: &[u8]) -> Option<String> {
    destination_addr(packet).map(|addr| addr_key(&addr))
}

/// Canonical cache key text for an address.
///
/// Handshake registration and packet extraction both go through here so the
/// two sides always agree on formatting.
pub fn addr_key(addr: &IpAddr) -> String {
    addr.to_string()
}

fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

fn ipv4_at(packet: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        packet[offset],
        packet[offset + 1],
        packet[offset + 2],
        packet[offset + 3],
    )
}

fn ipv6_at(packet: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&packet[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal IPv4 header with the given addresses and payload
    pub(crate) fn ipv4_packet(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; IPV4_HEADER_LEN];
        packet[0] = 0x45;
        let total = (IPV4_HEADER_LEN + payload.len()) as u16;
        packet[2..4].copy_from_slice(&total.to_be_bytes());
        packet[8] = 64;
        packet[9] = 17;
        packet[12..16].copy_from_slice(&src);
        packet[16..20].copy_from_slice(&dst);
        packet.extend_from_slice(payload);
        packet
    }

    /// Minimal IPv6 header with the given addresses and payload
    pub(crate) fn ipv6_packet(src: Ipv6Addr, dst: Ipv6Addr, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; IPV6_HEADER_LEN];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        packet[6] = 17;
        packet[7] = 64;
        packet[8..24].copy_from_slice(&src.octets());
        packet[24..40].copy_from_slice(&dst.octets());
        packet.extend_from_slice(payload);
        packet
    }

    #[test]
    fn test_ipv4_keys() {
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 5], b"hello");
        assert_eq!(destination_key(&packet).as_deref(), Some("10.0.0.5"));
        assert_eq!(source_key(&packet).as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_short_ipv4_packet_has_no_key() {
        let packet = ipv4_packet([10, 0, 0, 2], [10, 0, 0, 5], b"");
        assert_eq!(destination_key(&packet[..19]), None);
        assert_eq!(source_key(&packet[..19]), None);
    }

    #[test]
    fn test_ipv6_keys_are_canonical() {
        let src: Ipv6Addr = "fd00::2".parse().unwrap();
        let dst: Ipv6Addr = "2001:db8:0:0:0:0:0:1".parse().unwrap();
        let packet = ipv6_packet(src, dst, &[1, 2, 3]);

        assert_eq!(source_key(&packet).as_deref(), Some("fd00::2"));
        assert_eq!(destination_key(&packet).as_deref(), Some("2001:db8::1"));
        assert_eq!(destination_key(&packet[..39]), None);
    }

    #[test]
    fn test_capture_from_wire() {
        // IPv6 TCP segment captured behind an ethernet-less tun
        let raw = hex::decode(
            "6001e9ed00200640240e037926cb4a000000000000000635200148380000001b00000000000002\
             0199aa0050bceb72fdd9aaa1568010008a090300000101080af3184d09ecce598b",
        )
        .unwrap();
        assert_eq!(source_key(&raw).as_deref(), Some("240e:379:26cb:4a00::635"));
        assert_eq!(destination_key(&raw).as_deref(), Some("2001:4838:0:1b::201"));
    }

    #[test]
    fn test_unknown_version_and_empty() {
        assert_eq!(destination_key(&[]), None);
        let mut packet = ipv4_packet([1, 1, 1, 1], [2, 2, 2, 2], b"");
        packet[0] = 0x55;
        assert_eq!(destination_key(&packet), None);
        assert_eq!(source_key(&packet), None);
    }

    #[test]
    fn test_handshake_and_packet_keys_agree() {
        let addr: IpAddr = "10.0.0.2".parse().unwrap();
        let packet = ipv4_packet([192, 168, 1, 1], [10, 0, 0, 2], b"");
        assert_eq!(destination_key(&packet), Some(addr_key(&addr)));
    }
}
