//! L3 classification and L4 port extraction.

use network_types::{
    ip::{Ipv4Hdr, Ipv6Hdr},
    tcp::TcpHdr,
    udp::UdpHdr,
};

use crate::{
    event::{AF_INET, AF_INET6, IPPROTO_TCP, IPPROTO_UDP},
    packet::{OutOfBounds, PacketReader},
};

/// Source and destination port fields, the first four bytes of both TCP and
/// UDP headers. The classifier requires at least this much past the L3 header.
pub const PORTS_LEN: usize = 4;

// Field offsets inside the fixed IPv4 header.
const IPV4_PROTO: usize = 9;
const IPV4_SADDR: usize = 12;
const IPV4_DADDR: usize = 16;
const IPV4_MAX_HDR_LEN: usize = 60;

// Field offsets inside the fixed IPv6 header.
const IPV6_NEXTHDR: usize = 6;
const IPV6_SADDR: usize = 8;
const IPV6_DADDR: usize = 24;

/// What the network layer told us about a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NetworkHeader {
    Ipv4 {
        protocol: u8,
        saddr: u32,
        daddr: u32,
        /// Offset of the transport header, `ihl * 4`.
        transport: usize,
    },
    Ipv6 {
        protocol: u8,
        saddr: [u8; 16],
        daddr: [u8; 16],
        transport: usize,
    },
    /// Family we do not parse; the event is still emitted with zeroed
    /// protocol, addresses and ports.
    Other,
}

impl NetworkHeader {
    #[inline(always)]
    pub fn protocol(&self) -> u8 {
        match *self {
            NetworkHeader::Ipv4 { protocol, .. } | NetworkHeader::Ipv6 { protocol, .. } => protocol,
            NetworkHeader::Other => 0,
        }
    }
}

/// Locate the protocol id, addresses and transport offset for `family`.
///
/// Fails when the fixed L3 header does not fit, when the IPv4 header length
/// field is outside 20..=60 bytes, or when fewer than [`PORTS_LEN`] bytes
/// follow the L3 header. Any of these means the packet produces no event.
#[inline(always)]
pub fn classify(reader: &PacketReader<'_>, family: u32) -> Result<NetworkHeader, OutOfBounds> {
    match family {
        AF_INET => {
            reader.check(0, Ipv4Hdr::LEN)?;
            let ihl = (reader.u8_at(0)? & 0x0f) as usize * 4;
            if ihl < Ipv4Hdr::LEN || ihl > IPV4_MAX_HDR_LEN {
                return Err(OutOfBounds);
            }
            let protocol = reader.u8_at(IPV4_PROTO)?;
            let saddr = reader.raw32_at(IPV4_SADDR)?;
            let daddr = reader.raw32_at(IPV4_DADDR)?;
            reader.check(ihl, PORTS_LEN)?;
            Ok(NetworkHeader::Ipv4 {
                protocol,
                saddr,
                daddr,
                transport: ihl,
            })
        }
        AF_INET6 => {
            reader.check(0, Ipv6Hdr::LEN)?;
            let protocol = reader.u8_at(IPV6_NEXTHDR)?;
            let saddr = reader.bytes_at::<16>(IPV6_SADDR)?;
            let daddr = reader.bytes_at::<16>(IPV6_DADDR)?;
            reader.check(Ipv6Hdr::LEN, PORTS_LEN)?;
            Ok(NetworkHeader::Ipv6 {
                protocol,
                saddr,
                daddr,
                transport: Ipv6Hdr::LEN,
            })
        }
        _ => Ok(NetworkHeader::Other),
    }
}

/// Transport ports in host byte order.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Ports {
    pub source: u16,
    pub dest: u16,
}

/// Read TCP/UDP ports at `offset`.
///
/// Never fails: other protocols, or a transport header shorter than the
/// protocol's full fixed header (20 bytes TCP, 8 bytes UDP), give `0 / 0`.
#[inline(always)]
pub fn transport_ports(reader: &PacketReader<'_>, protocol: u8, offset: usize) -> Ports {
    let header_len = match protocol {
        IPPROTO_TCP => TcpHdr::LEN,
        IPPROTO_UDP => UdpHdr::LEN,
        _ => return Ports::default(),
    };
    if reader.check(offset, header_len).is_err() {
        return Ports::default();
    }
    match (reader.be16_at(offset), reader.be16_at(offset + 2)) {
        (Ok(source), Ok(dest)) => Ports { source, dest },
        _ => Ports::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4(ihl_words: u8, proto: u8, payload: &[u8]) -> Vec<u8> {
        let hdr_len = ihl_words as usize * 4;
        let mut pkt = vec![0u8; hdr_len.max(20)];
        pkt[0] = 0x40 | ihl_words;
        pkt[IPV4_PROTO] = proto;
        pkt[IPV4_SADDR..IPV4_SADDR + 4].copy_from_slice(&[10, 0, 0, 1]);
        pkt[IPV4_DADDR..IPV4_DADDR + 4].copy_from_slice(&[192, 168, 1, 7]);
        pkt.extend_from_slice(payload);
        pkt
    }

    #[test]
    fn ipv4_addresses_are_left_as_read() {
        let pkt = ipv4(5, IPPROTO_TCP, &[0x30, 0x39, 0x00, 0x50]);
        let hdr = classify(&PacketReader::new(&pkt), AF_INET).unwrap();
        assert_eq!(
            hdr,
            NetworkHeader::Ipv4 {
                protocol: IPPROTO_TCP,
                saddr: u32::from_ne_bytes([10, 0, 0, 1]),
                daddr: u32::from_ne_bytes([192, 168, 1, 7]),
                transport: 20,
            }
        );
    }

    #[test]
    fn ipv4_options_move_the_transport_offset() {
        let pkt = ipv4(7, IPPROTO_UDP, &[0x00, 0x35, 0xc3, 0x50, 0x00, 0x08, 0x00, 0x00]);
        let r = PacketReader::new(&pkt);
        let hdr = classify(&r, AF_INET).unwrap();
        assert!(matches!(hdr, NetworkHeader::Ipv4 { transport: 28, .. }));
        assert_eq!(
            transport_ports(&r, IPPROTO_UDP, 28),
            Ports {
                source: 53,
                dest: 50000
            }
        );
    }

    #[test]
    fn ipv4_header_length_below_minimum_is_rejected() {
        let pkt = ipv4(4, IPPROTO_TCP, &[0; 8]);
        assert_eq!(classify(&PacketReader::new(&pkt), AF_INET), Err(OutOfBounds));
    }

    #[test]
    fn truncated_l3_is_rejected() {
        let pkt = ipv4(5, IPPROTO_TCP, &[]);
        assert_eq!(classify(&PacketReader::new(&pkt[..10]), AF_INET), Err(OutOfBounds));
        assert_eq!(classify(&PacketReader::new(&[0u8; 39]), AF_INET6), Err(OutOfBounds));
    }

    #[test]
    fn short_transport_segment_is_rejected() {
        // Header fits but only three transport bytes follow.
        let pkt = ipv4(5, IPPROTO_TCP, &[0, 80, 0]);
        assert_eq!(classify(&PacketReader::new(&pkt), AF_INET), Err(OutOfBounds));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6.extend_from_slice(&[0, 1]);
        assert_eq!(classify(&PacketReader::new(&v6), AF_INET6), Err(OutOfBounds));
    }

    #[test]
    fn ipv6_copies_full_addresses() {
        let mut pkt = vec![0u8; 40];
        pkt[0] = 0x60;
        pkt[IPV6_NEXTHDR] = IPPROTO_UDP;
        let src: [u8; 16] = [0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1];
        let dst: [u8; 16] = [0xfe, 0x80, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 2];
        pkt[IPV6_SADDR..IPV6_SADDR + 16].copy_from_slice(&src);
        pkt[IPV6_DADDR..IPV6_DADDR + 16].copy_from_slice(&dst);
        pkt.extend_from_slice(&[0x1f, 0x90, 0x00, 0x35]);

        let hdr = classify(&PacketReader::new(&pkt), AF_INET6).unwrap();
        assert_eq!(
            hdr,
            NetworkHeader::Ipv6 {
                protocol: IPPROTO_UDP,
                saddr: src,
                daddr: dst,
                transport: 40,
            }
        );
        assert_eq!(hdr.protocol(), IPPROTO_UDP);
    }

    #[test]
    fn unknown_family_is_not_parsed() {
        assert_eq!(
            classify(&PacketReader::new(&[]), 1),
            Ok(NetworkHeader::Other)
        );
        assert_eq!(NetworkHeader::Other.protocol(), 0);
    }

    #[test]
    fn ports_soft_fail() {
        let mut seg = [0u8; 20];
        seg[..4].copy_from_slice(&[0x30, 0x39, 0x00, 0x50]);
        let r = PacketReader::new(&seg);
        assert_eq!(
            transport_ports(&r, IPPROTO_TCP, 0),
            Ports {
                source: 12345,
                dest: 80
            }
        );
        assert_eq!(
            transport_ports(&PacketReader::new(&seg[..8]), IPPROTO_UDP, 0),
            Ports {
                source: 12345,
                dest: 80
            }
        );
        // ICMP has no ports.
        assert_eq!(transport_ports(&r, 1, 0), Ports::default());
        // Port fields present but the rest of the header is cut off.
        assert_eq!(
            transport_ports(&PacketReader::new(&seg[..19]), IPPROTO_TCP, 0),
            Ports::default()
        );
        assert_eq!(
            transport_ports(&PacketReader::new(&seg[..7]), IPPROTO_UDP, 0),
            Ports::default()
        );
        assert_eq!(transport_ports(&r, IPPROTO_UDP, 13), Ports::default());
    }
}
