use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ionet_common::{Direction, TrafficEvent, AF_INET, AF_INET6, TRAFFIC_EVENT_LEN};

use crate::classify::IpClass;
use crate::names::{family_name, pkt_type_name, protocol_name};

/// Parse one ring buffer sample. Samples shorter than the record are rejected.
pub fn decode(sample: &[u8]) -> Option<TrafficEvent> {
    if sample.len() < TRAFFIC_EVENT_LEN {
        return None;
    }
    // SAFETY: the length check above covers the whole packed record, and the
    // record has alignment 1.
    Some(unsafe { core::ptr::read_unaligned(sample.as_ptr() as *const TrafficEvent) })
}

/// Source and destination addresses, picked by `family`.
///
/// IPv4 addresses arrive in the byte order they had on the wire, so their
/// in-memory bytes are the octets in order.
pub fn endpoints(event: &TrafficEvent) -> Option<(IpAddr, IpAddr)> {
    match event.family {
        AF_INET => Some((
            IpAddr::V4(Ipv4Addr::from({ event.saddr }.to_ne_bytes())),
            IpAddr::V4(Ipv4Addr::from({ event.daddr }.to_ne_bytes())),
        )),
        AF_INET6 => Some((
            IpAddr::V6(Ipv6Addr::from(event.saddr_v6)),
            IpAddr::V6(Ipv6Addr::from(event.daddr_v6)),
        )),
        _ => None,
    }
}

/// The far end of the packet: destination when sending, source when receiving.
///
/// Events without addresses map to the unspecified IPv6 address.
pub fn remote_endpoint(event: &TrafficEvent) -> (IpAddr, u16) {
    let (src, dst) = endpoints(event)
        .unwrap_or((IpAddr::V6(Ipv6Addr::UNSPECIFIED), IpAddr::V6(Ipv6Addr::UNSPECIFIED)));
    match Direction::from_tag(event.direction) {
        Direction::Egress => (dst, event.dport),
        Direction::Ingress => (src, event.sport),
    }
}

/// Decoded, serializable view of a [`TrafficEvent`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PacketRecord {
    pub timestamp: i64,
    pub protocol_id: u8,
    pub protocol: String,
    pub direction: Direction,
    pub interface: String,
    pub family: String,
    pub src_ip: Option<String>,
    pub dst_ip: Option<String>,
    pub src_port: u16,
    pub dst_port: u16,
    pub bytes: u64,
    pub pkt_type: String,
    pub ip_class: Option<String>,
}

impl PacketRecord {
    /// Convert a kernel-side event. The timestamp is assigned here.
    pub fn from_event(event: &TrafficEvent, interface: String) -> Self {
        let addrs = endpoints(event);
        let ip_class = addrs.map(|_| {
            let (remote, _) = remote_endpoint(event);
            IpClass::of(&remote).as_str().to_string()
        });
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            protocol_id: event.protocol,
            protocol: protocol_name(event.protocol),
            direction: Direction::from_tag(event.direction),
            interface,
            family: family_name(event.family),
            src_ip: addrs.map(|(src, _)| src.to_string()),
            dst_ip: addrs.map(|(_, dst)| dst.to_string()),
            src_port: event.sport,
            dst_port: event.dport,
            bytes: event.bytes,
            pkt_type: pkt_type_name(event.pkttype),
            ip_class,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn v4_event(
        direction: u8,
        src: [u8; 4],
        dst: [u8; 4],
        sport: u16,
        dport: u16,
    ) -> TrafficEvent {
        let mut ev = TrafficEvent::zeroed();
        ev.protocol = 6;
        ev.direction = direction;
        ev.saddr = u32::from_ne_bytes(src);
        ev.daddr = u32::from_ne_bytes(dst);
        ev.sport = sport;
        ev.dport = dport;
        ev.ifindex = 1;
        ev.family = AF_INET;
        ev.bytes = 1500;
        ev
    }

    #[test]
    fn test_decode_wire_bytes() {
        let mut raw = Vec::with_capacity(TRAFFIC_EVENT_LEN);
        raw.push(17u8);
        raw.push(b'i');
        raw.extend_from_slice(&[10, 0, 0, 1]);
        raw.extend_from_slice(&[8, 8, 8, 8]);
        raw.extend_from_slice(&[0; 32]);
        raw.extend_from_slice(&53u16.to_ne_bytes());
        raw.extend_from_slice(&40000u16.to_ne_bytes());
        raw.extend_from_slice(&2u32.to_ne_bytes());
        raw.extend_from_slice(&AF_INET.to_ne_bytes());
        raw.extend_from_slice(&0u32.to_ne_bytes());
        raw.extend_from_slice(&128u64.to_ne_bytes());
        assert_eq!(raw.len(), TRAFFIC_EVENT_LEN);

        let ev = decode(&raw).unwrap();
        assert_eq!({ ev.protocol }, 17);
        assert_eq!({ ev.sport }, 53);
        assert_eq!({ ev.dport }, 40000);
        assert_eq!({ ev.ifindex }, 2);
        assert_eq!({ ev.bytes }, 128);
        let (src, dst) = endpoints(&ev).unwrap();
        assert_eq!(src.to_string(), "10.0.0.1");
        assert_eq!(dst.to_string(), "8.8.8.8");
    }

    #[test]
    fn test_decode_rejects_short_samples() {
        assert!(decode(&[0u8; TRAFFIC_EVENT_LEN - 1]).is_none());
        assert!(decode(&[]).is_none());
    }

    #[test]
    fn test_remote_endpoint_follows_direction() {
        let out = v4_event(b'o', [192, 168, 1, 5], [1, 1, 1, 1], 50000, 443);
        assert_eq!(remote_endpoint(&out), ("1.1.1.1".parse().unwrap(), 443));

        let inc = v4_event(b'i', [1, 1, 1, 1], [192, 168, 1, 5], 443, 50000);
        assert_eq!(remote_endpoint(&inc), ("1.1.1.1".parse().unwrap(), 443));
    }

    #[test]
    fn test_record_from_v6_event() {
        let mut ev = TrafficEvent::zeroed();
        ev.protocol = 17;
        ev.direction = b'o';
        ev.family = AF_INET6;
        ev.saddr_v6 = "fe80::1".parse::<Ipv6Addr>().unwrap().octets();
        ev.daddr_v6 = "2001:4860:4860::8888".parse::<Ipv6Addr>().unwrap().octets();
        ev.sport = 5353;
        ev.dport = 53;
        ev.pkttype = 4;
        ev.bytes = 90;

        let rec = PacketRecord::from_event(&ev, "eth0".into());
        assert_eq!(rec.protocol, "UDP");
        assert_eq!(rec.direction, Direction::Egress);
        assert_eq!(rec.family, "IPv6");
        assert_eq!(rec.src_ip.as_deref(), Some("fe80::1"));
        assert_eq!(rec.dst_ip.as_deref(), Some("2001:4860:4860::8888"));
        assert_eq!(rec.pkt_type, "OUTGOING");
        assert_eq!(rec.ip_class.as_deref(), Some("v6External"));
        assert_eq!(rec.interface, "eth0");
    }

    #[test]
    fn test_record_without_addresses() {
        let mut ev = TrafficEvent::zeroed();
        ev.family = 17;
        ev.direction = b'i';
        let rec = PacketRecord::from_event(&ev, "Unknown".into());
        assert_eq!(rec.src_ip, None);
        assert_eq!(rec.dst_ip, None);
        assert_eq!(rec.ip_class, None);
        assert_eq!(rec.protocol, "IP(0)");
        assert_eq!(rec.family, "AF(17)");
    }
}
