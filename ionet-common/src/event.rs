use network_types::ip::IpProto;

/// Address family tag for IPv4, as reported by the socket buffer.
pub const AF_INET: u32 = 2;
/// Address family tag for IPv6.
pub const AF_INET6: u32 = 10;

pub const IPPROTO_TCP: u8 = IpProto::Tcp as u8;
pub const IPPROTO_UDP: u8 = IpProto::Udp as u8;

/// Ring buffer size in bytes (16 MiB, roughly 250K records before dropping).
pub const TRAFFIC_RING_BYTES: u32 = 1 << 24;

/// Per-packet record handed from the cgroup-skb hooks to userspace.
///
/// The layout is packed and consumers parse it byte for byte, so the field
/// order is part of the wire contract.
///
/// Addresses keep the byte order they had on the wire, ports are converted to
/// host order. Only the address group matching `family` is filled in; the
/// other one is all zero.
#[repr(C, packed)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TrafficEvent {
    /// Transport protocol id from the L3 header (6 = TCP, 17 = UDP, ...).
    pub protocol: u8,
    /// `b'i'` for ingress, `b'o'` for egress.
    pub direction: u8,
    /// IPv4 source address, network byte order as read.
    pub saddr: u32,
    /// IPv4 destination address, network byte order as read.
    pub daddr: u32,
    pub saddr_v6: [u8; 16],
    pub daddr_v6: [u8; 16],
    /// Source port, host byte order.
    pub sport: u16,
    /// Destination port, host byte order.
    pub dport: u16,
    pub ifindex: u32,
    pub family: u32,
    /// Kernel packet type (PACKET_HOST, PACKET_BROADCAST, ...).
    pub pkttype: u32,
    /// Packet length as reported by the socket buffer.
    pub bytes: u64,
}

pub const TRAFFIC_EVENT_LEN: usize = 66;

const _: () = assert!(core::mem::size_of::<TrafficEvent>() == TRAFFIC_EVENT_LEN);

impl TrafficEvent {
    pub const fn zeroed() -> Self {
        Self {
            protocol: 0,
            direction: 0,
            saddr: 0,
            daddr: 0,
            saddr_v6: [0; 16],
            daddr_v6: [0; 16],
            sport: 0,
            dport: 0,
            ifindex: 0,
            family: 0,
            pkttype: 0,
            bytes: 0,
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for TrafficEvent {}

/// Which checkpoint saw the packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(
    feature = "user",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum Direction {
    Ingress,
    Egress,
}

impl Direction {
    /// The one-byte tag stored in [`TrafficEvent::direction`].
    #[inline(always)]
    pub const fn tag(self) -> u8 {
        match self {
            Direction::Ingress => b'i',
            Direction::Egress => b'o',
        }
    }

    /// Anything that is not the ingress tag counts as egress.
    pub const fn from_tag(tag: u8) -> Self {
        if tag == b'i' {
            Direction::Ingress
        } else {
            Direction::Egress
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Direction::Ingress => "ingress",
            Direction::Egress => "egress",
        }
    }
}
