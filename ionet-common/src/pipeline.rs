//! Event assembly and publication, shared by both cgroup-skb hooks.
//!
//! Per packet the flow is strictly forward:
//! bounds check + classify -> ports -> build -> publish. A packet whose L3
//! header does not fit produces nothing; every other packet produces exactly
//! one event, which the sink either accepts or drops.

use crate::{
    event::{Direction, TrafficEvent},
    packet::PacketReader,
    parse::{classify, transport_ports, NetworkHeader, Ports},
};

/// cgroup-skb verdict letting the packet through.
pub const VERDICT_ALLOW: i32 = 1;

/// Metadata the kernel reports alongside the packet bytes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PacketMeta {
    pub family: u32,
    pub ifindex: u32,
    pub pkttype: u32,
    /// Length reported by the socket buffer, not re-measured.
    pub len: u32,
}

/// Result of a single publish attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Publish {
    Sent,
    /// The channel was full. The event is gone; nothing is retried.
    Dropped,
}

/// Bounded, non-blocking delivery channel for events.
///
/// Implementations make exactly one enqueue attempt and must never block.
pub trait EventSink {
    fn publish(&self, event: &TrafficEvent) -> Publish;
}

/// How far a packet got through the pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// L3 header truncated or malformed, no event was built.
    Aborted,
    Published(TrafficEvent),
    Dropped(TrafficEvent),
}

/// Assemble the record. Only the address group of the parsed family is set.
#[inline(always)]
pub fn build_event(
    direction: Direction,
    meta: &PacketMeta,
    header: &NetworkHeader,
    ports: Ports,
) -> TrafficEvent {
    let mut event = TrafficEvent::zeroed();
    event.direction = direction.tag();
    event.protocol = header.protocol();
    match *header {
        NetworkHeader::Ipv4 { saddr, daddr, .. } => {
            event.saddr = saddr;
            event.daddr = daddr;
        }
        NetworkHeader::Ipv6 { saddr, daddr, .. } => {
            event.saddr_v6 = saddr;
            event.daddr_v6 = daddr;
        }
        NetworkHeader::Other => {}
    }
    event.sport = ports.source;
    event.dport = ports.dest;
    event.ifindex = meta.ifindex;
    event.family = meta.family;
    event.pkttype = meta.pkttype;
    event.bytes = meta.len as u64;
    event
}

/// Run one packet through the pipeline.
#[inline(always)]
pub fn observe<S: EventSink>(
    reader: &PacketReader<'_>,
    meta: &PacketMeta,
    direction: Direction,
    sink: &S,
) -> Outcome {
    let header = match classify(reader, meta.family) {
        Ok(header) => header,
        Err(_) => return Outcome::Aborted,
    };
    let ports = match header {
        NetworkHeader::Ipv4 {
            protocol,
            transport,
            ..
        }
        | NetworkHeader::Ipv6 {
            protocol,
            transport,
            ..
        } => transport_ports(reader, protocol, transport),
        NetworkHeader::Other => Ports::default(),
    };
    let event = build_event(direction, meta, &header, ports);
    match sink.publish(&event) {
        Publish::Sent => Outcome::Published(event),
        Publish::Dropped => Outcome::Dropped(event),
    }
}

/// Hook body: observe the packet and always let it through.
#[inline(always)]
pub fn handle_packet<S: EventSink>(
    reader: &PacketReader<'_>,
    meta: &PacketMeta,
    direction: Direction,
    sink: &S,
) -> i32 {
    let _ = observe(reader, meta, direction, sink);
    VERDICT_ALLOW
}
