//! Shared types and the per-packet pipeline for ionet.
//!
//! Everything here is `no_std` so the same code runs inside the cgroup-skb
//! programs and in host-side tests. Userspace enables the `user` feature to
//! get `aya::Pod` for the ring buffer record and serde for [`Direction`].

#![cfg_attr(not(test), no_std)]

pub mod event;
pub mod packet;
pub mod parse;
pub mod pipeline;

pub use event::{
    Direction, TrafficEvent, AF_INET, AF_INET6, IPPROTO_TCP, IPPROTO_UDP, TRAFFIC_EVENT_LEN,
    TRAFFIC_RING_BYTES,
};
pub use packet::{OutOfBounds, PacketReader};
pub use parse::{classify, transport_ports, NetworkHeader, Ports};
pub use pipeline::{
    build_event, handle_packet, observe, EventSink, Outcome, PacketMeta, Publish, VERDICT_ALLOW,
};
