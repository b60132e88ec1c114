#![no_std]
#![no_main]

use aya_ebpf::{
    bindings::BPF_RB_FORCE_WAKEUP,
    macros::{cgroup_skb, map},
    maps::RingBuf,
    programs::SkBuffContext,
};
use core::ptr;
use ionet_common::{
    handle_packet, Direction, EventSink, PacketMeta, PacketReader, Publish, TrafficEvent,
    TRAFFIC_RING_BYTES,
};

#[no_mangle]
#[link_section = "license"]
pub static _license: [u8; 13] = *b"Dual BSD/GPL\0";

#[map]
static TRAFFIC_RING: RingBuf = RingBuf::with_byte_size(TRAFFIC_RING_BYTES, 0);

#[cgroup_skb(ingress)]
pub fn monitor_ingress(ctx: SkBuffContext) -> i32 {
    inspect(&ctx, Direction::Ingress)
}

#[cgroup_skb(egress)]
pub fn monitor_egress(ctx: SkBuffContext) -> i32 {
    inspect(&ctx, Direction::Egress)
}

#[inline(always)]
fn inspect(ctx: &SkBuffContext, direction: Direction) -> i32 {
    let skb = ctx.skb.skb;
    // SAFETY: the kernel hands us a valid __sk_buff and guarantees that
    // [data, data_end) is the linear packet area for this invocation.
    let (meta, reader) = unsafe {
        (
            PacketMeta {
                family: (*skb).family,
                ifindex: (*skb).ifindex,
                pkttype: (*skb).pkt_type,
                len: (*skb).len,
            },
            PacketReader::from_raw((*skb).data as usize, (*skb).data_end as usize),
        )
    };
    handle_packet(&reader, &meta, direction, &RingSink { ctx })
}

/// Publishes into `TRAFFIC_RING` with a single reserve. A failed reserve is
/// the ring-full case and drops the event.
struct RingSink<'a> {
    #[cfg_attr(not(feature = "trace"), allow(dead_code))]
    ctx: &'a SkBuffContext,
}

impl EventSink for RingSink<'_> {
    /// Fields are written one at a time into the reserved slot. A whole-struct
    /// write lowers to a `memcpy` call in `.text`, and cross-section calls are
    /// rejected at load time.
    #[inline(always)]
    fn publish(&self, event: &TrafficEvent) -> Publish {
        let Some(mut slot) = TRAFFIC_RING.reserve::<TrafficEvent>(0) else {
            #[cfg(feature = "trace")]
            aya_log_ebpf::warn!(self.ctx, "failed to send event to ring buffer");
            return Publish::Dropped;
        };
        let p = slot.as_mut_ptr();
        unsafe {
            ptr::write_unaligned(ptr::addr_of_mut!((*p).protocol), event.protocol);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).direction), event.direction);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).saddr), event.saddr);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).daddr), event.daddr);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).saddr_v6), event.saddr_v6);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).daddr_v6), event.daddr_v6);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).sport), event.sport);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).dport), event.dport);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).ifindex), event.ifindex);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).family), event.family);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).pkttype), event.pkttype);
            ptr::write_unaligned(ptr::addr_of_mut!((*p).bytes), event.bytes);
        }
        slot.submit(BPF_RB_FORCE_WAKEUP as u64);

        #[cfg(feature = "trace")]
        trace_event(self.ctx, event);

        Publish::Sent
    }
}

#[cfg(feature = "trace")]
#[inline(always)]
fn trace_event(ctx: &SkBuffContext, event: &TrafficEvent) {
    use aya_log_ebpf::debug;
    use ionet_common::AF_INET6;

    let (sport, dport, proto, dir) = (event.sport, event.dport, event.protocol, event.direction);
    let (len, pkttype, family) = (event.bytes, event.pkttype, event.family);
    if family == AF_INET6 {
        let (src, dst) = (event.saddr_v6, event.daddr_v6);
        debug!(
            ctx,
            "IP {:i}:{} -> {:i}:{} proto={} dir={} len={} type={} fam={}",
            src, sport, dst, dport, proto, dir, len, pkttype, family
        );
    } else {
        let (src, dst) = (u32::from_be(event.saddr), u32::from_be(event.daddr));
        debug!(
            ctx,
            "IP {:i}:{} -> {:i}:{} proto={} dir={} len={} type={} fam={}",
            src, sport, dst, dport, proto, dir, len, pkttype, family
        );
    }
}

#[panic_handler]
fn panic(_info: &core::panic::PanicInfo) -> ! {
    unsafe { core::hint::unreachable_unchecked() }
}
