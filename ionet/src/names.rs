//! Human-readable names for the numeric fields of a traffic event.

use dashmap::DashMap;
use ionet_common::{AF_INET, AF_INET6};
use std::ffi::CStr;

pub fn protocol_name(proto: u8) -> String {
    let name = match proto {
        1 => "ICMP",
        2 => "IGMP",
        4 => "IPIP",
        6 => "TCP",
        17 => "UDP",
        41 => "IPv6",
        47 => "GRE",
        50 => "ESP",
        51 => "AH",
        58 => "ICMPv6",
        132 => "SCTP",
        136 => "UDPLite",
        other => return format!("IP({})", other),
    };
    name.to_string()
}

/// Kernel `PACKET_*` classification of an skb.
pub fn pkt_type_name(pkt_type: u32) -> String {
    let name = match pkt_type {
        0 => "HOST",
        1 => "BROADCAST",
        2 => "MULTICAST",
        3 => "OTHERHOST",
        4 => "OUTGOING",
        5 => "LOOPBACK",
        6 => "FASTROUTE",
        other => return format!("UNKNOWN({})", other),
    };
    name.to_string()
}

pub fn family_name(family: u32) -> String {
    match family {
        AF_INET => "IPv4".to_string(),
        AF_INET6 => "IPv6".to_string(),
        other => format!("AF({})", other),
    }
}

const KB: u64 = 1 << 10;
const MB: u64 = 1 << 20;
const GB: u64 = 1 << 30;
const TB: u64 = 1 << 40;
const PB: u64 = 1 << 50;

pub fn format_bytes(b: u64) -> String {
    let (unit, div) = match b {
        b if b >= PB => ("PB", PB),
        b if b >= TB => ("TB", TB),
        b if b >= GB => ("GB", GB),
        b if b >= MB => ("MB", MB),
        b if b >= KB => ("KB", KB),
        b => return format!("{} B", b),
    };
    format!("{:.2} {}", b as f64 / div as f64, unit)
}

/// ifindex -> interface name, cached.
///
/// Indexes that cannot be resolved are cached as `Unknown` too; interfaces
/// rarely come and go while the agent runs.
#[derive(Default)]
pub struct InterfaceNames {
    cache: DashMap<u32, String>,
}

impl InterfaceNames {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(&self, ifindex: u32) -> String {
        if let Some(name) = self.cache.get(&ifindex) {
            return name.clone();
        }
        let name = if_indextoname(ifindex).unwrap_or_else(|| "Unknown".to_string());
        self.cache.insert(ifindex, name.clone());
        name
    }
}

fn if_indextoname(ifindex: u32) -> Option<String> {
    if ifindex == 0 {
        return None;
    }
    let mut buf = [0 as libc::c_char; libc::IF_NAMESIZE];
    // SAFETY: `buf` is IF_NAMESIZE bytes as the call requires.
    let ret = unsafe { libc::if_indextoname(ifindex, buf.as_mut_ptr()) };
    if ret.is_null() {
        return None;
    }
    // SAFETY: on success the kernel wrote a NUL-terminated name into `buf`.
    let name = unsafe { CStr::from_ptr(buf.as_ptr()) };
    Some(name.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_names() {
        assert_eq!(protocol_name(6), "TCP");
        assert_eq!(protocol_name(17), "UDP");
        assert_eq!(protocol_name(58), "ICMPv6");
        assert_eq!(protocol_name(253), "IP(253)");
    }

    #[test]
    fn test_pkt_type_names() {
        assert_eq!(pkt_type_name(0), "HOST");
        assert_eq!(pkt_type_name(4), "OUTGOING");
        assert_eq!(pkt_type_name(42), "UNKNOWN(42)");
    }

    #[test]
    fn test_family_names() {
        assert_eq!(family_name(2), "IPv4");
        assert_eq!(family_name(10), "IPv6");
        assert_eq!(family_name(17), "AF(17)");
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(1023), "1023 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(5 * MB), "5.00 MB");
        assert_eq!(format_bytes(3 * TB / 2), "1.50 TB");
    }

    #[test]
    fn test_interface_names() {
        let names = InterfaceNames::new();
        assert_eq!(names.name(0), "Unknown");
        // Loopback is ifindex 1 on Linux; only check the lookup is cached.
        let first = names.name(1);
        assert_eq!(names.name(1), first);
        assert_eq!(names.cache.len(), 2);
    }
}
