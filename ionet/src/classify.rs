use serde::Serialize;
use std::net::{IpAddr, Ipv6Addr};

/// Coarse locality of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum IpClass {
    #[serde(rename = "v4Local")]
    V4Local,
    #[serde(rename = "v4External")]
    V4External,
    #[serde(rename = "v6Local")]
    V6Local,
    #[serde(rename = "v6External")]
    V6External,
}

impl IpClass {
    pub fn of(ip: &IpAddr) -> Self {
        match (ip, is_local(ip)) {
            (IpAddr::V4(_), true) => IpClass::V4Local,
            (IpAddr::V4(_), false) => IpClass::V4External,
            (IpAddr::V6(_), true) => IpClass::V6Local,
            (IpAddr::V6(_), false) => IpClass::V6External,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            IpClass::V4Local => "v4Local",
            IpClass::V4External => "v4External",
            IpClass::V6Local => "v6Local",
            IpClass::V6External => "v6External",
        }
    }
}

/// Loopback, private, multicast, or IPv6 link-local.
///
/// IPv4-mapped IPv6 addresses are judged by their IPv4 form.
pub fn is_local(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_multicast(),
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => is_local(&IpAddr::V4(v4)),
            None => {
                v6.is_loopback() || is_unique_local(v6) || is_link_local(v6) || v6.is_multicast()
            }
        },
    }
}

/// fc00::/7
fn is_unique_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xfe00) == 0xfc00
}

/// fe80::/10
fn is_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_v4_classes() {
        assert_eq!(IpClass::of(&ip("127.0.0.1")), IpClass::V4Local);
        assert_eq!(IpClass::of(&ip("10.2.3.4")), IpClass::V4Local);
        assert_eq!(IpClass::of(&ip("172.20.0.1")), IpClass::V4Local);
        assert_eq!(IpClass::of(&ip("192.168.0.10")), IpClass::V4Local);
        assert_eq!(IpClass::of(&ip("224.0.0.251")), IpClass::V4Local);
        assert_eq!(IpClass::of(&ip("8.8.8.8")), IpClass::V4External);
        assert_eq!(IpClass::of(&ip("172.32.0.1")), IpClass::V4External);
    }

    #[test]
    fn test_v6_classes() {
        assert_eq!(IpClass::of(&ip("::1")), IpClass::V6Local);
        assert_eq!(IpClass::of(&ip("fd00::1")), IpClass::V6Local);
        assert_eq!(IpClass::of(&ip("fe80::1")), IpClass::V6Local);
        assert_eq!(IpClass::of(&ip("ff02::fb")), IpClass::V6Local);
        assert_eq!(IpClass::of(&ip("2606:4700::1111")), IpClass::V6External);
        assert_eq!(IpClass::of(&ip("fec0::1")), IpClass::V6External);
    }

    #[test]
    fn test_mapped_v4_uses_v4_rules() {
        assert!(is_local(&ip("::ffff:192.168.1.1")));
        assert!(!is_local(&ip("::ffff:1.1.1.1")));
    }
}
