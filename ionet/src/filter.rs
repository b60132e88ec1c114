//! Event and aggregate filters.
//!
//! Filters come either from a query string (`?protocol=tcp&dport=443`) or
//! from the compact text form `proto=tcp dport=443`. Every field is optional
//! and an empty filter matches everything.

use ipnet::IpNet;
use serde::Deserialize;
use std::net::IpAddr;

use crate::names::protocol_name;
use crate::record::PacketRecord;
use crate::state::{AggKey, AggValue};

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct RawFilter {
    pub protocol: Option<String>,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub sport: Option<String>,
    pub dport: Option<String>,
    pub direction: Option<String>,
}

impl RawFilter {
    pub fn parse(text: &str) -> Self {
        let mut f = Self::default();
        for (key, value) in pairs(text) {
            let slot = match key.as_str() {
                "proto" | "protocol" => &mut f.protocol,
                "src" | "srcip" => &mut f.src,
                "dst" | "dstip" => &mut f.dst,
                "sport" | "srcport" => &mut f.sport,
                "dport" | "dstport" => &mut f.dport,
                "dir" | "direction" => &mut f.direction,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
        f
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, record: &PacketRecord) -> bool {
        if let Some(ref proto) = self.protocol {
            if !record.protocol.eq_ignore_ascii_case(proto) {
                return false;
            }
        }
        if let Some(ref src) = self.src {
            if !ip_matches(record.src_ip.as_deref().unwrap_or(""), src) {
                return false;
            }
        }
        if let Some(ref dst) = self.dst {
            if !ip_matches(record.dst_ip.as_deref().unwrap_or(""), dst) {
                return false;
            }
        }
        if let Some(ref sport) = self.sport {
            if record.src_port.to_string() != *sport {
                return false;
            }
        }
        if let Some(ref dport) = self.dport {
            if record.dst_port.to_string() != *dport {
                return false;
            }
        }
        if let Some(ref dir) = self.direction {
            if !record.direction.as_str().eq_ignore_ascii_case(dir) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct AggFilter {
    pub protocol: Option<String>,
    pub ip: Option<String>,
    pub port: Option<String>,
    pub min_bytes: Option<String>,
    pub max_bytes: Option<String>,
}

impl AggFilter {
    pub fn parse(text: &str) -> Self {
        let mut f = Self::default();
        for (key, value) in pairs(text) {
            let slot = match key.as_str() {
                "proto" | "protocol" => &mut f.protocol,
                "ip" => &mut f.ip,
                "port" => &mut f.port,
                "minbytes" => &mut f.min_bytes,
                "maxbytes" => &mut f.max_bytes,
                _ => continue,
            };
            *slot = Some(value.to_string());
        }
        f
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn matches(&self, key: &AggKey, val: &AggValue) -> bool {
        if let Some(ref proto) = self.protocol {
            if !protocol_name(key.protocol).eq_ignore_ascii_case(proto) {
                return false;
            }
        }
        if let Some(ref ip) = self.ip {
            if !ip_matches(&key.ip.to_string(), ip) {
                return false;
            }
        }
        if let Some(ref port) = self.port {
            if key.port.to_string() != *port {
                return false;
            }
        }
        // Bounds that do not parse are ignored.
        if let Some(min) = self.min_bytes.as_deref().and_then(|s| s.parse::<u64>().ok()) {
            if val.total_bytes < min {
                return false;
            }
        }
        if let Some(max) = self.max_bytes.as_deref().and_then(|s| s.parse::<u64>().ok()) {
            if val.total_bytes > max {
                return false;
            }
        }
        true
    }
}

/// `key=value` tokens separated by whitespace; keys are lowercased.
fn pairs<'a>(text: &'a str) -> impl Iterator<Item = (String, &'a str)> + 'a {
    text.split_whitespace().filter_map(|part| {
        let (key, value) = part.split_once('=')?;
        Some((key.to_ascii_lowercase(), value))
    })
}

/// Exact match, substring, or CIDR containment.
pub fn ip_matches(ip: &str, filter: &str) -> bool {
    if filter.is_empty() || ip == filter || ip.contains(filter) {
        return true;
    }
    match (filter.parse::<IpNet>(), ip.parse::<IpAddr>()) {
        (Ok(net), Ok(addr)) => net.contains(&addr),
        _ => false,
    }
}
