use dashmap::DashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

use ionet_common::{Direction, TrafficEvent};

use crate::classify::is_local;
use crate::filter::{AggFilter, RawFilter};
use crate::record::{remote_endpoint, PacketRecord};

/// Aggregation key: the remote endpoint and the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggKey {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: u8,
}

impl AggKey {
    pub fn from_event(event: &TrafficEvent) -> Self {
        let (ip, port) = remote_endpoint(event);
        Self {
            ip,
            port,
            protocol: event.protocol,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AggValue {
    pub count: u64,
    pub ingress_bytes: u64,
    pub egress_bytes: u64,
    pub total_bytes: u64,
    pub is_local: bool,
    /// Receive time (ms) of the newest event in this entry.
    pub last_seen: i64,
}

impl AggValue {
    fn add(&mut self, direction: Direction, bytes: u64, timestamp: i64) {
        self.count += 1;
        self.last_seen = self.last_seen.max(timestamp);
        match direction {
            Direction::Ingress => self.ingress_bytes += bytes,
            Direction::Egress => self.egress_bytes += bytes,
        }
        self.total_bytes = self.ingress_bytes + self.egress_bytes;
    }
}

pub const DEFAULT_MAX_AGGREGATES: usize = 100_000;

/// Live view of everything the ring buffer delivered since start.
pub struct TrafficState {
    recent: Mutex<VecDeque<PacketRecord>>,
    max_recent: usize,
    max_aggregates: usize,
    pub aggregates: DashMap<AggKey, AggValue>,
    pub total_packets: AtomicU64,
    pub total_bytes: AtomicU64,
    pub ingress_bytes: AtomicU64,
    pub egress_bytes: AtomicU64,
    /// Ring buffer samples that were too short to decode.
    pub malformed: AtomicU64,
    /// Events dropped because the storage queue was full.
    pub queue_drops: AtomicU64,
    /// Events not aggregated because the table was at `max_aggregates`.
    pub aggregate_overflow: AtomicU64,
}

impl TrafficState {
    pub fn new(max_recent: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(max_recent.min(4096))),
            max_recent,
            max_aggregates: DEFAULT_MAX_AGGREGATES,
            aggregates: DashMap::new(),
            total_packets: AtomicU64::new(0),
            total_bytes: AtomicU64::new(0),
            ingress_bytes: AtomicU64::new(0),
            egress_bytes: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
            aggregate_overflow: AtomicU64::new(0),
        }
    }

    /// Bound the number of distinct aggregation keys. Events for new keys
    /// past the limit still count towards the totals.
    pub fn with_max_aggregates(mut self, max_aggregates: usize) -> Self {
        self.max_aggregates = max_aggregates;
        self
    }

    pub fn update(&self, event: &TrafficEvent, record: &PacketRecord) {
        let bytes = event.bytes;
        let direction = Direction::from_tag(event.direction);
        let key = AggKey::from_event(event);

        let known = match self.aggregates.get_mut(&key) {
            Some(mut val) => {
                val.add(direction, bytes, record.timestamp);
                true
            }
            None => false,
        };
        if !known {
            if self.aggregates.len() < self.max_aggregates {
                self.aggregates
                    .entry(key)
                    .or_insert_with(|| AggValue {
                        is_local: is_local(&key.ip),
                        ..Default::default()
                    })
                    .add(direction, bytes, record.timestamp);
            } else {
                self.aggregate_overflow.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.total_packets.fetch_add(1, Ordering::Relaxed);
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        match direction {
            Direction::Ingress => self.ingress_bytes.fetch_add(bytes, Ordering::Relaxed),
            Direction::Egress => self.egress_bytes.fetch_add(bytes, Ordering::Relaxed),
        };

        if self.max_recent == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        if recent.len() >= self.max_recent {
            recent.pop_front();
        }
        recent.push_back(record.clone());
    }

    /// The newest `limit` recent events matching `filter`, oldest first.
    pub fn recent_events(
        &self,
        filter: &RawFilter,
        hide_local: bool,
        limit: usize,
    ) -> Vec<PacketRecord> {
        let recent = self.recent.lock().unwrap_or_else(PoisonError::into_inner);
        let mut matched: Vec<PacketRecord> = recent
            .iter()
            .rev()
            .filter(|r| !(hide_local && record_is_local(r)))
            .filter(|r| filter.is_empty() || filter.matches(r))
            .take(limit)
            .cloned()
            .collect();
        matched.reverse();
        matched
    }

    /// Drop aggregates not seen since `cutoff_ms`. Returns how many went.
    pub fn expire_idle(&self, cutoff_ms: i64) -> usize {
        let before = self.aggregates.len();
        self.aggregates.retain(|_, val| val.last_seen >= cutoff_ms);
        before.saturating_sub(self.aggregates.len())
    }

    pub fn recent_len(&self) -> usize {
        self.recent.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Aggregates matching `filter`, largest total first, ties by port.
    pub fn top_aggregates(&self, filter: &AggFilter, hide_local: bool) -> Vec<(AggKey, AggValue)> {
        let mut rows: Vec<(AggKey, AggValue)> = self
            .aggregates
            .iter()
            .filter(|e| !(hide_local && e.value().is_local))
            .filter(|e| filter.is_empty() || filter.matches(e.key(), e.value()))
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        rows.sort_by(|(ka, va), (kb, vb)| {
            vb.total_bytes
                .cmp(&va.total_bytes)
                .then(ka.port.cmp(&kb.port))
        });
        rows
    }
}

fn record_is_local(record: &PacketRecord) -> bool {
    matches!(record.ip_class.as_deref(), Some("v4Local") | Some("v6Local"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::v4_event;

    fn feed(state: &TrafficState, ev: &TrafficEvent) {
        state.update(ev, &PacketRecord::from_event(ev, "lo".into()));
    }

    #[test]
    fn test_aggregates_by_remote_endpoint() {
        let state = TrafficState::new(10);
        let out = v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 40000, 443);
        let back = v4_event(b'i', [1, 1, 1, 1], [10, 0, 0, 2], 443, 40000);
        feed(&state, &out);
        feed(&state, &back);
        feed(&state, &back);

        assert_eq!(state.aggregates.len(), 1);
        let rows = state.top_aggregates(&AggFilter::default(), false);
        let (key, val) = &rows[0];
        assert_eq!(key.ip.to_string(), "1.1.1.1");
        assert_eq!(key.port, 443);
        assert_eq!(key.protocol, 6);
        assert_eq!(val.count, 3);
        assert_eq!(val.egress_bytes, 1500);
        assert_eq!(val.ingress_bytes, 3000);
        assert_eq!(val.total_bytes, 4500);
        assert!(!val.is_local);

        assert_eq!(state.total_packets.load(Ordering::Relaxed), 3);
        assert_eq!(state.total_bytes.load(Ordering::Relaxed), 4500);
        assert_eq!(state.ingress_bytes.load(Ordering::Relaxed), 3000);
        assert_eq!(state.egress_bytes.load(Ordering::Relaxed), 1500);
    }

    #[test]
    fn test_aggregate_order_and_local_hiding() {
        let state = TrafficState::new(10);
        let mut big = v4_event(b'o', [10, 0, 0, 2], [8, 8, 8, 8], 1, 53);
        big.bytes = 9000;
        feed(&state, &big);
        feed(&state, &v4_event(b'o', [10, 0, 0, 2], [9, 9, 9, 9], 1, 80));
        feed(&state, &v4_event(b'o', [10, 0, 0, 2], [9, 9, 9, 9], 1, 22));
        feed(&state, &v4_event(b'o', [10, 0, 0, 2], [192, 168, 0, 1], 1, 8080));

        let ports: Vec<u16> = state
            .top_aggregates(&AggFilter::default(), false)
            .iter()
            .map(|(k, _)| k.port)
            .collect();
        assert_eq!(ports, vec![53, 22, 80, 8080]);

        let ports: Vec<u16> = state
            .top_aggregates(&AggFilter::default(), true)
            .iter()
            .map(|(k, _)| k.port)
            .collect();
        assert_eq!(ports, vec![53, 22, 80]);
    }

    #[test]
    fn test_recent_window_is_bounded() {
        let state = TrafficState::new(2);
        for port in [1, 2, 3] {
            feed(&state, &v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 5000, port));
        }
        assert_eq!(state.recent_len(), 2);
        let ports: Vec<u16> = state
            .recent_events(&RawFilter::default(), false, 10)
            .iter()
            .map(|r| r.dst_port)
            .collect();
        assert_eq!(ports, vec![2, 3]);

        let newest = state.recent_events(&RawFilter::default(), false, 1);
        assert_eq!(newest[0].dst_port, 3);
    }

    #[test]
    fn test_recent_hides_local() {
        let state = TrafficState::new(10);
        feed(&state, &v4_event(b'i', [127, 0, 0, 1], [127, 0, 0, 1], 1, 2));
        feed(&state, &v4_event(b'i', [1, 2, 3, 4], [10, 0, 0, 1], 3, 4));
        let shown = state.recent_events(&RawFilter::default(), true, 10);
        assert_eq!(shown.len(), 1);
        assert_eq!(shown[0].src_ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_aggregate_table_is_capped() {
        let state = TrafficState::new(0).with_max_aggregates(2);
        for port in [1, 2, 3, 4] {
            feed(&state, &v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 5000, port));
        }
        // Known keys keep updating once the table is full.
        feed(&state, &v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 5000, 1));

        assert_eq!(state.aggregates.len(), 2);
        assert_eq!(state.aggregate_overflow.load(Ordering::Relaxed), 2);
        assert_eq!(state.total_packets.load(Ordering::Relaxed), 5);
        let rows = state.top_aggregates(&AggFilter::default(), false);
        assert_eq!(rows[0].0.port, 1);
        assert_eq!(rows[0].1.count, 2);
    }

    #[test]
    fn test_expire_idle_aggregates() {
        let state = TrafficState::new(0);
        let old = v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 5000, 80);
        let mut rec = PacketRecord::from_event(&old, "lo".into());
        rec.timestamp = 1_000;
        state.update(&old, &rec);

        let fresh = v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 5000, 443);
        let mut rec = PacketRecord::from_event(&fresh, "lo".into());
        rec.timestamp = 5_000;
        state.update(&fresh, &rec);

        assert_eq!(state.expire_idle(2_000), 1);
        let rows = state.top_aggregates(&AggFilter::default(), false);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.port, 443);
        assert_eq!(rows[0].1.last_seen, 5_000);
        assert_eq!(state.expire_idle(2_000), 0);
    }

    #[test]
    fn test_zero_window_keeps_only_counters() {
        let state = TrafficState::new(0);
        feed(&state, &v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 1, 2));
        assert_eq!(state.recent_len(), 0);
        assert_eq!(state.total_packets.load(Ordering::Relaxed), 1);
    }
}
