use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use crate::classify::is_local;

pub const LOCAL_LABEL: &str = "local/private";
pub const PENDING_LABEL: &str = "resolving...";
pub const UNRESOLVED_LABEL: &str = "unknown";

/// Cached DNS entry with expiration.
struct CacheEntry {
    hostname: Option<String>,
    expires_at: Instant,
}

/// Async reverse-DNS resolver with a TTL-based cache.
///
/// Lookups that fail (no PTR record, timeout, etc.) are cached as `None` to
/// prevent repeated queries for non-resolvable addresses.
pub struct DnsCache {
    cache: DashMap<IpAddr, CacheEntry>,
    ttl: Duration,
    timeout: Duration,
    pending: mpsc::Sender<IpAddr>,
}

impl DnsCache {
    /// Create a new cache and the queue feeding its background resolver.
    ///
    /// * `ttl` -- how long a successful (or failed) lookup is kept.
    /// * `timeout` -- max wall-clock time for a single DNS query.
    /// * `queue` -- addresses waiting for [`DnsCache::run_resolver`]; extra
    ///   requests are dropped and retried on the next `label` call.
    pub fn new(ttl: Duration, timeout: Duration, queue: usize) -> (Self, mpsc::Receiver<IpAddr>) {
        let (pending, rx) = mpsc::channel(queue);
        let cache = Self {
            cache: DashMap::new(),
            ttl,
            timeout,
            pending,
        };
        (cache, rx)
    }

    /// Hostname for display, never waiting on the network.
    ///
    /// Local addresses are not looked up. A cache miss queues the address for
    /// the background resolver and reports it as pending.
    pub fn label(&self, ip: &IpAddr) -> String {
        if is_local(ip) {
            return LOCAL_LABEL.to_string();
        }
        if let Some(entry) = self.cache.get(ip) {
            if Instant::now() < entry.expires_at {
                return entry
                    .hostname
                    .clone()
                    .unwrap_or_else(|| UNRESOLVED_LABEL.to_string());
            }
        }
        let _ = self.pending.try_send(*ip);
        PENDING_LABEL.to_string()
    }

    /// Resolve an address to a hostname.
    ///
    /// Returns `None` when the address cannot be resolved or the lookup
    /// times out. Results (including failures) are cached.
    pub async fn resolve(&self, ip: IpAddr) -> Option<String> {
        // Fast path: cache hit & still fresh.
        if let Some(entry) = self.cache.get(&ip) {
            if Instant::now() < entry.expires_at {
                return entry.hostname.clone();
            }
        }

        // Slow path: perform the reverse lookup (blocking, via spawn_blocking)
        // with a timeout to prevent stalls.
        let result = tokio::time::timeout(self.timeout, async move {
            tokio::task::spawn_blocking(move || dns_lookup::lookup_addr(&ip).ok())
                .await
                .unwrap_or(None)
        })
        .await
        .unwrap_or(None);

        // If the resolved hostname is just the IP address echoed back, treat
        // it as a failed lookup.
        let ip_str = ip.to_string();
        let hostname = result.filter(|h| *h != ip_str);

        self.cache.insert(
            ip,
            CacheEntry {
                hostname: hostname.clone(),
                expires_at: Instant::now() + self.ttl,
            },
        );

        hostname
    }

    /// Resolve queued addresses in the background, skipping fresh entries.
    pub async fn run_resolver(self: Arc<Self>, mut rx: mpsc::Receiver<IpAddr>) {
        while let Some(ip) = rx.recv().await {
            let fresh = self
                .cache
                .get(&ip)
                .is_some_and(|entry| Instant::now() < entry.expires_at);
            if !fresh {
                let hostname = self.resolve(ip).await;
                tracing::debug!("reverse lookup {} -> {:?}", ip, hostname);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> (DnsCache, mpsc::Receiver<IpAddr>) {
        DnsCache::new(Duration::from_secs(300), Duration::from_secs(2), 16)
    }

    #[tokio::test]
    async fn test_cache_stores_result() {
        let (cache, _rx) = cache();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        // Whether it resolves or not, a second call must return the cached value.
        let first = cache.resolve(ip).await;
        let second = cache.resolve(ip).await;
        assert_eq!(first, second);

        // The cache should now contain exactly one entry.
        assert_eq!(cache.cache.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_is_cached() {
        let (cache, _rx) = cache();

        // RFC 5737 TEST-NET: 192.0.2.1 has no PTR record on any real resolver.
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(cache.resolve(ip).await, None);

        // The failed lookup should still be cached and labelled as such.
        assert!(cache.cache.contains_key(&ip));
        assert_eq!(cache.label(&ip), UNRESOLVED_LABEL);
    }

    #[tokio::test]
    async fn test_local_addresses_are_not_queued() {
        let (cache, mut rx) = cache();
        assert_eq!(cache.label(&"10.0.0.1".parse().unwrap()), LOCAL_LABEL);
        assert_eq!(cache.label(&"::1".parse().unwrap()), LOCAL_LABEL);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_miss_is_queued_for_resolver() {
        let (cache, mut rx) = cache();
        let ip: IpAddr = "192.0.2.7".parse().unwrap();
        assert_eq!(cache.label(&ip), PENDING_LABEL);
        assert_eq!(rx.try_recv().ok(), Some(ip));
    }

    #[tokio::test]
    async fn test_full_queue_does_not_block() {
        let (cache, _rx) = DnsCache::new(Duration::from_secs(300), Duration::from_secs(2), 1);
        for last in 1..=5u8 {
            let ip = IpAddr::from([192, 0, 2, last]);
            assert_eq!(cache.label(&ip), PENDING_LABEL);
        }
    }
}
