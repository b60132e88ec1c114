use clap::Parser;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use aya::maps::{MapData, RingBuf};

mod api;
mod classify;
mod config;
mod dns;
mod filter;
mod loader;
mod names;
mod record;
mod state;
mod storage;

use config::{CliArgs, Config};
use names::InterfaceNames;
use record::PacketRecord;
use state::TrafficState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = CliArgs::parse();

    // Load config from file if provided, otherwise use defaults.
    let mut config = if let Some(ref config_path) = cli.config {
        Config::from_file(Path::new(config_path))?
    } else {
        Config::default()
    };
    config.merge_cli(&cli);

    // Logging.
    if config.quiet {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new("error"))
            .with(tracing_subscriber::fmt::layer())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(tracing_subscriber::EnvFilter::new(
                std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
            ))
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    // ── eBPF setup ────────────────────────────────────────────────────
    let mut observer = loader::Observer::load(Path::new(&config.ebpf_object), config.kernel_trace)?;
    observer.attach(Path::new(&config.cgroup_path))?;
    let ring_buf = observer.take_ring()?;

    // ── Shutdown ──────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    ctrlc::set_handler(move || {
        let _ = shutdown_tx.send(true);
    })?;

    // ── Channels ──────────────────────────────────────────────────────
    let (tx, rx) = mpsc::channel::<PacketRecord>(config.queue_capacity);

    // ── State & Storage ───────────────────────────────────────────────
    let traffic_state = Arc::new(
        TrafficState::new(config.max_recent_events).with_max_aggregates(config.max_aggregates),
    );
    let storage = Arc::new(storage::Storage::new(&config.db_path)?);

    // ── Storage Writer Task ───────────────────────────────────────────
    let storage_clone = storage.clone();
    let writer = tokio::spawn(async move {
        storage_clone.run_writer(rx).await;
    });

    // ── Data Retention Task ───────────────────────────────────────────
    if let Some(retention_seconds) = config.data_retention_seconds {
        let storage_retention = storage.clone();
        tokio::spawn(async move {
            let mut retention_interval = interval(Duration::from_secs(60));
            loop {
                retention_interval.tick().await;
                match storage_retention.delete_old_data(retention_seconds) {
                    Ok(deleted) if deleted > 0 => {
                        tracing::info!("Data retention: deleted {} old events", deleted);
                    }
                    Err(e) => {
                        tracing::error!("Data retention cleanup failed: {}", e);
                    }
                    _ => {}
                }
            }
        });
    }

    // ── Aggregate Expiry Task ─────────────────────────────────────────
    if config.aggregate_idle_seconds > 0 {
        let traffic_state_expiry = traffic_state.clone();
        let idle_ms = config.aggregate_idle_seconds as i64 * 1000;
        tokio::spawn(async move {
            let mut expiry_interval = interval(Duration::from_secs(60));
            loop {
                expiry_interval.tick().await;
                let cutoff = chrono::Utc::now().timestamp_millis() - idle_ms;
                let expired = traffic_state_expiry.expire_idle(cutoff);
                if expired > 0 {
                    tracing::debug!("Expired {} idle aggregates", expired);
                }
            }
        });
    }

    // ── DNS Cache (optional) ──────────────────────────────────────────
    let dns_cache = if config.resolve_dns {
        tracing::info!("Reverse DNS resolution enabled");
        let (cache, pending) =
            dns::DnsCache::new(Duration::from_secs(300), Duration::from_secs(2), 1024);
        let cache = Arc::new(cache);
        tokio::spawn(cache.clone().run_resolver(pending));
        Some(cache)
    } else {
        None
    };

    // ── RingBuf Poller ────────────────────────────────────────────────
    let poller = tokio::spawn(poll_ring_buf(
        ring_buf,
        tx,
        traffic_state.clone(),
        shutdown_rx.clone(),
    ));

    // ── HTTP API ──────────────────────────────────────────────────────
    let app_state = Arc::new(api::AppState {
        traffic: traffic_state.clone(),
        storage: storage.clone(),
        dns: dns_cache,
        start_time: std::time::Instant::now(),
        hide_local: config.hide_local,
    });

    let allowed_ips = config.allowed_ips.clone();
    let app = api::router(app_state, &allowed_ips);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!("Server running on http://0.0.0.0:{}", config.port);
    let mut server_shutdown = shutdown_rx;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = server_shutdown.wait_for(|stop| *stop).await;
    })
    .await?;

    // ── Teardown ──────────────────────────────────────────────────────
    tracing::info!("Shutting down...");
    poller.await?;
    writer.await?;
    observer.unload();

    tracing::info!(
        "Observed {} packets ({} bytes), {} malformed, {} dropped from the storage queue, {} lost to storage errors",
        traffic_state.total_packets.load(Ordering::Relaxed),
        traffic_state.total_bytes.load(Ordering::Relaxed),
        traffic_state.malformed.load(Ordering::Relaxed),
        traffic_state.queue_drops.load(Ordering::Relaxed),
        storage.failed_rows(),
    );
    Ok(())
}

/// Continuously poll the ring buffer until shutdown, feeding every sample to
/// [`ingest`]. The storage sender is dropped on return so the writer drains.
async fn poll_ring_buf(
    mut ring_buf: RingBuf<MapData>,
    tx: mpsc::Sender<PacketRecord>,
    traffic_state: Arc<TrafficState>,
    shutdown: watch::Receiver<bool>,
) {
    let ifnames = InterfaceNames::new();

    while !*shutdown.borrow() {
        while let Some(item) = ring_buf.next() {
            ingest(&item, &traffic_state, &ifnames, &tx);
        }

        // Yield briefly to avoid busy-spinning when the ring buffer is empty.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Decode one sample into live state and queue it for storage without waiting.
fn ingest(
    sample: &[u8],
    traffic_state: &TrafficState,
    ifnames: &InterfaceNames,
    tx: &mpsc::Sender<PacketRecord>,
) {
    let Some(event) = record::decode(sample) else {
        let seen = traffic_state.malformed.fetch_add(1, Ordering::Relaxed);
        if seen == 0 {
            tracing::warn!("Skipping malformed ring buffer sample ({} bytes)", sample.len());
        }
        return;
    };

    let record = PacketRecord::from_event(&event, ifnames.name(event.ifindex));
    traffic_state.update(&event, &record);
    if tx.try_send(record).is_err() {
        traffic_state.queue_drops.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::tests::v4_event;
    use ionet_common::TRAFFIC_EVENT_LEN;

    fn sample(ev: &ionet_common::TrafficEvent) -> Vec<u8> {
        // SAFETY: the record is plain packed data of TRAFFIC_EVENT_LEN bytes.
        let bytes = unsafe {
            std::slice::from_raw_parts(ev as *const _ as *const u8, TRAFFIC_EVENT_LEN)
        };
        bytes.to_vec()
    }

    #[test]
    fn test_ingest_counts_malformed_and_drops() {
        let state = TrafficState::new(10);
        let ifnames = InterfaceNames::new();
        let (tx, mut rx) = mpsc::channel(1);
        let ev = v4_event(b'o', [10, 0, 0, 2], [1, 1, 1, 1], 40000, 443);

        ingest(&sample(&ev), &state, &ifnames, &tx);
        ingest(&sample(&ev), &state, &ifnames, &tx);
        ingest(&[0u8; 10], &state, &ifnames, &tx);

        assert_eq!(state.total_packets.load(Ordering::Relaxed), 2);
        assert_eq!(state.malformed.load(Ordering::Relaxed), 1);
        assert_eq!(state.queue_drops.load(Ordering::Relaxed), 1);
        assert_eq!(state.recent_len(), 2);

        let queued = rx.try_recv().unwrap();
        assert_eq!(queued.dst_port, 443);
        assert!(rx.try_recv().is_err());
    }
}
