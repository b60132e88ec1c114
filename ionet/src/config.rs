use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::state::DEFAULT_MAX_AGGREGATES;

const DEFAULT_EBPF_OBJECT: &str = "ionet-ebpf/target/bpfel-unknown-none/release/ionet";
const DEFAULT_CGROUP_PATH: &str = "/sys/fs/cgroup";

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Compiled kernel object holding `monitor_ingress` / `monitor_egress`.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: String,

    /// cgroup v2 directory both hooks attach to.
    #[serde(default = "default_cgroup_path")]
    pub cgroup_path: String,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// Data retention in seconds (None = keep forever).
    #[serde(default)]
    pub data_retention_seconds: Option<u64>,

    /// Capacity of the queue between the ring buffer reader and storage.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Number of recent events kept in memory for `/api/events`.
    #[serde(default = "default_max_recent_events")]
    pub max_recent_events: usize,

    /// Upper bound on distinct (remote ip, port, protocol) aggregates.
    #[serde(default = "default_max_aggregates")]
    pub max_aggregates: usize,

    /// Aggregates idle for longer than this are dropped (0 = keep forever).
    #[serde(default = "default_aggregate_idle_seconds")]
    pub aggregate_idle_seconds: u64,

    /// Hide loopback/private/multicast endpoints from listings.
    #[serde(default)]
    pub hide_local: bool,

    /// Enable reverse DNS resolution for aggregated endpoints.
    #[serde(default)]
    pub resolve_dns: bool,

    /// Forward kernel-side trace lines (needs a `trace` build of the eBPF object).
    #[serde(default)]
    pub kernel_trace: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_ebpf_object() -> String {
    DEFAULT_EBPF_OBJECT.to_string()
}

fn default_cgroup_path() -> String {
    DEFAULT_CGROUP_PATH.to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_db_path() -> String {
    "traffic.db".to_string()
}

fn default_queue_capacity() -> usize {
    1 << 20
}

fn default_max_recent_events() -> usize {
    3000
}

fn default_max_aggregates() -> usize {
    DEFAULT_MAX_AGGREGATES
}

fn default_aggregate_idle_seconds() -> u64 {
    600
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ebpf_object: default_ebpf_object(),
            cgroup_path: default_cgroup_path(),
            port: default_port(),
            db_path: default_db_path(),
            quiet: false,
            data_retention_seconds: None,
            queue_capacity: default_queue_capacity(),
            max_recent_events: default_max_recent_events(),
            max_aggregates: default_max_aggregates(),
            aggregate_idle_seconds: default_aggregate_idle_seconds(),
            hide_local: false,
            resolve_dns: false,
            kernel_trace: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        anyhow::ensure!(config.queue_capacity > 0, "queue_capacity must be positive");
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.ebpf_object != DEFAULT_EBPF_OBJECT {
            self.ebpf_object = cli.ebpf_object.clone();
        }
        if cli.cgroup_path != DEFAULT_CGROUP_PATH {
            self.cgroup_path = cli.cgroup_path.clone();
        }
        if cli.port != 3000 {
            self.port = cli.port;
        }
        if cli.db_path != "traffic.db" {
            self.db_path = cli.db_path.clone();
        }
        if cli.quiet {
            self.quiet = true;
        }
        if cli.data_retention.is_some() {
            self.data_retention_seconds = cli.data_retention;
        }
        if cli.queue_capacity != default_queue_capacity() && cli.queue_capacity > 0 {
            self.queue_capacity = cli.queue_capacity;
        }
        if cli.max_recent_events != default_max_recent_events() {
            self.max_recent_events = cli.max_recent_events;
        }
        if cli.max_aggregates != default_max_aggregates() {
            self.max_aggregates = cli.max_aggregates;
        }
        if cli.aggregate_idle_seconds != default_aggregate_idle_seconds() {
            self.aggregate_idle_seconds = cli.aggregate_idle_seconds;
        }
        if cli.hide_local {
            self.hide_local = true;
        }
        if cli.resolve_dns {
            self.resolve_dns = true;
        }
        if cli.kernel_trace {
            self.kernel_trace = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }
}

use clap::Parser;

/// ionet: per-packet traffic observer for a cgroup's network boundary
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Path to the compiled eBPF object.
    #[arg(long, default_value = DEFAULT_EBPF_OBJECT)]
    pub ebpf_object: String,

    /// cgroup v2 directory to attach the ingress/egress hooks to.
    #[arg(short = 'g', long, default_value = DEFAULT_CGROUP_PATH)]
    pub cgroup_path: String,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// SQLite database path.
    #[arg(long, default_value = "traffic.db")]
    pub db_path: String,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// Data retention in seconds (delete events older than this).
    #[arg(long)]
    pub data_retention: Option<u64>,

    /// Capacity of the in-process event queue; events are dropped when full.
    #[arg(long, default_value_t = 1 << 20)]
    pub queue_capacity: usize,

    /// Number of recent events kept in memory.
    #[arg(long, default_value_t = 3000)]
    pub max_recent_events: usize,

    /// Maximum number of distinct aggregates kept in memory.
    #[arg(long, default_value_t = DEFAULT_MAX_AGGREGATES)]
    pub max_aggregates: usize,

    /// Drop aggregates idle for this many seconds (0 = never).
    #[arg(long, default_value_t = 600)]
    pub aggregate_idle_seconds: u64,

    /// Hide local (loopback/private/multicast/link-local) endpoints.
    #[arg(long)]
    pub hide_local: bool,

    /// Enable reverse DNS resolution for aggregated endpoints.
    #[arg(long)]
    pub resolve_dns: bool,

    /// Forward kernel trace lines (requires the eBPF object built with `--features trace`).
    #[arg(long)]
    pub kernel_trace: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yaml_fills_in_defaults() {
        let config = Config::from_yaml("cgroup_path: /sys/fs/cgroup/app\nport: 8080\n").unwrap();
        assert_eq!(config.cgroup_path, "/sys/fs/cgroup/app");
        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, "traffic.db");
        assert_eq!(config.queue_capacity, 1 << 20);
        assert_eq!(config.max_recent_events, 3000);
        assert_eq!(config.max_aggregates, DEFAULT_MAX_AGGREGATES);
        assert_eq!(config.aggregate_idle_seconds, 600);
        assert!(!config.hide_local);
    }

    #[test]
    fn yaml_rejects_zero_queue() {
        assert!(Config::from_yaml("queue_capacity: 0\n").is_err());
    }

    #[test]
    fn cli_overrides_file_only_when_set() {
        let mut config =
            Config::from_yaml("port: 8080\nresolve_dns: true\ndb_path: /var/lib/ionet.db\n")
                .unwrap();
        let cli = CliArgs::parse_from(["ionet", "--hide-local", "-g", "/sys/fs/cgroup/web"]);
        config.merge_cli(&cli);

        assert_eq!(config.port, 8080);
        assert_eq!(config.db_path, "/var/lib/ionet.db");
        assert_eq!(config.cgroup_path, "/sys/fs/cgroup/web");
        assert!(config.resolve_dns);
        assert!(config.hide_local);
    }
}
