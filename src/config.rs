//! Antler Configuration
//!
//! Configuration structures for an antler node: the embedded store,
//! the logical log, and the cluster/replication layer.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default port a node listens on for follower traffic
pub const DEFAULT_HA_PORT: u16 = 6361;

/// Default cluster name
pub const DEFAULT_CLUSTER_NAME: &str = "antler.ha";

/// Main antler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AntlerConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster configuration
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Store engine configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique machine identifier within the cluster
    pub machine_id: u32,

    /// Directory holding the store files and logical logs
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,

    /// Address this node serves followers on (host:port)
    #[serde(default)]
    pub ha_server: Option<String>,

    /// Open the store read-only; no transactions may be started
    #[serde(default)]
    pub read_only: bool,

    /// This node only receives updates and never participates in election
    #[serde(default)]
    pub backup_slave: bool,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Name of the cluster this node belongs to
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,

    /// Addresses of the coordination service members
    #[serde(default)]
    pub coordination_servers: Vec<String>,

    /// Interval at which a follower pulls committed updates ("10s", "500ms");
    /// absent means no background puller
    #[serde(default)]
    pub pull_interval: Option<String>,

    /// May this node initialize a brand-new cluster when the store is empty
    #[serde(default = "default_true")]
    pub allow_init_cluster: bool,

    /// Coordination session time-to-live in milliseconds
    #[serde(default = "default_session_ttl_ms")]
    pub session_ttl_ms: u64,

    /// RPC deadline in milliseconds
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// Retry budget for transient communication failures
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,

    /// Base backoff between retries in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Bound on a single role transition before the watchdog gives up, in seconds
    #[serde(default = "default_transition_timeout_secs")]
    pub transition_timeout_secs: u64,
}

/// Store engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Use memory-mapped buffers for record files; absent means auto-detect
    /// from the available address space
    #[serde(default)]
    pub use_memory_mapped_buffers: Option<bool>,

    /// Retain rotated logical logs instead of deleting them.
    /// Forced to true whenever the node runs in a cluster.
    #[serde(default)]
    pub keep_logical_logs: bool,

    /// Rotate the active logical log once it passes this size
    #[serde(default = "default_rotate_at_bytes")]
    pub rotate_at_bytes: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Also write the human log to <store_dir>/messages.log
    #[serde(default = "default_true")]
    pub messages_log: bool,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_cluster_name() -> String {
    DEFAULT_CLUSTER_NAME.to_string()
}

fn default_true() -> bool {
    true
}

fn default_session_ttl_ms() -> u64 {
    5_000
}

fn default_rpc_timeout_ms() -> u64 {
    20_000
}

fn default_retry_budget() -> u32 {
    10
}

fn default_retry_backoff_ms() -> u64 {
    100
}

fn default_transition_timeout_secs() -> u64 {
    120
}

fn default_rotate_at_bytes() -> u64 {
    10 * 1024 * 1024
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            coordination_servers: Vec::new(),
            pull_interval: None,
            allow_init_cluster: default_true(),
            session_ttl_ms: default_session_ttl_ms(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            retry_budget: default_retry_budget(),
            retry_backoff_ms: default_retry_backoff_ms(),
            transition_timeout_secs: default_transition_timeout_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            use_memory_mapped_buffers: None,
            keep_logical_logs: false,
            rotate_at_bytes: default_rotate_at_bytes(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            messages_log: true,
        }
    }
}

impl AntlerConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_toml(content: &str) -> crate::Result<Self> {
        let config: AntlerConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if let Some(addr) = &self.node.ha_server {
            if addr.parse::<std::net::SocketAddr>().is_err() && addr.rsplit_once(':').is_none() {
                return Err(crate::Error::Config(format!(
                    "node.ha_server is not a host:port address: {addr}"
                )));
            }
        }

        if let Some(interval) = &self.cluster.pull_interval {
            parse_duration(interval).map_err(crate::Error::Config)?;
        }

        if self.cluster.session_ttl_ms == 0 {
            return Err(crate::Error::Config(
                "cluster.session_ttl_ms cannot be zero".into(),
            ));
        }

        if self.node.read_only && self.cluster.allow_init_cluster {
            // A read-only node can never mint a store, so init makes no sense.
            tracing::warn!("read_only node with allow_init_cluster; init will be skipped");
        }

        Ok(())
    }

    /// Get the store directory path
    pub fn store_dir(&self) -> &PathBuf {
        &self.node.store_dir
    }

    /// The address this node serves followers on, or the default port on
    /// all interfaces when unset
    pub fn ha_server(&self) -> String {
        self.node
            .ha_server
            .clone()
            .unwrap_or_else(|| format!("0.0.0.0:{DEFAULT_HA_PORT}"))
    }

    /// Get the pull interval, if the background puller is enabled
    pub fn pull_interval(&self) -> Option<Duration> {
        self.cluster
            .pull_interval
            .as_deref()
            .and_then(|s| parse_duration(s).ok())
    }

    /// Get the RPC deadline as a Duration
    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.rpc_timeout_ms)
    }

    /// Get the coordination session TTL as a Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_millis(self.cluster.session_ttl_ms)
    }

    /// Get the role-transition watchdog bound as a Duration
    pub fn transition_timeout(&self) -> Duration {
        Duration::from_secs(self.cluster.transition_timeout_secs)
    }

    /// Whether this node runs as part of a cluster
    pub fn is_clustered(&self) -> bool {
        !self.cluster.coordination_servers.is_empty()
    }
}

/// Parse a duration string: "10s", "500ms", "2m", or a bare number of seconds
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    let (digits, unit) = match s.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => s.split_at(idx),
        None => (s, "s"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid duration: {s}"))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        other => Err(format!("unknown duration unit '{other}' in {s}")),
    }
}
