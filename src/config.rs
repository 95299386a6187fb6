//! shardlog Configuration
//!
//! Configuration structures for a shardlog node: where its logs live, how
//! the WAL writer batches and syncs, and where it replicates from.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use crate::replication::{FeederFilter, FeederParam, FilterType};
use crate::replication::{FEEDER_CFG_BAD_ADDR, FEEDER_CFG_BAD_FILTER, FEEDER_CFG_BAD_VERSION};
use crate::state::{RoutingTable, MAX_SHARD};
use crate::wal::{WalPaths, WAL_PACK_MAX};

/// Main shardlog configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShardLogConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Write-Ahead Log configuration
    #[serde(default)]
    pub wal: WalConfig,

    /// Snapshot configuration
    #[serde(default)]
    pub snapshot: SnapshotConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier
    pub id: String,

    /// Data directory holding `wal/` and `snap/`
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Serve replicas on this address
    #[serde(default)]
    pub feeder_bind_address: Option<String>,

    /// Never accept local writes
    #[serde(default)]
    pub read_only: bool,

    /// Follow the local WAL directory instead of writing to it
    #[serde(default)]
    pub local_hot_standby: bool,

    /// Shard served by this node
    #[serde(default)]
    pub shard_id: u32,
}

/// Write-Ahead Log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalConfig {
    /// Rows per WAL file before rotation
    #[serde(default = "default_rows_per_file")]
    pub rows_per_file: usize,

    /// Use fsync for durability (slower but safer)
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Maximum rows in one pack
    #[serde(default = "default_pack_max_rows")]
    pub pack_max_rows: usize,

    /// Maximum encoded bytes in one pack
    #[serde(default = "default_pack_max_bytes")]
    pub pack_max_bytes: usize,

    /// Packs queued for the writer before submitters wait
    #[serde(default = "default_inbox_size")]
    pub inbox_size: usize,

    /// How often standbys rescan the WAL directory, in milliseconds
    #[serde(default = "default_rescan_delay_ms")]
    pub rescan_delay_ms: u64,
}

/// Snapshot configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// fsync snapshot files before renaming them
    #[serde(default = "default_true")]
    pub fsync: bool,

    /// Take a snapshot every N seconds while primary (0 = never)
    #[serde(default)]
    pub interval_secs: u64,
}

/// Replication configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Feeder to pull from, `host:port` or a name from `peers`
    #[serde(default)]
    pub feeder_addr: Option<String>,

    /// Filter applied by the feeder
    #[serde(default)]
    pub filter_name: Option<String>,

    /// Filter kind: `id`, `scripted` or `native`
    #[serde(default = "default_filter_type")]
    pub filter_type: String,

    /// Opaque filter argument
    #[serde(default)]
    pub filter_arg: Option<String>,

    /// Handshake version (1 or 2)
    #[serde(default = "default_handshake_version")]
    pub version: u32,

    /// Delay between reconnect attempts in milliseconds
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Refuse rows that skip SCNs instead of warning
    #[serde(default)]
    pub panic_on_scn_gap: bool,

    /// Write a run_crc checkpoint every N seconds while primary (0 = never)
    #[serde(default = "default_run_crc_interval_secs")]
    pub run_crc_interval_secs: u64,

    /// Named peers: name -> `host:port`
    #[serde(default)]
    pub peers: BTreeMap<String, String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log to file path (optional)
    pub file: Option<PathBuf>,
}

// Default value functions
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/shardlog")
}

fn default_rows_per_file() -> usize {
    50_000
}

fn default_pack_max_rows() -> usize {
    WAL_PACK_MAX
}

fn default_pack_max_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_inbox_size() -> usize {
    128
}

fn default_rescan_delay_ms() -> u64 {
    100
}

fn default_filter_type() -> String {
    "id".to_string()
}

fn default_handshake_version() -> u32 {
    2
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_run_crc_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            rows_per_file: default_rows_per_file(),
            fsync: true,
            pack_max_rows: default_pack_max_rows(),
            pack_max_bytes: default_pack_max_bytes(),
            inbox_size: default_inbox_size(),
            rescan_delay_ms: default_rescan_delay_ms(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            fsync: true,
            interval_secs: 0,
        }
    }
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            feeder_addr: None,
            filter_name: None,
            filter_type: default_filter_type(),
            filter_arg: None,
            version: default_handshake_version(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            panic_on_scn_gap: false,
            run_crc_interval_secs: default_run_crc_interval_secs(),
            peers: BTreeMap::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

impl ShardLogConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ShardLogConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: ShardLogConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.node.id.is_empty() {
            return Err(crate::Error::Config("node.id cannot be empty".into()));
        }

        if self.node.shard_id as usize >= MAX_SHARD {
            return Err(crate::Error::Config(format!(
                "node.shard_id must be below {}",
                MAX_SHARD
            )));
        }

        if self.wal.rows_per_file == 0 {
            return Err(crate::Error::Config("wal.rows_per_file must be positive".into()));
        }

        if self.wal.pack_max_rows == 0 || self.wal.pack_max_rows > WAL_PACK_MAX {
            return Err(crate::Error::Config(format!(
                "wal.pack_max_rows must be in 1..={}",
                WAL_PACK_MAX
            )));
        }

        if let Some(addr) = &self.node.feeder_bind_address {
            if addr.parse::<SocketAddr>().is_err() {
                return Err(crate::Error::Config(format!(
                    "node.feeder_bind_address {:?} is not a socket address",
                    addr
                )));
            }
        }

        if let Err(flags) = self.feeder_param() {
            return Err(crate::Error::Config(describe_feeder_flags(flags)));
        }

        Ok(())
    }

    /// Build the feeder parameters from `[replication]`.
    ///
    /// `Ok(None)` means no feeder is configured. `Err` carries the
    /// `FEEDER_CFG_BAD_*` bits for every problem found.
    pub fn feeder_param(&self) -> std::result::Result<Option<FeederParam>, u32> {
        let repl = &self.replication;
        let Some(feeder) = repl.feeder_addr.as_deref().filter(|a| !a.is_empty()) else {
            return Ok(None);
        };

        let mut flags = 0;

        let addr = self.resolve_addr(feeder);
        if addr.is_none() {
            flags |= FEEDER_CFG_BAD_ADDR;
        }

        let filter_type = match repl.filter_type.as_str() {
            "id" | "" => Some(FilterType::Id),
            "scripted" | "lua" => Some(FilterType::Scripted),
            "native" | "c" => Some(FilterType::Native),
            _ => None,
        };
        let name = repl.filter_name.clone().filter(|n| !n.is_empty());
        let arg = repl
            .filter_arg
            .as_ref()
            .map(|a| a.as_bytes().to_vec())
            .unwrap_or_default();

        match filter_type {
            None => flags |= FEEDER_CFG_BAD_FILTER,
            Some(FilterType::Scripted | FilterType::Native) if name.is_none() => {
                flags |= FEEDER_CFG_BAD_FILTER
            }
            _ => {}
        }
        if name
            .as_ref()
            .map_or(false, |n| n.len() >= crate::replication::FILTER_NAME_LEN)
        {
            flags |= FEEDER_CFG_BAD_FILTER;
        }

        match repl.version {
            1 => {
                // v1 only carries a filter name
                if filter_type != Some(FilterType::Id) || !arg.is_empty() {
                    flags |= FEEDER_CFG_BAD_VERSION;
                }
            }
            2 => {}
            _ => flags |= FEEDER_CFG_BAD_VERSION,
        }

        match (flags, addr, filter_type) {
            (0, Some(addr), Some(kind)) => Ok(Some(FeederParam {
                addr,
                ver: repl.version,
                filter: FeederFilter { kind, arg, name },
            })),
            _ => Err(flags),
        }
    }

    /// `host:port`, or a peer name from `[replication.peers]`
    pub fn resolve_addr(&self, addr: &str) -> Option<SocketAddr> {
        let addr = self
            .replication
            .peers
            .get(addr)
            .map(String::as_str)
            .unwrap_or(addr);
        addr.to_socket_addrs().ok()?.next()
    }

    /// Routing registry seeded from `[replication.peers]`.
    ///
    /// The shard is routed to the peer named by `feeder_addr`, or to this
    /// node when no feeder is configured. A feeder given as a plain address
    /// leaves the shard unrouted.
    pub fn routing_table(&self) -> crate::Result<RoutingTable> {
        let routing = RoutingTable::new(self.node.id.clone());
        for (name, addr) in &self.replication.peers {
            match self.resolve_addr(addr) {
                Some(resolved) => routing.add_peer(name.clone(), resolved),
                None => tracing::warn!("Peer {} has unresolvable address {:?}", name, addr),
            }
        }

        let owner = match self.replication.feeder_addr.as_deref().filter(|a| !a.is_empty()) {
            None => self.node.id.as_str(),
            Some(feeder) if routing.peer_addr(feeder).is_some() => feeder,
            Some(_) => return Ok(routing),
        };
        routing.update_rt(self.node.shard_id, owner, 0)?;
        Ok(routing)
    }

    /// Get the data directory layout
    pub fn paths(&self) -> WalPaths {
        WalPaths::new(&self.node.data_dir)
    }

    /// Get the WAL directory path
    pub fn wal_dir(&self) -> PathBuf {
        self.paths().wal_dir()
    }

    /// Get the snapshot directory path
    pub fn snap_dir(&self) -> PathBuf {
        self.paths().snap_dir()
    }

    /// Get WAL rescan delay as Duration
    pub fn rescan_delay(&self) -> Duration {
        Duration::from_millis(self.wal.rescan_delay_ms)
    }

    /// Get reconnect delay as Duration
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.replication.reconnect_delay_ms)
    }
}

fn describe_feeder_flags(flags: u32) -> String {
    let mut problems = Vec::new();
    if flags & FEEDER_CFG_BAD_ADDR != 0 {
        problems.push("bad replication.feeder_addr");
    }
    if flags & FEEDER_CFG_BAD_FILTER != 0 {
        problems.push("bad replication filter");
    }
    if flags & FEEDER_CFG_BAD_VERSION != 0 {
        problems.push("replication.version does not support this filter");
    }
    problems.join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[node]
id = "shard-1"
data_dir = "/var/lib/shardlog"
feeder_bind_address = "0.0.0.0:33034"

[wal]
rows_per_file = 1000
fsync = false

[replication]
feeder_addr = "primary"
filter_name = "even_keys"
filter_type = "native"
filter_arg = "k"

[replication.peers]
primary = "127.0.0.1:33034"
"#;

        let config = ShardLogConfig::from_str(toml).unwrap();
        assert_eq!(config.node.id, "shard-1");
        assert_eq!(config.wal.rows_per_file, 1000);
        assert_eq!(config.wal.pack_max_rows, WAL_PACK_MAX);
        assert_eq!(config.wal_dir(), PathBuf::from("/var/lib/shardlog/wal"));

        let param = config.feeder_param().unwrap().unwrap();
        assert_eq!(param.addr, "127.0.0.1:33034".parse().unwrap());
        assert_eq!(param.ver, 2);
        assert_eq!(param.filter.kind, FilterType::Native);
        assert_eq!(param.filter.name.as_deref(), Some("even_keys"));
        assert_eq!(param.filter.arg, b"k");
    }

    #[test]
    fn test_no_feeder() {
        let config = ShardLogConfig::from_str("[node]\nid = \"n\"\n").unwrap();
        assert!(config.feeder_param().unwrap().is_none());
        assert!(config.wal.fsync);
    }

    #[test]
    fn test_feeder_flags() {
        let mut config = ShardLogConfig::from_str("[node]\nid = \"n\"\n").unwrap();
        config.replication.feeder_addr = Some("not an address".into());
        config.replication.filter_type = "bogus".into();
        config.replication.version = 7;
        let flags = config.feeder_param().unwrap_err();
        assert_eq!(
            flags,
            FEEDER_CFG_BAD_ADDR | FEEDER_CFG_BAD_FILTER | FEEDER_CFG_BAD_VERSION
        );
        assert!(matches!(config.validate(), Err(crate::Error::Config(_))));

        // v1 handshake cannot carry filter arguments
        config.replication.feeder_addr = Some("127.0.0.1:1".into());
        config.replication.filter_type = "id".into();
        config.replication.filter_arg = Some("x".into());
        config.replication.version = 1;
        assert_eq!(config.feeder_param().unwrap_err(), FEEDER_CFG_BAD_VERSION);
    }

    #[test]
    fn test_routing_table() {
        let toml = r#"
[node]
id = "replica-1"
shard_id = 7

[replication]
feeder_addr = "primary"

[replication.peers]
primary = "127.0.0.1:33034"
"#;
        let config = ShardLogConfig::from_str(toml).unwrap();
        let routing = config.routing_table().unwrap();
        assert!(routing.is_replica_of_other(7));
        let param = routing.fill_feeder_param(7).unwrap();
        assert_eq!(param.addr, "127.0.0.1:33034".parse().unwrap());

        let config = ShardLogConfig::from_str("[node]\nid = \"n\"\nshard_id = 3\n").unwrap();
        let routing = config.routing_table().unwrap();
        assert!(routing.route(3).unwrap().local);
        assert!(routing.fill_feeder_param(3).is_none());
    }

    #[test]
    fn test_invalid_values() {
        assert!(ShardLogConfig::from_str("[node]\nid = \"\"\n").is_err());
        let zero_rows = "[node]\nid = \"n\"\n[wal]\nrows_per_file = 0\n";
        assert!(ShardLogConfig::from_str(zero_rows).is_err());
        assert!(matches!(
            ShardLogConfig::from_str("[node\n"),
            Err(crate::Error::ConfigParse(_))
        ));
    }
}
