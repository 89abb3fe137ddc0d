//! dbgrid.toml configuration parser.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::duration::human;
use crate::error::{ConfigError, ConfigResult};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub node: NodeConfig,
    pub database: DatabaseConfig,
    pub timing: TimingConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity of this peer on the message bus.
    pub peer_id: String,
    /// Host other members use to reach this node's database engines.
    pub advertise_host: String,
    /// Root for the metadata journal and per-database data directories.
    pub data_dir: PathBuf,
    /// Upper bound on database instances hosted by this node.
    pub max_databases: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub replication_factor: u32,
    /// Inactivity after which a database hibernates. Zero disables hibernation.
    #[serde(with = "human")]
    pub hibernation_timeout: Duration,
    #[serde(with = "human")]
    pub idle_check_interval: Duration,
    pub http_port_range: PortRange,
    pub raft_port_range: PortRange,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Cadence of the metadata digest gossip.
    #[serde(with = "human")]
    pub discovery_interval: Duration,
    #[serde(with = "human")]
    pub health_check_interval: Duration,
    /// Consecutive missed health checks before a peer is unhealthy.
    pub unhealthy_threshold: u32,
    #[serde(with = "human")]
    pub create_offer_timeout: Duration,
    #[serde(with = "human")]
    pub create_completion_timeout: Duration,
    #[serde(with = "human")]
    pub wake_timeout: Duration,
    #[serde(with = "human")]
    pub replacement_timeout: Duration,
    #[serde(with = "human")]
    pub instance_start_timeout: Duration,
    /// How long a starting node waits for peers' metadata before reconciling.
    #[serde(with = "human")]
    pub startup_sync_window: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub binary: String,
    pub extra_args: Vec<String>,
    #[serde(with = "human")]
    pub stop_grace: Duration,
    /// HTTP path probed to decide that an engine is up.
    pub status_path: String,
}

/// Inclusive port range, written as `[start, end]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[u16; 2]", into = "[u16; 2]")]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Number of ports in the range (zero if inverted).
    pub fn len(&self) -> usize {
        if self.end < self.start {
            0
        } else {
            usize::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn overlaps(&self, other: &PortRange) -> bool {
        !self.is_empty() && !other.is_empty() && self.start <= other.end && other.start <= self.end
    }

    pub fn iter(&self) -> std::ops::RangeInclusive<u16> {
        self.start..=self.end
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl From<[u16; 2]> for PortRange {
    fn from([start, end]: [u16; 2]) -> Self {
        Self { start, end }
    }
}

impl From<PortRange> for [u16; 2] {
    fn from(range: PortRange) -> Self {
        [range.start, range.end]
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            peer_id: String::new(),
            advertise_host: "127.0.0.1".to_string(),
            data_dir: PathBuf::from("/var/lib/dbgrid"),
            max_databases: 100,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            replication_factor: 3,
            hibernation_timeout: Duration::from_secs(60),
            idle_check_interval: Duration::from_secs(5),
            http_port_range: PortRange::new(5001, 5999),
            raft_port_range: PortRange::new(7001, 7999),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            discovery_interval: Duration::from_secs(15),
            health_check_interval: Duration::from_secs(10),
            unhealthy_threshold: 3,
            create_offer_timeout: Duration::from_secs(2),
            create_completion_timeout: Duration::from_secs(10),
            wake_timeout: Duration::from_secs(8),
            replacement_timeout: Duration::from_secs(10),
            instance_start_timeout: Duration::from_secs(8),
            startup_sync_window: Duration::from_secs(2),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "rqlited".to_string(),
            extra_args: Vec::new(),
            stop_grace: Duration::from_secs(10),
            status_path: "/status".to_string(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> ConfigResult<Self> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        toml::to_string(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the cross-field constraints serde cannot express.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.node.peer_id.trim().is_empty() {
            return Err(ConfigError::Invalid("node.peer_id must be set".into()));
        }
        if self.database.replication_factor == 0 {
            return Err(ConfigError::Invalid(
                "database.replication_factor must be at least 1".into(),
            ));
        }
        if self.node.max_databases == 0 {
            return Err(ConfigError::Invalid(
                "node.max_databases must be at least 1".into(),
            ));
        }

        let http = self.database.http_port_range;
        let raft = self.database.raft_port_range;
        for (name, range) in [("http_port_range", http), ("raft_port_range", raft)] {
            if range.is_empty() || range.start == 0 {
                return Err(ConfigError::Invalid(format!(
                    "database.{name} [{}, {}] is empty or starts at 0",
                    range.start, range.end
                )));
            }
        }
        if http.overlaps(&raft) {
            return Err(ConfigError::Invalid(
                "database.http_port_range and database.raft_port_range overlap".into(),
            ));
        }

        if self.timing.unhealthy_threshold == 0 {
            return Err(ConfigError::Invalid(
                "timing.unhealthy_threshold must be at least 1".into(),
            ));
        }
        for (name, d) in [
            ("database.idle_check_interval", self.database.idle_check_interval),
            ("timing.discovery_interval", self.timing.discovery_interval),
            ("timing.health_check_interval", self.timing.health_check_interval),
        ] {
            if d.is_zero() {
                return Err(ConfigError::Invalid(format!("{name} must be non-zero")));
            }
        }
        Ok(())
    }

    pub fn hibernation_enabled(&self) -> bool {
        !self.database.hibernation_timeout.is_zero()
    }

    /// Directory holding one subdirectory per hosted database.
    pub fn databases_dir(&self) -> PathBuf {
        self.node.data_dir.join("databases")
    }

    /// Path of the metadata journal.
    pub fn journal_path(&self) -> PathBuf {
        self.node.data_dir.join("metadata.redb")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(peer: &str) -> Config {
        let mut config = Config::default();
        config.node.peer_id = peer.to_string();
        config
    }

    #[test]
    fn empty_file_yields_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.database.replication_factor, 3);
        assert_eq!(config.timing.unhealthy_threshold, 3);
        assert_eq!(config.database.hibernation_timeout, Duration::from_secs(60));
        assert_eq!(config.database.http_port_range, PortRange::new(5001, 5999));
        assert_eq!(config.engine.binary, "rqlited");
    }

    #[test]
    fn parses_full_file() {
        let toml_str = r#"
[node]
peer_id = "peer-a"
advertise_host = "10.0.0.5"
data_dir = "/tmp/dbgrid"
max_databases = 12

[database]
replication_factor = 1
hibernation_timeout = "0"
http_port_range = [6000, 6009]
raft_port_range = [8000, 8009]

[timing]
discovery_interval = "500ms"
health_check_interval = "1s"
unhealthy_threshold = 5
"#;
        let config = Config::from_toml(toml_str).unwrap();
        assert_eq!(config.node.peer_id, "peer-a");
        assert_eq!(config.node.max_databases, 12);
        assert_eq!(config.database.replication_factor, 1);
        assert!(!config.hibernation_enabled());
        assert_eq!(config.database.http_port_range.len(), 10);
        assert_eq!(config.timing.discovery_interval, Duration::from_millis(500));
        assert_eq!(config.timing.unhealthy_threshold, 5);
        // Untouched sections keep defaults.
        assert_eq!(config.timing.wake_timeout, Duration::from_secs(8));
        config.validate().unwrap();
    }

    #[test]
    fn rejects_bad_duration() {
        let err = Config::from_toml("[database]\nhibernation_timeout = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn validate_requires_peer_id() {
        assert!(Config::default().validate().is_err());
        named("peer-a").validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_replication() {
        let mut config = named("peer-a");
        config.database.replication_factor = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_overlapping_ranges() {
        let mut config = named("peer-a");
        config.database.http_port_range = PortRange::new(7000, 7100);
        assert!(config.validate().is_err());

        config.database.http_port_range = PortRange::new(9000, 8000);
        assert!(config.validate().is_err());
    }

    #[test]
    fn toml_roundtrip_keeps_human_durations() {
        let config = named("peer-a");
        let text = config.to_toml_string().unwrap();
        assert!(text.contains("hibernation_timeout = \"1m\""));
        let back = Config::from_toml(&text).unwrap();
        assert_eq!(back.node.peer_id, "peer-a");
        assert_eq!(back.database.http_port_range, PortRange::new(5001, 5999));
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbgrid.toml");
        std::fs::write(&path, "[node]\npeer_id = \"peer-z\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.node.peer_id, "peer-z");
        assert_eq!(config.journal_path(), PathBuf::from("/var/lib/dbgrid/metadata.redb"));
    }

    #[test]
    fn port_range_helpers() {
        let range = PortRange::new(10, 12);
        assert_eq!(range.len(), 3);
        assert!(range.contains(12));
        assert!(!range.contains(13));
        assert_eq!(range.iter().collect::<Vec<_>>(), vec![10, 11, 12]);
        assert!(range.overlaps(&PortRange::new(12, 20)));
        assert!(!range.overlaps(&PortRange::new(13, 20)));
    }
}
