//! Domain types for the dbgrid metadata store.
//!
//! These types describe one logical database's replica set and the
//! advertised capacity of each known peer. All of them cross the wire
//! inside gossip messages, so they are serde-serializable.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::error::{StateError, StateResult};

/// Identity of a peer on the message bus.
pub type PeerId = String;

// ── Database ──────────────────────────────────────────────────────

/// Lifecycle status of a database's replica set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatabaseStatus {
    Creating,
    Active,
    Idle,
    Hibernating,
    Hibernated,
    Waking,
    Failed,
}

impl DatabaseStatus {
    /// Precedence used when two concurrent updates disagree on status.
    ///
    /// `creating < waking < hibernating < hibernated < idle < active < failed`
    pub fn merge_rank(self) -> u8 {
        match self {
            DatabaseStatus::Creating => 0,
            DatabaseStatus::Waking => 1,
            DatabaseStatus::Hibernating => 2,
            DatabaseStatus::Hibernated => 3,
            DatabaseStatus::Idle => 4,
            DatabaseStatus::Active => 5,
            DatabaseStatus::Failed => 6,
        }
    }

    /// Whether the database's engines are (or should be) running.
    pub fn is_serving(self) -> bool {
        matches!(self, DatabaseStatus::Active | DatabaseStatus::Idle)
    }
}

impl fmt::Display for DatabaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DatabaseStatus::Creating => "creating",
            DatabaseStatus::Active => "active",
            DatabaseStatus::Idle => "idle",
            DatabaseStatus::Hibernating => "hibernating",
            DatabaseStatus::Hibernated => "hibernated",
            DatabaseStatus::Waking => "waking",
            DatabaseStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Where one member serves its replica.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MemberEndpoint {
    pub host: String,
    pub http_port: u16,
    pub raft_port: u16,
}

impl MemberEndpoint {
    pub fn new(host: impl Into<String>, http_port: u16, raft_port: u16) -> Self {
        Self {
            host: host.into(),
            http_port,
            raft_port,
        }
    }

    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.host, self.http_port)
    }

    pub fn raft_addr(&self) -> String {
        format!("{}:{}", self.host, self.raft_port)
    }
}

/// Cluster-wide record for one logical database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseRecord {
    pub name: String,
    pub status: DatabaseStatus,
    /// Peer → endpoint. Never larger than `replication_factor`.
    pub members: BTreeMap<PeerId, MemberEndpoint>,
    pub replication_factor: u32,
    /// Unix millis of the last query seen by any member.
    pub last_query_at: u64,
    pub clock: VectorClock,
    /// Unix millis at creation.
    pub created_at: u64,
    /// Peers replaced out of this record. A concurrent merge never
    /// brings them back.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub removed: BTreeSet<PeerId>,
}

impl DatabaseRecord {
    /// A fresh record with an empty clock; the store stamps it on `set`.
    pub fn new(
        name: impl Into<String>,
        replication_factor: u32,
        members: BTreeMap<PeerId, MemberEndpoint>,
    ) -> Self {
        let now = epoch_millis();
        Self {
            name: name.into(),
            status: DatabaseStatus::Creating,
            members,
            replication_factor,
            last_query_at: now,
            clock: VectorClock::new(),
            created_at: now,
            removed: BTreeSet::new(),
        }
    }

    /// Swap `failed` for `replacement`, leaving a tombstone for `failed`.
    pub fn replace_member(&mut self, failed: &str, replacement: PeerId, endpoint: MemberEndpoint) {
        self.members.remove(failed);
        self.removed.insert(failed.to_string());
        self.removed.remove(&replacement);
        self.members.insert(replacement, endpoint);
    }

    pub fn is_member(&self, peer: &str) -> bool {
        self.members.contains_key(peer)
    }

    pub fn member_ids(&self) -> Vec<PeerId> {
        self.members.keys().cloned().collect()
    }

    /// Milliseconds since the last recorded query.
    pub fn idle_for_millis(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_query_at)
    }

    /// Check the invariants every stored record must satisfy.
    pub fn validate(&self) -> StateResult<()> {
        validate_database_name(&self.name)?;
        if self.members.len() > self.replication_factor as usize {
            return Err(StateError::TooManyMembers {
                name: self.name.clone(),
                members: self.members.len(),
                replication_factor: self.replication_factor,
            });
        }
        Ok(())
    }
}

// ── Node ──────────────────────────────────────────────────────────

/// Advertised capacity of a peer, refreshed by its heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeCapacity {
    pub peer_id: PeerId,
    /// Host the peer's engines are reachable on.
    pub address: String,
    pub max_databases: u32,
    pub current_databases: u32,
    /// Unix millis of the heartbeat that produced this entry.
    pub last_heartbeat_at: u64,
}

impl NodeCapacity {
    pub fn has_capacity(&self) -> bool {
        self.current_databases < self.max_databases
    }
}

// ── Helpers ───────────────────────────────────────────────────────

static NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]{0,127}$").expect("database name pattern compiles")
});

/// Database names double as data-directory names, so they are restricted
/// to a filesystem-safe alphabet.
pub fn validate_database_name(name: &str) -> StateResult<()> {
    if NAME_PATTERN.is_match(name) {
        Ok(())
    } else {
        Err(StateError::InvalidName(name.to_string()))
    }
}

/// Current unix time in milliseconds.
pub fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_rank_order() {
        use DatabaseStatus::*;
        let ordered = [Creating, Waking, Hibernating, Hibernated, Idle, Active, Failed];
        for pair in ordered.windows(2) {
            assert!(pair[0].merge_rank() < pair[1].merge_rank(), "{pair:?}");
        }
    }

    #[test]
    fn status_serializes_snake_case() {
        let json = serde_json::to_string(&DatabaseStatus::Hibernated).unwrap();
        assert_eq!(json, "\"hibernated\"");
        assert_eq!(DatabaseStatus::Waking.to_string(), "waking");
    }

    #[test]
    fn name_validation() {
        for ok in ["orders", "app1_orders", "a.b-c", "X"] {
            validate_database_name(ok).unwrap();
        }
        for bad in ["", "../etc", "has space", "-leading", "a/b", &"x".repeat(129)] {
            assert!(validate_database_name(bad).is_err(), "{bad:?}");
        }
    }

    #[test]
    fn record_validate_bounds_members() {
        let mut members = BTreeMap::new();
        members.insert("a".to_string(), MemberEndpoint::new("h", 1, 2));
        members.insert("b".to_string(), MemberEndpoint::new("h", 3, 4));
        let record = DatabaseRecord::new("orders", 1, members);
        assert!(matches!(
            record.validate(),
            Err(StateError::TooManyMembers { members: 2, .. })
        ));
    }

    #[test]
    fn endpoint_addresses() {
        let ep = MemberEndpoint::new("10.0.0.1", 5001, 7001);
        assert_eq!(ep.http_addr(), "10.0.0.1:5001");
        assert_eq!(ep.raft_addr(), "10.0.0.1:7001");
    }

    #[test]
    fn capacity_check() {
        let mut cap = NodeCapacity {
            peer_id: "a".into(),
            address: "127.0.0.1".into(),
            max_databases: 2,
            current_databases: 1,
            last_heartbeat_at: 0,
        };
        assert!(cap.has_capacity());
        cap.current_databases = 2;
        assert!(!cap.has_capacity());
    }
}
