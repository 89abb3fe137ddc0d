//! Protocol messages exchanged over the bus.
//!
//! One closed enum covers every message kind. Payloads are JSON with a
//! `kind` tag, and each kind travels on exactly one [`Topic`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use dbgrid_state::{DatabaseRecord, DatabaseStatus, MemberEndpoint, NodeCapacity, PeerId};

use crate::error::{ClusterError, ClusterResult};

/// Logical channels on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Database creation handshake.
    Create,
    /// Member status reports, idle notifications, hibernation orders.
    Status,
    /// Wake requests for hibernated databases.
    Wakeup,
    /// Heartbeats and node replacement.
    Health,
    /// Record announcements and digest gossip.
    Metadata,
}

impl Topic {
    pub const ALL: [Topic; 5] = [
        Topic::Create,
        Topic::Status,
        Topic::Wakeup,
        Topic::Health,
        Topic::Metadata,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Topic::Create => "dbgrid/create",
            Topic::Status => "dbgrid/status",
            Topic::Wakeup => "dbgrid/wakeup",
            Topic::Health => "dbgrid/health",
            Topic::Metadata => "dbgrid/metadata",
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClusterMessage {
    // ── Creation ───────────────────────────────────────────────────
    /// Ask peers with spare capacity to host a new database.
    CreateRequest {
        database: String,
        replication_factor: u32,
        requester: PeerId,
        /// Correlates every reply to this attempt.
        epoch: u64,
    },
    /// A peer offers to host a replica on a tentatively reserved port pair.
    CreateResponse {
        database: String,
        epoch: u64,
        responder: PeerId,
        endpoint: MemberEndpoint,
    },
    /// The elected coordinator names the selected members.
    CreateConfirm {
        database: String,
        epoch: u64,
        coordinator: PeerId,
        members: BTreeMap<PeerId, MemberEndpoint>,
    },
    /// Too few members became active; started members tear down.
    CreateAbort {
        database: String,
        epoch: u64,
        coordinator: PeerId,
    },

    // ── Lifecycle ─────────────────────────────────────────────────
    StatusUpdate {
        database: String,
        reporter: PeerId,
        status: DatabaseStatus,
        /// Set when the report belongs to a creation attempt.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        epoch: Option<u64>,
    },
    IdleNotification {
        database: String,
        reporter: PeerId,
    },
    /// Every member is idle; members stop their engines.
    HibernateShutdown {
        database: String,
        coordinator: PeerId,
    },
    WakeupRequest {
        database: String,
        requester: PeerId,
    },

    // ── Health and replacement ────────────────────────────────────
    Heartbeat {
        capacity: NodeCapacity,
    },
    NodeReplacementNeeded {
        database: String,
        failed_peer: PeerId,
        requester: PeerId,
    },
    NodeReplacementOffer {
        database: String,
        failed_peer: PeerId,
        offerer: PeerId,
        endpoint: MemberEndpoint,
    },
    /// The originator accepted `replacement`'s offer.
    NodeReplacementConfirm {
        database: String,
        failed_peer: PeerId,
        replacement: PeerId,
        endpoint: MemberEndpoint,
        /// HTTP address of a surviving member to join through.
        join_address: String,
    },

    // ── Metadata gossip ───────────────────────────────────────────
    RecordAnnounce {
        record: DatabaseRecord,
    },
    MetadataDigest {
        from: PeerId,
        checksum: String,
        count: usize,
    },
    MetadataSyncRequest {
        requester: PeerId,
        target: PeerId,
    },
    MetadataSyncResponse {
        responder: PeerId,
        target: PeerId,
        records: Vec<DatabaseRecord>,
    },
}

impl ClusterMessage {
    /// The topic this kind is published on.
    pub fn topic(&self) -> Topic {
        use ClusterMessage::*;
        match self {
            CreateRequest { .. } | CreateResponse { .. } | CreateConfirm { .. } | CreateAbort { .. } => {
                Topic::Create
            }
            StatusUpdate { .. } | IdleNotification { .. } | HibernateShutdown { .. } => Topic::Status,
            WakeupRequest { .. } => Topic::Wakeup,
            Heartbeat { .. }
            | NodeReplacementNeeded { .. }
            | NodeReplacementOffer { .. }
            | NodeReplacementConfirm { .. } => Topic::Health,
            RecordAnnounce { .. }
            | MetadataDigest { .. }
            | MetadataSyncRequest { .. }
            | MetadataSyncResponse { .. } => Topic::Metadata,
        }
    }

    /// Stable name of the kind, as written in the `kind` tag.
    pub fn kind(&self) -> &'static str {
        use ClusterMessage::*;
        match self {
            CreateRequest { .. } => "create_request",
            CreateResponse { .. } => "create_response",
            CreateConfirm { .. } => "create_confirm",
            CreateAbort { .. } => "create_abort",
            StatusUpdate { .. } => "status_update",
            IdleNotification { .. } => "idle_notification",
            HibernateShutdown { .. } => "hibernate_shutdown",
            WakeupRequest { .. } => "wakeup_request",
            Heartbeat { .. } => "heartbeat",
            NodeReplacementNeeded { .. } => "node_replacement_needed",
            NodeReplacementOffer { .. } => "node_replacement_offer",
            NodeReplacementConfirm { .. } => "node_replacement_confirm",
            RecordAnnounce { .. } => "record_announce",
            MetadataDigest { .. } => "metadata_digest",
            MetadataSyncRequest { .. } => "metadata_sync_request",
            MetadataSyncResponse { .. } => "metadata_sync_response",
        }
    }

    /// The database this message concerns, if any.
    pub fn database(&self) -> Option<&str> {
        use ClusterMessage::*;
        match self {
            CreateRequest { database, .. }
            | CreateResponse { database, .. }
            | CreateConfirm { database, .. }
            | CreateAbort { database, .. }
            | StatusUpdate { database, .. }
            | IdleNotification { database, .. }
            | HibernateShutdown { database, .. }
            | WakeupRequest { database, .. }
            | NodeReplacementNeeded { database, .. }
            | NodeReplacementOffer { database, .. }
            | NodeReplacementConfirm { database, .. } => Some(database.as_str()),
            RecordAnnounce { record } => Some(record.name.as_str()),
            Heartbeat { .. }
            | MetadataDigest { .. }
            | MetadataSyncRequest { .. }
            | MetadataSyncResponse { .. } => None,
        }
    }

    pub fn encode(&self) -> ClusterResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| ClusterError::Encode(e.to_string()))
    }

    pub fn decode(payload: &[u8]) -> ClusterResult<Self> {
        serde_json::from_slice(payload).map_err(|e| ClusterError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_tag_on_the_wire() {
        let msg = ClusterMessage::IdleNotification {
            database: "orders".into(),
            reporter: "node-a".into(),
        };
        let json: serde_json::Value = serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["kind"], "idle_notification");
        assert_eq!(json["kind"], msg.kind());
        assert_eq!(json["database"], "orders");
    }

    #[test]
    fn status_update_omits_absent_epoch() {
        let msg = ClusterMessage::StatusUpdate {
            database: "orders".into(),
            reporter: "node-a".into(),
            status: DatabaseStatus::Active,
            epoch: None,
        };
        let text = String::from_utf8(msg.encode().unwrap().to_vec()).unwrap();
        assert!(!text.contains("epoch"));
        assert_eq!(ClusterMessage::decode(text.as_bytes()).unwrap(), msg);
    }

    #[test]
    fn decode_rejects_unknown_kind() {
        let err = ClusterMessage::decode(br#"{"kind":"launch_missiles"}"#).unwrap_err();
        assert!(matches!(err, ClusterError::Decode(_)));
        assert!(ClusterMessage::decode(b"not json").is_err());
    }

    #[test]
    fn topics_by_kind() {
        let confirm = ClusterMessage::CreateConfirm {
            database: "orders".into(),
            epoch: 7,
            coordinator: "a".into(),
            members: BTreeMap::new(),
        };
        assert_eq!(confirm.topic(), Topic::Create);
        assert_eq!(confirm.database(), Some("orders"));

        let wake = ClusterMessage::WakeupRequest {
            database: "orders".into(),
            requester: "a".into(),
        };
        assert_eq!(wake.topic(), Topic::Wakeup);

        let digest = ClusterMessage::MetadataDigest {
            from: "a".into(),
            checksum: String::new(),
            count: 0,
        };
        assert_eq!(digest.topic(), Topic::Metadata);
        assert_eq!(digest.database(), None);
    }

    #[test]
    fn topic_names_are_distinct() {
        let mut names: Vec<&str> = Topic::ALL.iter().map(|t| t.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), Topic::ALL.len());
    }
}
