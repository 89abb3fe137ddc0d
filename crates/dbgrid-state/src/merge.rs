//! Field-level resolution for records updated concurrently on two peers.
//!
//! Applied only when the two clocks compare `Concurrent`. The result is a
//! pure, symmetric function of both inputs, so every peer that sees the
//! same pair converges on the same record without further coordination.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::types::{DatabaseRecord, MemberEndpoint, PeerId};

/// Merge two concurrent versions of the same record.
pub fn resolve_concurrent(local: &DatabaseRecord, remote: &DatabaseRecord) -> DatabaseRecord {
    let replication_factor = local.replication_factor.max(remote.replication_factor);

    let status = if remote.status.merge_rank() > local.status.merge_rank() {
        remote.status
    } else {
        local.status
    };

    let removed: BTreeSet<PeerId> = local.removed.union(&remote.removed).cloned().collect();

    DatabaseRecord {
        name: local.name.clone(),
        status,
        members: merge_members(local, remote, &removed, replication_factor),
        replication_factor,
        last_query_at: local.last_query_at.max(remote.last_query_at),
        clock: local.clock.merge(&remote.clock),
        created_at: local.created_at.min(remote.created_at),
        removed,
    }
}

/// Union of both member maps without tombstoned peers, keeping the lowest
/// `limit` peer identities.
///
/// A peer listed on both sides keeps the endpoint from the side whose clock
/// has seen more of that peer's own writes.
fn merge_members(
    local: &DatabaseRecord,
    remote: &DatabaseRecord,
    removed: &BTreeSet<PeerId>,
    limit: u32,
) -> BTreeMap<PeerId, MemberEndpoint> {
    let mut union: BTreeMap<PeerId, MemberEndpoint> = local.members.clone();

    for (peer, theirs) in &remote.members {
        match union.get(peer) {
            None => {
                union.insert(peer.clone(), theirs.clone());
            }
            Some(ours) if ours != theirs => {
                let pick_theirs = match remote.clock.get(peer).cmp(&local.clock.get(peer)) {
                    Ordering::Greater => true,
                    Ordering::Less => false,
                    Ordering::Equal => endpoint_key(theirs) > endpoint_key(ours),
                };
                if pick_theirs {
                    union.insert(peer.clone(), theirs.clone());
                }
            }
            Some(_) => {}
        }
    }

    union
        .into_iter()
        .filter(|(peer, _)| !removed.contains(peer))
        .take(limit as usize)
        .collect()
}

fn endpoint_key(ep: &MemberEndpoint) -> (u16, u16, &str) {
    (ep.http_port, ep.raft_port, ep.host.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VectorClock;
    use crate::types::DatabaseStatus;

    fn record(
        members: &[(&str, u16)],
        status: DatabaseStatus,
        clock: &[(&str, u64)],
        last_query_at: u64,
    ) -> DatabaseRecord {
        DatabaseRecord {
            name: "orders".into(),
            status,
            members: members
                .iter()
                .map(|&(p, port)| (p.to_string(), MemberEndpoint::new("h", port, port + 1000)))
                .collect(),
            replication_factor: 3,
            last_query_at,
            clock: clock.iter().map(|&(p, c)| (p, c)).collect::<VectorClock>(),
            created_at: last_query_at,
            removed: BTreeSet::new(),
        }
    }

    #[test]
    fn replaced_peer_stays_out_after_concurrent_update() {
        // "d" replaced failed "c"; meanwhile "a" touched the old version.
        let base = record(&[("a", 1), ("b", 2), ("c", 3)], DatabaseStatus::Active, &[("a", 1)], 10);
        let mut replaced = base.clone();
        replaced.replace_member("c", "d".into(), MemberEndpoint::new("h", 4, 1004));
        replaced.clock = replaced.clock.increment("b");
        let mut touched = base.clone();
        touched.last_query_at = 50;
        touched.clock = touched.clock.increment("a");

        for merged in [
            resolve_concurrent(&replaced, &touched),
            resolve_concurrent(&touched, &replaced),
        ] {
            assert_eq!(merged.member_ids(), vec!["a", "b", "d"]);
            assert!(merged.removed.contains("c"));
            assert_eq!(merged.last_query_at, 50);
        }
    }

    #[test]
    fn union_is_bounded_by_replication_factor() {
        let a = record(&[("b", 1), ("d", 2)], DatabaseStatus::Active, &[("b", 1)], 10);
        let b = record(&[("a", 3), ("c", 4)], DatabaseStatus::Active, &[("a", 1)], 20);
        let merged = resolve_concurrent(&a, &b);
        assert_eq!(merged.member_ids(), vec!["a", "b", "c"]);
    }

    #[test]
    fn takes_later_query_and_earlier_creation() {
        let a = record(&[("a", 1)], DatabaseStatus::Active, &[("a", 1)], 10);
        let b = record(&[("a", 1)], DatabaseStatus::Active, &[("b", 1)], 20);
        let merged = resolve_concurrent(&a, &b);
        assert_eq!(merged.last_query_at, 20);
        assert_eq!(merged.created_at, 10);
    }

    #[test]
    fn status_takes_higher_rank() {
        let a = record(&[], DatabaseStatus::Hibernated, &[("a", 1)], 0);
        let b = record(&[], DatabaseStatus::Waking, &[("b", 1)], 0);
        assert_eq!(resolve_concurrent(&a, &b).status, DatabaseStatus::Hibernated);
        assert_eq!(resolve_concurrent(&b, &a).status, DatabaseStatus::Hibernated);
    }

    #[test]
    fn clocks_are_merged() {
        let a = record(&[], DatabaseStatus::Active, &[("a", 2), ("b", 1)], 0);
        let b = record(&[], DatabaseStatus::Active, &[("a", 1), ("b", 3)], 0);
        let merged = resolve_concurrent(&a, &b);
        assert_eq!(merged.clock.get("a"), 2);
        assert_eq!(merged.clock.get("b"), 3);
    }

    #[test]
    fn peer_is_authoritative_for_its_own_endpoint() {
        // "a" moved to port 9 and stamped its own component.
        let moved = record(&[("a", 9)], DatabaseStatus::Active, &[("a", 2), ("b", 1)], 0);
        let stale = record(&[("a", 50)], DatabaseStatus::Active, &[("a", 1), ("b", 2)], 0);
        assert_eq!(resolve_concurrent(&moved, &stale).members["a"].http_port, 9);
        assert_eq!(resolve_concurrent(&stale, &moved).members["a"].http_port, 9);
    }

    #[test]
    fn resolution_is_symmetric() {
        let a = record(&[("a", 1), ("c", 5)], DatabaseStatus::Idle, &[("a", 3)], 100);
        let b = record(&[("b", 2), ("c", 6)], DatabaseStatus::Active, &[("b", 3)], 50);
        assert_eq!(resolve_concurrent(&a, &b), resolve_concurrent(&b, &a));
    }
}
