//! Per-database events fed into collection windows.
//!
//! The dispatcher turns protocol messages into [`DbEvent`]s keyed by
//! database name. Each protocol step opens a window on that name and
//! filters what it needs with the helpers below.

use std::collections::BTreeSet;

use dbgrid_cluster::Window;
use dbgrid_state::{DatabaseStatus, MemberEndpoint, PeerId};

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum DbEvent {
    Offer {
        epoch: u64,
        peer: PeerId,
        endpoint: MemberEndpoint,
    },
    Status {
        peer: PeerId,
        status: DatabaseStatus,
        epoch: Option<u64>,
    },
    Idle {
        peer: PeerId,
    },
    /// A coordinator confirmed members for a creation attempt.
    Confirmed {
        epoch: u64,
        coordinator: PeerId,
    },
    Aborted {
        epoch: u64,
        coordinator: PeerId,
    },
    ReplacementOffer {
        failed_peer: PeerId,
        peer: PeerId,
        endpoint: MemberEndpoint,
    },
    /// The local copy of the record changed.
    Record {
        status: DatabaseStatus,
    },
}

pub(crate) type EventWindow = Window<String, DbEvent>;

/// Creation offers for `epoch`, first offer per peer, in arrival order.
pub(crate) fn offers(events: &[DbEvent], epoch: u64) -> Vec<(PeerId, MemberEndpoint)> {
    let mut seen = BTreeSet::new();
    events
        .iter()
        .filter_map(|e| match e {
            DbEvent::Offer {
                epoch: ep,
                peer,
                endpoint,
            } if *ep == epoch && seen.insert(peer.clone()) => Some((peer.clone(), endpoint.clone())),
            _ => None,
        })
        .collect()
}

pub(crate) fn offer_count(events: &[DbEvent], epoch: u64) -> usize {
    offers(events, epoch).len()
}

/// Peers that reported `status`. With `epoch` set, only reports tagged
/// with that creation attempt count.
pub(crate) fn reporters(events: &[DbEvent], status: DatabaseStatus, epoch: Option<u64>) -> BTreeSet<PeerId> {
    events
        .iter()
        .filter_map(|e| match e {
            DbEvent::Status {
                peer,
                status: s,
                epoch: ep,
            } if *s == status && (epoch.is_none() || *ep == epoch) => Some(peer.clone()),
            _ => None,
        })
        .collect()
}

pub(crate) fn idle_reporters(events: &[DbEvent]) -> BTreeSet<PeerId> {
    events
        .iter()
        .filter_map(|e| match e {
            DbEvent::Idle { peer } => Some(peer.clone()),
            _ => None,
        })
        .collect()
}

/// The coordinator whose confirm for `epoch` arrived first.
pub(crate) fn first_confirm(events: &[DbEvent], epoch: u64) -> Option<PeerId> {
    events.iter().find_map(|e| match e {
        DbEvent::Confirmed {
            epoch: ep,
            coordinator,
        } if *ep == epoch => Some(coordinator.clone()),
        _ => None,
    })
}

/// Whether `coordinator` aborted `epoch`.
pub(crate) fn aborted(events: &[DbEvent], epoch: u64, coordinator: &str) -> bool {
    events.iter().any(|e| {
        matches!(e, DbEvent::Aborted { epoch: ep, coordinator: c } if *ep == epoch && c == coordinator)
    })
}

/// Replacement offers for `failed_peer`, in arrival order.
pub(crate) fn replacement_offers(events: &[DbEvent], failed_peer: &str) -> Vec<(PeerId, MemberEndpoint)> {
    events
        .iter()
        .filter_map(|e| match e {
            DbEvent::ReplacementOffer {
                failed_peer: f,
                peer,
                endpoint,
            } if f == failed_peer => Some((peer.clone(), endpoint.clone())),
            _ => None,
        })
        .collect()
}

/// Whether every peer in `members` appears in `seen`.
pub(crate) fn covers<'a>(seen: &BTreeSet<PeerId>, members: impl IntoIterator<Item = &'a PeerId>) -> bool {
    members.into_iter().all(|m| seen.contains(m))
}
