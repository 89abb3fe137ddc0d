//! Per-operation coordinator election.
//!
//! There is no standing leader. Each operation elects from the peers that
//! answered it, and every observer holding the same candidate set picks
//! the same winner.

use dbgrid_state::PeerId;

use crate::error::{ClusterError, ClusterResult};

/// Pick the lexicographically lowest identity.
pub fn elect<I, S>(candidates: I) -> ClusterResult<PeerId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    candidates
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .min()
        .ok_or(ClusterError::ElectionOnEmptySet)
}

/// The `n` lowest distinct identities, in ascending order.
pub fn select_lowest<I, S>(candidates: I, n: usize) -> Vec<PeerId>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut ids: Vec<PeerId> = candidates
        .into_iter()
        .map(|c| c.as_ref().to_string())
        .collect();
    ids.sort();
    ids.dedup();
    ids.truncate(n);
    ids
}
