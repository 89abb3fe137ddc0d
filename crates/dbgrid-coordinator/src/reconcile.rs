//! Startup reconciliation of on-disk data directories.
//!
//! Removes every directory under the databases root that this node has
//! no claim to: no record for the name, or a record that does not list
//! this node as a member. Nothing else is ever deleted.

use std::io;
use std::path::Path;

use tracing::{info, warn};

use dbgrid_state::MetadataStore;

/// Outcome of one reconciliation pass. Both lists are sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub kept: Vec<String>,
    pub removed: Vec<String>,
}

pub fn reconcile_data_dirs(databases_dir: &Path, store: &MetadataStore) -> io::Result<ReconcileReport> {
    let mut report = ReconcileReport::default();
    let entries = match std::fs::read_dir(databases_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e),
    };

    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let claimed = store
            .get(&name)
            .is_some_and(|r| r.is_member(store.local_peer()));
        if claimed {
            report.kept.push(name);
            continue;
        }

        match std::fs::remove_dir_all(entry.path()) {
            Ok(()) => {
                info!(database = %name, "removed unclaimed data directory");
                report.removed.push(name);
            }
            Err(e) => {
                warn!(database = %name, error = %e, "failed to remove unclaimed data directory");
                return Err(e);
            }
        }
    }

    report.kept.sort();
    report.removed.sort();
    Ok(report)
}
