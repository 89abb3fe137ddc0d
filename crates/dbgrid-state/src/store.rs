//! MetadataStore — the node-local replica of cluster metadata.
//!
//! Records live behind one mutex each, so churn on one database never
//! blocks reads or writes of another; the outer map lock is only taken
//! for writing when a name is first seen or deleted. Every local `set`
//! or `update` stamps the record's clock with this node's component.
//! Remote copies arrive through `merge`.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, info};

use crate::clock::ClockOrdering;
use crate::digest::records_digest;
use crate::error::StateResult;
use crate::journal::RecordJournal;
use crate::merge::resolve_concurrent;
use crate::types::*;

type Slot = Arc<Mutex<Option<DatabaseRecord>>>;

/// What `merge` did with an incoming record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// No local copy existed; the remote one was stored as-is.
    Inserted,
    /// The remote copy was causally newer and replaced ours.
    Replaced,
    /// The remote copy was causally older and was dropped.
    Discarded,
    /// Both copies carried the same clock.
    Unchanged,
    /// The copies were concurrent and were field-merged.
    Resolved,
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        matches!(
            self,
            MergeOutcome::Inserted | MergeOutcome::Replaced | MergeOutcome::Resolved
        )
    }
}

/// Thread-safe replicated metadata store.
#[derive(Clone)]
pub struct MetadataStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    local_peer: PeerId,
    records: RwLock<HashMap<String, Slot>>,
    capacities: RwLock<HashMap<PeerId, NodeCapacity>>,
    journal: Option<RecordJournal>,
}

impl MetadataStore {
    /// Create an empty, purely in-memory store.
    pub fn new(local_peer: impl Into<PeerId>) -> Self {
        Self::build(local_peer.into(), None)
    }

    /// Open a store backed by a journal at `path`, reloading its records.
    pub fn open(local_peer: impl Into<PeerId>, path: &Path) -> StateResult<Self> {
        let journal = RecordJournal::open(path)?;
        Self::with_journal(local_peer, journal)
    }

    /// Build a store on top of an already-open journal.
    pub fn with_journal(local_peer: impl Into<PeerId>, journal: RecordJournal) -> StateResult<Self> {
        let records = journal.load_all()?;
        let store = Self::build(local_peer.into(), Some(journal));
        {
            let mut map = store.inner.records.write().expect("records lock");
            for record in records {
                map.insert(record.name.clone(), Arc::new(Mutex::new(Some(record))));
            }
            info!(records = map.len(), "metadata store loaded from journal");
        }
        Ok(store)
    }

    fn build(local_peer: PeerId, journal: Option<RecordJournal>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                local_peer,
                records: RwLock::new(HashMap::new()),
                capacities: RwLock::new(HashMap::new()),
                journal,
            }),
        }
    }

    /// Identity whose clock component this store stamps.
    pub fn local_peer(&self) -> &str {
        &self.inner.local_peer
    }

    // ── Records ────────────────────────────────────────────────────

    pub fn get(&self, name: &str) -> Option<DatabaseRecord> {
        let slot = self.slot(name)?;
        let guard = slot.lock().expect("record lock");
        guard.clone()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Store a record, stamping its clock with this node's component.
    ///
    /// The stored clock also absorbs the clock of any copy already held, so
    /// a `set` built from a stale read still supersedes what it overwrites.
    pub fn set(&self, mut record: DatabaseRecord) -> StateResult<DatabaseRecord> {
        record.validate()?;
        let slot = self.slot_or_insert(&record.name);
        let mut guard = slot.lock().expect("record lock");

        let base = match guard.as_ref() {
            Some(current) => current.clock.merge(&record.clock),
            None => record.clock.clone(),
        };
        record.clock = base.increment(&self.inner.local_peer);

        self.persist(&record)?;
        *guard = Some(record.clone());
        debug!(database = %record.name, status = %record.status, "record stored");
        Ok(record)
    }

    /// Read-modify-write one record under its lock.
    ///
    /// Returns `None` without calling `f` when the record does not exist.
    pub fn update<F>(&self, name: &str, f: F) -> StateResult<Option<DatabaseRecord>>
    where
        F: FnOnce(&mut DatabaseRecord),
    {
        let Some(slot) = self.slot(name) else {
            return Ok(None);
        };
        let mut guard = slot.lock().expect("record lock");
        let Some(current) = guard.as_ref() else {
            return Ok(None);
        };

        let mut next = current.clone();
        f(&mut next);
        next.name = current.name.clone();
        next.validate()?;
        next.clock = current.clock.increment(&self.inner.local_peer);

        self.persist(&next)?;
        *guard = Some(next.clone());
        debug!(database = %name, status = %next.status, "record updated");
        Ok(Some(next))
    }

    /// Remove a record. Returns true if it existed.
    pub fn delete(&self, name: &str) -> StateResult<bool> {
        let slot = {
            let mut records = self.inner.records.write().expect("records lock");
            records.remove(name)
        };
        let existed = match slot {
            Some(slot) => slot.lock().expect("record lock").take().is_some(),
            None => false,
        };
        if let Some(journal) = &self.inner.journal {
            journal.delete(name)?;
        }
        if existed {
            info!(database = %name, "record deleted");
        }
        Ok(existed)
    }

    /// All records, ordered by name.
    pub fn list(&self) -> Vec<DatabaseRecord> {
        let slots: Vec<Slot> = {
            let records = self.inner.records.read().expect("records lock");
            records.values().cloned().collect()
        };
        let mut out: Vec<DatabaseRecord> = slots
            .iter()
            .filter_map(|slot| slot.lock().expect("record lock").clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }

    pub fn names(&self) -> Vec<String> {
        self.list().into_iter().map(|r| r.name).collect()
    }

    /// Records that list `peer` among their members.
    pub fn records_with_member(&self, peer: &str) -> Vec<DatabaseRecord> {
        self.list().into_iter().filter(|r| r.is_member(peer)).collect()
    }

    /// Fold a remote copy of a record into the local one.
    pub fn merge(&self, remote: DatabaseRecord) -> StateResult<MergeOutcome> {
        remote.validate()?;
        let slot = self.slot_or_insert(&remote.name);
        let mut guard = slot.lock().expect("record lock");

        let (outcome, next) = match guard.as_ref() {
            None => (MergeOutcome::Inserted, remote),
            Some(local) => match remote.clock.compare(&local.clock) {
                ClockOrdering::Greater => (MergeOutcome::Replaced, remote),
                ClockOrdering::Less => return Ok(MergeOutcome::Discarded),
                ClockOrdering::Equal => return Ok(MergeOutcome::Unchanged),
                ClockOrdering::Concurrent => {
                    (MergeOutcome::Resolved, resolve_concurrent(local, &remote))
                }
            },
        };

        self.persist(&next)?;
        debug!(database = %next.name, ?outcome, status = %next.status, "record merged");
        *guard = Some(next);
        Ok(outcome)
    }

    /// Checksum of the whole record set, for gossip comparison.
    pub fn digest(&self) -> String {
        records_digest(&self.list())
    }

    fn slot(&self, name: &str) -> Option<Slot> {
        let records = self.inner.records.read().expect("records lock");
        records.get(name).cloned()
    }

    fn slot_or_insert(&self, name: &str) -> Slot {
        if let Some(slot) = self.slot(name) {
            return slot;
        }
        let mut records = self.inner.records.write().expect("records lock");
        records
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    fn persist(&self, record: &DatabaseRecord) -> StateResult<()> {
        match &self.inner.journal {
            Some(journal) => journal.put(record),
            None => Ok(()),
        }
    }

    // ── Capacities ─────────────────────────────────────────────────

    pub fn upsert_capacity(&self, capacity: NodeCapacity) {
        let mut caps = self.inner.capacities.write().expect("capacities lock");
        caps.insert(capacity.peer_id.clone(), capacity);
    }

    pub fn capacity(&self, peer: &str) -> Option<NodeCapacity> {
        let caps = self.inner.capacities.read().expect("capacities lock");
        caps.get(peer).cloned()
    }

    /// All known capacities, ordered by peer identity.
    pub fn capacities(&self) -> Vec<NodeCapacity> {
        let caps = self.inner.capacities.read().expect("capacities lock");
        let mut out: Vec<NodeCapacity> = caps.values().cloned().collect();
        out.sort_by(|a, b| a.peer_id.cmp(&b.peer_id));
        out
    }

    pub fn remove_capacity(&self, peer: &str) -> bool {
        let mut caps = self.inner.capacities.write().expect("capacities lock");
        caps.remove(peer).is_some()
    }
}
