//! Node — one dbgrid peer.
//!
//! A `Node` owns the metadata store, the local instance manager and the
//! peer health monitor, and runs the protocol handlers for every message
//! it receives from the bus (its own included). Protocol steps live in
//! the sibling modules as further `impl Node` blocks; this module holds
//! startup, shutdown, the caller-facing API and message dispatch.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use dbgrid_cluster::{Barriers, BusReceiver, ClusterMessage, MessageBus, Topic};
use dbgrid_core::Config;
use dbgrid_health::{BoxFuture, HealthCallback, PeerHealth, PeerHealthMonitor};
use dbgrid_instance::{Engine, InstanceManager, PortManager};
use dbgrid_state::{
    DatabaseRecord, DatabaseStatus, MemberEndpoint, MetadataStore, PeerId, epoch_millis,
    validate_database_name,
};

use crate::create::Attempt;
use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{DbEvent, EventWindow};
use crate::reconcile::{ReconcileReport, reconcile_data_dirs};

/// Coordination roles a node may hold for one database at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Duty {
    IdleBarrier,
    Hibernate,
    Replace,
}

pub(crate) struct NodeInner {
    pub(crate) config: Config,
    pub(crate) peer_id: PeerId,
    pub(crate) store: MetadataStore,
    pub(crate) bus: Arc<dyn MessageBus>,
    pub(crate) instances: InstanceManager,
    pub(crate) health: PeerHealthMonitor,
    pub(crate) events: Barriers<String, DbEvent>,
    /// Creation attempts this node offered to: (database, epoch) → progress.
    pub(crate) attempts: Mutex<HashMap<(String, u64), Attempt>>,
    /// Ports reserved for replacement offers: (database, failed peer) → endpoint.
    pub(crate) replacement_offers: Mutex<HashMap<(String, PeerId), MemberEndpoint>>,
    duties: Mutex<HashSet<(Duty, String)>>,
    op_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Handle to a running node. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
}

impl Node {
    /// Start a node: open the journal, subscribe to every topic, pull
    /// peers' metadata, reconcile local data and start the background
    /// loops.
    pub async fn start(
        config: Config,
        bus: Arc<dyn MessageBus>,
        engine: Arc<dyn Engine>,
    ) -> CoordinatorResult<Self> {
        config.validate()?;
        let peer_id = config.node.peer_id.clone();
        if bus.local_peer() != peer_id {
            warn!(%peer_id, bus_peer = bus.local_peer(), "bus identity differs from configured peer id");
        }

        tokio::fs::create_dir_all(config.databases_dir()).await?;
        let store = MetadataStore::open(peer_id.clone(), &config.journal_path())?;

        let ports = PortManager::new(config.database.http_port_range, config.database.raft_port_range);
        let instances = InstanceManager::new(
            config.node.advertise_host.clone(),
            config.databases_dir(),
            Arc::new(ports),
            engine,
            config.timing.instance_start_timeout,
        );
        let (shutdown_tx, _) = watch::channel(false);

        let inner = Arc::new_cyclic(|weak: &Weak<NodeInner>| {
            let weak = weak.clone();
            let on_health: HealthCallback = Arc::new(move |peer: PeerId, health: PeerHealth| -> BoxFuture {
                let weak = weak.clone();
                Box::pin(async move {
                    if let Some(inner) = weak.upgrade() {
                        Node { inner }.on_peer_health(peer, health);
                    }
                })
            });
            let health = PeerHealthMonitor::new(
                peer_id.clone(),
                config.timing.health_check_interval,
                config.timing.unhealthy_threshold,
            )
            .with_callback(on_health);

            NodeInner {
                config,
                peer_id,
                store,
                bus,
                instances,
                health,
                events: Barriers::new(),
                attempts: Mutex::new(HashMap::new()),
                replacement_offers: Mutex::new(HashMap::new()),
                duties: Mutex::new(HashSet::new()),
                op_locks: Mutex::new(HashMap::new()),
                shutdown_tx,
                tasks: Mutex::new(Vec::new()),
            }
        });
        let node = Node { inner };

        for topic in Topic::ALL {
            let rx = node.inner.bus.subscribe(topic)?;
            let handle = node.spawn_dispatch(topic, rx);
            node.track(handle);
        }

        node.sync_on_startup().await;
        let report = node.reconcile()?;
        if !report.removed.is_empty() {
            info!(removed = ?report.removed, "orphaned data directories removed");
        }
        node.resume_local_instances();

        node.track(node.spawn_heartbeat_loop());
        node.track(node.spawn_gossip_loop());
        node.track(node.inner.health.spawn(node.inner.shutdown_tx.subscribe()));
        if node.inner.config.hibernation_enabled() {
            node.track(node.spawn_idle_loop());
        }

        info!(
            peer_id = %node.inner.peer_id,
            databases = node.inner.store.names().len(),
            kept = report.kept.len(),
            "node started"
        );
        Ok(node)
    }

    pub fn peer_id(&self) -> &str {
        &self.inner.peer_id
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn store(&self) -> &MetadataStore {
        &self.inner.store
    }

    pub fn instances(&self) -> &InstanceManager {
        &self.inner.instances
    }

    pub fn is_shutting_down(&self) -> bool {
        *self.inner.shutdown_tx.borrow()
    }

    // ── Caller API ──────────────────────────────────────────────────

    /// Return the database's record once it is serving, creating or
    /// waking it first when needed.
    pub async fn ensure_active(&self, name: &str) -> CoordinatorResult<DatabaseRecord> {
        if self.is_shutting_down() {
            return Err(CoordinatorError::ShuttingDown);
        }
        validate_database_name(name).map_err(|_| CoordinatorError::InvalidName(name.to_string()))?;

        let lock = self.op_lock(name);
        let _held = lock.lock().await;
        let timing = &self.inner.config.timing;

        for _ in 0..3 {
            let Some(record) = self.inner.store.get(name) else {
                return self.create(name).await;
            };
            match record.status {
                DatabaseStatus::Active | DatabaseStatus::Idle => return self.record_query(name),
                DatabaseStatus::Failed => return Err(CoordinatorError::DatabaseFailed(name.to_string())),
                DatabaseStatus::Creating => {
                    return match self
                        .await_record(name, timing.create_completion_timeout, |r| r.status.is_serving())
                        .await
                    {
                        Some(_) => self.record_query(name),
                        None => Err(CoordinatorError::CreateTimedOut(name.to_string())),
                    };
                }
                DatabaseStatus::Hibernating => {
                    debug!(database = %name, "waiting for hibernation to finish before waking");
                    if self
                        .await_record(name, timing.wake_timeout, |r| r.status != DatabaseStatus::Hibernating)
                        .await
                        .is_none()
                    {
                        return self.wake(name).await;
                    }
                }
                DatabaseStatus::Hibernated | DatabaseStatus::Waking => return self.wake(name).await,
            }
        }
        Err(CoordinatorError::WakeupTimedOut(name.to_string()))
    }

    /// Names of every known database, sorted.
    pub fn list_databases(&self) -> Vec<String> {
        self.inner.store.names()
    }

    pub fn get_status(&self, name: &str) -> CoordinatorResult<DatabaseRecord> {
        self.inner
            .store
            .get(name)
            .ok_or_else(|| CoordinatorError::NotFound(name.to_string()))
    }

    /// Note query activity: refresh `last_query_at` and bring an idle
    /// database back to active.
    pub fn record_query(&self, name: &str) -> CoordinatorResult<DatabaseRecord> {
        let now = epoch_millis();
        self.commit_update(name, |r| {
            r.last_query_at = r.last_query_at.max(now);
            if r.status == DatabaseStatus::Idle {
                r.status = DatabaseStatus::Active;
            }
        })?
        .ok_or_else(|| CoordinatorError::NotFound(name.to_string()))
    }

    /// Remove data directories this node has no claim to.
    pub fn reconcile(&self) -> CoordinatorResult<ReconcileReport> {
        Ok(reconcile_data_dirs(
            self.inner.instances.databases_dir(),
            &self.inner.store,
        )?)
    }

    /// Stop background loops and local engines. Data stays on disk.
    pub async fn shutdown(&self) {
        if self.inner.shutdown_tx.send_replace(true) {
            return;
        }
        let tasks = std::mem::take(&mut *self.inner.tasks.lock().expect("tasks lock"));
        for task in tasks {
            let _ = task.await;
        }
        self.inner.instances.stop_all().await;
        info!(peer_id = %self.inner.peer_id, "node stopped");
    }

    // ── Dispatch ────────────────────────────────────────────────────

    fn spawn_dispatch(&self, topic: Topic, mut rx: BusReceiver) -> JoinHandle<()> {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    payload = rx.recv() => match payload {
                        Some(payload) => node.dispatch(&payload),
                        None => {
                            debug!(%topic, "subscription closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    /// Decode one payload and route it. Handlers never block: slow work
    /// is spawned.
    fn dispatch(&self, payload: &[u8]) {
        let msg = match ClusterMessage::decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                warn!(error = %e, bytes = payload.len(), "dropping malformed message");
                return;
            }
        };
        debug!(kind = msg.kind(), database = msg.database().unwrap_or("-"), "message received");

        use ClusterMessage::*;
        match msg {
            CreateRequest {
                database,
                replication_factor,
                requester,
                epoch,
            } => self.on_create_request(database, replication_factor, requester, epoch),
            CreateResponse {
                database,
                epoch,
                responder,
                endpoint,
            } => self.deliver(
                &database,
                DbEvent::Offer {
                    epoch,
                    peer: responder,
                    endpoint,
                },
            ),
            CreateConfirm {
                database,
                epoch,
                coordinator,
                members,
            } => self.on_create_confirm(database, epoch, coordinator, members),
            CreateAbort {
                database,
                epoch,
                coordinator,
            } => self.on_create_abort(database, epoch, coordinator),
            StatusUpdate {
                database,
                reporter,
                status,
                epoch,
            } => self.deliver(
                &database,
                DbEvent::Status {
                    peer: reporter,
                    status,
                    epoch,
                },
            ),
            IdleNotification { database, reporter } => {
                self.deliver(&database, DbEvent::Idle { peer: reporter })
            }
            HibernateShutdown {
                database,
                coordinator,
            } => self.on_hibernate_shutdown(database, coordinator),
            WakeupRequest { database, requester } => self.on_wakeup_request(database, requester),
            Heartbeat { capacity } => self.on_heartbeat(capacity),
            NodeReplacementNeeded {
                database,
                failed_peer,
                requester,
            } => self.on_replacement_needed(database, failed_peer, requester),
            NodeReplacementOffer {
                database,
                failed_peer,
                offerer,
                endpoint,
            } => self.deliver(
                &database,
                DbEvent::ReplacementOffer {
                    failed_peer,
                    peer: offerer,
                    endpoint,
                },
            ),
            NodeReplacementConfirm {
                database,
                failed_peer,
                replacement,
                endpoint,
                join_address,
            } => self.on_replacement_confirm(database, failed_peer, replacement, endpoint, join_address),
            RecordAnnounce { record } => self.apply_remote(record),
            MetadataDigest {
                from,
                checksum,
                count,
            } => self.on_digest(from, checksum, count),
            MetadataSyncRequest { requester, target } => self.on_sync_request(requester, target),
            MetadataSyncResponse {
                responder,
                target,
                records,
            } => self.on_sync_response(responder, target, records),
        }
    }

    // ── Shared helpers ──────────────────────────────────────────────

    /// Publish, logging instead of failing. Used from handlers, where a
    /// lost message is recovered by timeouts and gossip.
    pub(crate) fn send(&self, msg: ClusterMessage) {
        if let Err(e) = self.inner.bus.broadcast(&msg) {
            warn!(kind = msg.kind(), error = %e, "publish failed");
        }
    }

    pub(crate) fn open_window(&self, database: &str) -> EventWindow {
        self.inner.events.open(database.to_string())
    }

    pub(crate) fn deliver(&self, database: &str, event: DbEvent) {
        self.inner.events.deliver(&database.to_string(), event);
    }

    /// Wait until the local record satisfies `pred`.
    pub(crate) async fn await_record<P>(
        &self,
        name: &str,
        timeout: Duration,
        pred: P,
    ) -> Option<DatabaseRecord>
    where
        P: Fn(&DatabaseRecord) -> bool,
    {
        let mut window = self.open_window(name);
        let store = self.inner.store.clone();
        let got = window
            .collect_until(timeout, |_| store.get(name).is_some_and(|r| pred(&r)))
            .await;
        if got.complete { store.get(name) } else { None }
    }

    /// Store a brand-new record and announce it.
    pub(crate) fn commit_new(&self, record: DatabaseRecord) -> CoordinatorResult<DatabaseRecord> {
        let stored = self.inner.store.set(record)?;
        self.announce(&stored);
        Ok(stored)
    }

    /// Mutate the local record and announce the result.
    pub(crate) fn commit_update<F>(&self, name: &str, f: F) -> CoordinatorResult<Option<DatabaseRecord>>
    where
        F: FnOnce(&mut DatabaseRecord),
    {
        let updated = self.inner.store.update(name, f)?;
        if let Some(record) = &updated {
            self.announce(record);
        }
        Ok(updated)
    }

    fn announce(&self, record: &DatabaseRecord) {
        self.deliver(&record.name, DbEvent::Record { status: record.status });
        self.send(ClusterMessage::RecordAnnounce {
            record: record.clone(),
        });
    }

    /// Fold a peer's copy of a record into the store.
    pub(crate) fn apply_remote(&self, record: DatabaseRecord) {
        let name = record.name.clone();
        match self.inner.store.merge(record) {
            Ok(outcome) if outcome.changed() => {
                if let Some(current) = self.inner.store.get(&name) {
                    debug!(database = %name, ?outcome, status = %current.status, "remote record applied");
                    self.deliver(&name, DbEvent::Record { status: current.status });
                }
            }
            Ok(_) => {}
            Err(e) => warn!(database = %name, error = %e, "rejected remote record"),
        }
    }

    /// Members not known to be unhealthy, this node included.
    pub(crate) fn live_members(&self, record: &DatabaseRecord) -> BTreeSet<PeerId> {
        record
            .members
            .keys()
            .filter(|m| self.inner.health.health(m) != Some(PeerHealth::Unhealthy))
            .cloned()
            .collect()
    }

    /// Where a relaunching member should join: nowhere if it still has
    /// data, else the first other member.
    pub(crate) fn join_target(&self, record: &DatabaseRecord) -> Option<String> {
        if self.inner.instances.data_dir(&record.name).is_dir() {
            return None;
        }
        record
            .members
            .iter()
            .find(|(peer, _)| peer.as_str() != self.inner.peer_id)
            .map(|(_, ep)| ep.http_addr())
    }

    /// Whether this node can take another database.
    pub(crate) fn has_capacity(&self) -> bool {
        let reserved = self
            .inner
            .attempts
            .lock()
            .expect("attempts lock")
            .values()
            .filter(|a| matches!(a, Attempt::Reserved(_)))
            .count()
            + self.inner.replacement_offers.lock().expect("offers lock").len();
        self.inner.instances.count() + reserved < self.inner.config.node.max_databases as usize
    }

    /// Take a coordination duty for `database`. `None` if already held.
    pub(crate) fn claim(&self, duty: Duty, database: &str) -> Option<DutyGuard> {
        let key = (duty, database.to_string());
        let mut duties = self.inner.duties.lock().expect("duties lock");
        if !duties.insert(key.clone()) {
            return None;
        }
        Some(DutyGuard {
            node: self.clone(),
            key,
        })
    }

    /// Run `tick` every `period` until shutdown.
    pub(crate) fn spawn_ticker<F, Fut>(&self, what: &'static str, period: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut(Node) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let node = self.clone();
        let mut shutdown = self.inner.shutdown_tx.subscribe();
        let period = period.max(Duration::from_millis(10));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => tick(node.clone()).await,
                    _ = shutdown.changed() => {
                        debug!(task = what, "loop stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Run `f` once after `delay`, unless the node is gone by then.
    pub(crate) fn spawn_after<F>(&self, delay: Duration, f: F)
    where
        F: FnOnce(Node) + Send + 'static,
    {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                f(Node { inner });
            }
        });
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.inner.tasks.lock().expect("tasks lock").push(handle);
    }

    fn op_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.inner.op_locks.lock().expect("op locks lock");
        Arc::clone(locks.entry(name.to_string()).or_default())
    }

    /// Restart engines for serving databases this node is a member of,
    /// e.g. after a crash.
    fn resume_local_instances(&self) {
        for record in self.inner.store.list() {
            if !record.is_member(&self.inner.peer_id)
                || !record.status.is_serving()
                || self.inner.instances.is_running(&record.name)
            {
                continue;
            }
            let node = self.clone();
            tokio::spawn(async move {
                let previous = record.members.get(&node.inner.peer_id);
                let join = node.join_target(&record);
                match node.inner.instances.wake(&record.name, previous, join).await {
                    Ok(ep) => info!(database = %record.name, http_port = ep.http_port, "instance resumed"),
                    Err(e) => warn!(database = %record.name, error = %e, "failed to resume instance"),
                }
            });
        }
    }
}

/// Held while a coordination duty runs; releases it on drop.
pub(crate) struct DutyGuard {
    node: Node,
    key: (Duty, String),
}

impl Drop for DutyGuard {
    fn drop(&mut self) {
        if let Ok(mut duties) = self.node.inner.duties.lock() {
            duties.remove(&self.key);
        }
    }
}
