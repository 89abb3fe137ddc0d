//! Database creation.
//!
//! The requester broadcasts a `CreateRequest` and waits. Every peer with
//! room reserves a port pair and answers with an offer, then collects
//! offers for the whole offer window. Observers of the same window hold
//! the same offers, so they agree on the candidates: the
//! `replication_factor` lowest offerers. The lowest candidate coordinates:
//! it confirms the candidates and registers the record once all of them
//! report `active`.
//!
//! A node acts on the first confirm it sees for an attempt and from then
//! on listens only to that coordinator's abort.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use dbgrid_cluster::{ClusterMessage, elect, select_lowest};
use dbgrid_state::{DatabaseRecord, DatabaseStatus, MemberEndpoint, PeerId, validate_database_name};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{DbEvent, EventWindow, aborted, covers, first_confirm, offer_count, offers, reporters};
use crate::node::Node;

/// This node's part in one creation attempt.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Attempt {
    /// Offered; ports held until confirm, abort, or expiry.
    Reserved(MemberEndpoint),
    Launching { coordinator: PeerId },
    Running { coordinator: PeerId },
    Aborted,
}

impl Attempt {
    /// The coordinator whose confirm this node acted on.
    fn coordinator(&self) -> Option<&str> {
        match self {
            Attempt::Launching { coordinator } | Attempt::Running { coordinator } => Some(coordinator),
            _ => None,
        }
    }
}

/// Candidates for an attempt: the `rf` lowest distinct offerers.
pub(crate) fn candidates(
    offered: Vec<(PeerId, MemberEndpoint)>,
    rf: usize,
) -> BTreeMap<PeerId, MemberEndpoint> {
    let selected = select_lowest(offered.iter().map(|(peer, _)| peer.as_str()), rf);
    offered
        .into_iter()
        .filter(|(peer, _)| selected.contains(peer))
        .collect()
}

impl Node {
    /// Run a creation attempt for `name` as requester.
    pub(crate) async fn create(&self, name: &str) -> CoordinatorResult<DatabaseRecord> {
        let rf = self.inner.config.database.replication_factor;
        let timing = &self.inner.config.timing;
        let epoch: u64 = rand::random();

        let mut window = self.open_window(name);
        info!(database = %name, replication_factor = rf, epoch, "requesting database creation");
        self.inner.bus.broadcast(&ClusterMessage::CreateRequest {
            database: name.to_string(),
            replication_factor: rf,
            requester: self.inner.peer_id.clone(),
            epoch,
        })?;

        let offered = window.collect_for(timing.create_offer_timeout).await;
        let got = offer_count(&offered, epoch) as u32;
        if got < rf {
            warn!(database = %name, needed = rf, got, "not enough creation offers");
            self.send(ClusterMessage::CreateAbort {
                database: name.to_string(),
                epoch,
                coordinator: self.inner.peer_id.clone(),
            });
            return Err(CoordinatorError::InsufficientResponses { needed: rf, got });
        }

        let store = self.inner.store.clone();
        let serving = |r: &DatabaseRecord| r.status.is_serving();
        let gave_up = |ev: &[DbEvent]| first_confirm(ev, epoch).is_some_and(|c| aborted(ev, epoch, &c));
        let done = window
            .collect_until(timing.create_completion_timeout + timing.create_offer_timeout, |ev| {
                store.get(name).is_some_and(|r| serving(&r)) || gave_up(ev)
            })
            .await;

        if let Some(record) = store.get(name).filter(serving) {
            info!(database = %name, members = ?record.member_ids(), "database created");
            return Ok(record);
        }
        let active = reporters(&done.items, DatabaseStatus::Active, Some(epoch)).len() as u32;
        if gave_up(&done.items) || active < rf {
            warn!(database = %name, needed = rf, active, "creation failed");
            Err(CoordinatorError::InsufficientResponses { needed: rf, got: active })
        } else {
            Err(CoordinatorError::CreateTimedOut(name.to_string()))
        }
    }

    pub(crate) fn on_create_request(&self, database: String, replication_factor: u32, requester: PeerId, epoch: u64) {
        if validate_database_name(&database).is_err() || replication_factor == 0 {
            warn!(%database, %requester, "ignoring malformed create request");
            return;
        }
        if self.inner.store.contains(&database) || self.inner.instances.state(&database).is_some() {
            debug!(%database, "already known, not offering");
            return;
        }
        if !self.has_capacity() {
            debug!(%database, "at capacity, not offering");
            return;
        }
        let endpoint = match self.inner.instances.reserve() {
            Ok(ep) => ep,
            Err(e) => {
                warn!(%database, error = %e, "cannot reserve ports for offer");
                return;
            }
        };

        self.inner
            .attempts
            .lock()
            .expect("attempts lock")
            .insert((database.clone(), epoch), Attempt::Reserved(endpoint.clone()));
        let window = self.open_window(&database);

        debug!(%database, epoch, http_port = endpoint.http_port, raft_port = endpoint.raft_port, "offering to host");
        self.send(ClusterMessage::CreateResponse {
            database: database.clone(),
            epoch,
            responder: self.inner.peer_id.clone(),
            endpoint,
        });

        let node = self.clone();
        let db = database.clone();
        tokio::spawn(async move { node.run_offer_round(db, replication_factor, epoch, window).await });

        let timing = &self.inner.config.timing;
        let expiry = timing.create_offer_timeout + timing.create_completion_timeout * 2;
        self.spawn_after(expiry, move |node| node.expire_attempt(&database, epoch));
    }

    /// Collect offers for the full window; if this node is the elected
    /// coordinator, confirm the candidates and drive the attempt to a
    /// record or an abort.
    async fn run_offer_round(&self, database: String, rf: u32, epoch: u64, mut window: EventWindow) {
        let timing = &self.inner.config.timing;
        let me = self.inner.peer_id.clone();
        let collected = window.collect_for(timing.create_offer_timeout).await;
        let offered = offers(&collected, epoch);
        let got = offered.len();
        let members = candidates(offered, rf as usize);

        let Ok(coordinator) = elect(members.keys().map(String::as_str)) else {
            return;
        };
        if coordinator != me {
            return;
        }

        if got < rf as usize {
            warn!(%database, epoch, needed = rf, got, "too few offers, aborting creation");
            self.abort_creation(&database, epoch);
            return;
        }

        info!(%database, epoch, members = ?members.keys().collect::<Vec<_>>(), offers = got, "coordinating creation");
        self.send(ClusterMessage::CreateConfirm {
            database: database.clone(),
            epoch,
            coordinator: me.clone(),
            members: members.clone(),
        });

        let superseded = |ev: &[DbEvent]| first_confirm(ev, epoch).is_some_and(|c| c != me);
        let outcome = window
            .collect_until(timing.create_completion_timeout, |ev| {
                covers(&reporters(ev, DatabaseStatus::Active, Some(epoch)), members.keys())
                    || !reporters(ev, DatabaseStatus::Failed, Some(epoch)).is_empty()
                    || aborted(ev, epoch, &me)
                    || superseded(ev)
            })
            .await;
        if superseded(&outcome.items) {
            // Only nodes that acted on this confirm obey the abort.
            warn!(%database, epoch, "another coordinator confirmed first, standing down");
            self.abort_creation(&database, epoch);
            return;
        }
        let active = reporters(&outcome.items, DatabaseStatus::Active, Some(epoch));
        if !covers(&active, members.keys()) {
            warn!(%database, epoch, active = active.len(), needed = rf, "members did not come up, aborting creation");
            self.abort_creation(&database, epoch);
            return;
        }

        if self.inner.store.contains(&database) {
            warn!(%database, epoch, "record appeared during creation, keeping it");
            return;
        }
        let mut record = DatabaseRecord::new(&database, rf, members);
        record.status = DatabaseStatus::Active;
        match self.commit_new(record) {
            Ok(record) => info!(database = %record.name, members = ?record.member_ids(), "database registered"),
            Err(e) => {
                warn!(%database, error = %e, "failed to register database");
                self.abort_creation(&database, epoch);
            }
        }
    }

    pub(crate) fn on_create_confirm(
        &self,
        database: String,
        epoch: u64,
        coordinator: PeerId,
        members: BTreeMap<PeerId, MemberEndpoint>,
    ) {
        self.deliver(
            &database,
            DbEvent::Confirmed {
                epoch,
                coordinator: coordinator.clone(),
            },
        );

        let key = (database.clone(), epoch);
        let endpoint = {
            let mut attempts = self.inner.attempts.lock().expect("attempts lock");
            let Some(Attempt::Reserved(endpoint)) = attempts.get(&key).cloned() else {
                debug!(%database, epoch, %coordinator, "confirm ignored");
                return;
            };
            if !members.contains_key(&self.inner.peer_id) {
                attempts.remove(&key);
                drop(attempts);
                self.inner.instances.release(&endpoint);
                debug!(%database, epoch, %coordinator, "not selected, released ports");
                return;
            }
            attempts.insert(
                key.clone(),
                Attempt::Launching {
                    coordinator: coordinator.clone(),
                },
            );
            endpoint
        };

        // The first member bootstraps; the rest join it.
        let join = members
            .iter()
            .next()
            .filter(|(peer, _)| peer.as_str() != self.inner.peer_id)
            .map(|(_, ep)| ep.http_addr());

        let node = self.clone();
        tokio::spawn(async move {
            let result = node.inner.instances.launch(&database, endpoint, join).await;
            let status = match result {
                Ok(_) => {
                    let was_aborted = {
                        let mut attempts = node.inner.attempts.lock().expect("attempts lock");
                        let aborted = attempts.get(&key) == Some(&Attempt::Aborted);
                        attempts.insert(key.clone(), Attempt::Running { coordinator });
                        aborted
                    };
                    if was_aborted {
                        info!(%database, epoch, "creation aborted during launch, stopping");
                        if let Err(e) = node.inner.instances.stop(&database, false).await {
                            warn!(%database, error = %e, "failed to stop aborted instance");
                        }
                        return;
                    }
                    DatabaseStatus::Active
                }
                Err(e) => {
                    warn!(%database, epoch, error = %e, "instance failed to start");
                    node.inner.attempts.lock().expect("attempts lock").remove(&key);
                    DatabaseStatus::Failed
                }
            };
            node.send(ClusterMessage::StatusUpdate {
                database,
                reporter: node.inner.peer_id.clone(),
                status,
                epoch: Some(epoch),
            });
        });
    }

    pub(crate) fn on_create_abort(&self, database: String, epoch: u64, coordinator: PeerId) {
        let key = (database.clone(), epoch);
        let previous = {
            let mut attempts = self.inner.attempts.lock().expect("attempts lock");
            let follows = match attempts.get(&key) {
                None | Some(Attempt::Aborted) => false,
                Some(attempt) => attempt.coordinator().is_none_or(|c| c == coordinator),
            };
            if follows {
                attempts.insert(key, Attempt::Aborted)
            } else {
                None
            }
        };
        match previous {
            Some(Attempt::Reserved(endpoint)) => self.inner.instances.release(&endpoint),
            Some(Attempt::Running { .. }) => {
                let node = self.clone();
                let db = database.clone();
                tokio::spawn(async move {
                    if let Err(e) = node.inner.instances.stop(&db, false).await {
                        warn!(database = %db, error = %e, "failed to stop aborted instance");
                    }
                });
            }
            _ => {}
        }
        debug!(%database, epoch, %coordinator, "creation aborted");
        self.deliver(&database, DbEvent::Aborted { epoch, coordinator });
    }

    fn abort_creation(&self, database: &str, epoch: u64) {
        self.send(ClusterMessage::CreateAbort {
            database: database.to_string(),
            epoch,
            coordinator: self.inner.peer_id.clone(),
        });
    }

    /// Forget a finished attempt; return ports that were never confirmed.
    /// A launch still in progress is checked again later.
    fn expire_attempt(&self, database: &str, epoch: u64) {
        let key = (database.to_string(), epoch);
        let mut attempts = self.inner.attempts.lock().expect("attempts lock");
        match attempts.get(&key).cloned() {
            None => {}
            Some(Attempt::Launching { .. }) => {
                drop(attempts);
                let retry = self.inner.config.timing.create_completion_timeout;
                let database = database.to_string();
                self.spawn_after(retry, move |node| node.expire_attempt(&database, epoch));
            }
            Some(Attempt::Reserved(endpoint)) => {
                attempts.remove(&key);
                drop(attempts);
                self.inner.instances.release(&endpoint);
                debug!(%database, epoch, "offer expired, released ports");
            }
            Some(_) => {
                attempts.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use dbgrid_cluster::{LocalHub, MessageBus};
    use dbgrid_core::{Config, PortRange};
    use dbgrid_instance::{Engine, MemoryEngine};

    use super::*;

    fn endpoint(port: u16) -> MemberEndpoint {
        MemberEndpoint::new("127.0.0.1", port, port + 1000)
    }

    async fn lone_node(dir: &std::path::Path) -> Node {
        let mut cfg = Config::default();
        cfg.node.peer_id = "node-a".into();
        cfg.node.data_dir = dir.to_path_buf();
        cfg.database.hibernation_timeout = Duration::ZERO;
        cfg.database.http_port_range = PortRange::new(47001, 47049);
        cfg.database.raft_port_range = PortRange::new(47051, 47099);
        cfg.timing.startup_sync_window = Duration::from_millis(10);
        cfg.timing.create_completion_timeout = Duration::from_millis(100);

        let hub = LocalHub::new();
        let bus: Arc<dyn MessageBus> = Arc::new(hub.connect("node-a"));
        let engine: Arc<dyn Engine> = Arc::new(MemoryEngine::new());
        Node::start(cfg, bus, engine).await.unwrap()
    }

    fn attempt(node: &Node, key: &(String, u64)) -> Option<Attempt> {
        node.inner.attempts.lock().unwrap().get(key).cloned()
    }

    #[test]
    fn candidates_are_lowest_offerers_regardless_of_arrival() {
        let offered = vec![
            ("node-d".to_string(), endpoint(5004)),
            ("node-b".to_string(), endpoint(5002)),
            ("node-e".to_string(), endpoint(5005)),
            ("node-a".to_string(), endpoint(5001)),
            ("node-c".to_string(), endpoint(5003)),
        ];
        let mut reversed = offered.clone();
        reversed.reverse();

        let picked = candidates(offered, 3);
        assert_eq!(picked.keys().collect::<Vec<_>>(), vec!["node-a", "node-b", "node-c"]);
        assert_eq!(picked["node-b"].http_port, 5002);
        assert_eq!(candidates(reversed, 3), picked);
    }

    #[tokio::test]
    async fn abort_from_another_coordinator_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(dir.path()).await;
        let key = ("orders".to_string(), 7);
        node.inner.attempts.lock().unwrap().insert(
            key.clone(),
            Attempt::Running {
                coordinator: "node-b".into(),
            },
        );

        node.on_create_abort("orders".into(), 7, "node-c".into());
        assert_eq!(
            attempt(&node, &key),
            Some(Attempt::Running {
                coordinator: "node-b".into()
            })
        );

        node.on_create_abort("orders".into(), 7, "node-b".into());
        assert_eq!(attempt(&node, &key), Some(Attempt::Aborted));

        node.shutdown().await;
    }

    #[tokio::test]
    async fn reservation_is_released_by_any_abort() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(dir.path()).await;
        let reserved = node.inner.instances.reserve().unwrap();
        let key = ("orders".to_string(), 3);
        node.inner
            .attempts
            .lock()
            .unwrap()
            .insert(key.clone(), Attempt::Reserved(reserved));

        node.on_create_abort("orders".into(), 3, "node-z".into());
        assert_eq!(attempt(&node, &key), Some(Attempt::Aborted));
        assert_eq!(node.inner.instances.ports().allocated_pairs(), 0);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn launching_attempt_expires_after_launch_finishes() {
        let dir = tempfile::tempdir().unwrap();
        let node = lone_node(dir.path()).await;
        let key = ("orders".to_string(), 9);
        node.inner.attempts.lock().unwrap().insert(
            key.clone(),
            Attempt::Launching {
                coordinator: "node-a".into(),
            },
        );

        node.expire_attempt("orders", 9);
        assert!(attempt(&node, &key).is_some());

        node.inner.attempts.lock().unwrap().insert(
            key.clone(),
            Attempt::Running {
                coordinator: "node-a".into(),
            },
        );
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(attempt(&node, &key), None);

        node.shutdown().await;
    }
}
