//! Hibernation and wake-up.
//!
//! Members that see no queries for `hibernation_timeout` announce they
//! are idle. Each member runs a short barrier over those announcements;
//! when every member of the record has reported, the lowest member
//! orders a shutdown and records `hibernated` once all members confirm.
//! Waking is driven by whoever needs the database.

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use dbgrid_cluster::{ClusterMessage, elect};
use dbgrid_state::{DatabaseRecord, DatabaseStatus, PeerId, epoch_millis};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{covers, idle_reporters, reporters};
use crate::node::{Duty, Node};

impl Node {
    pub(crate) fn spawn_idle_loop(&self) -> JoinHandle<()> {
        let period = self.inner.config.database.idle_check_interval;
        self.spawn_ticker("idle-check", period, |node| async move { node.idle_tick() })
    }

    /// One pass of the local idle check.
    pub(crate) fn idle_tick(&self) {
        let timeout_ms = self.inner.config.database.hibernation_timeout.as_millis() as u64;
        let now = epoch_millis();
        let me = &self.inner.peer_id;

        for record in self.inner.store.list() {
            if !record.is_member(me)
                || !matches!(record.status, DatabaseStatus::Active | DatabaseStatus::Idle)
                || !self.inner.instances.is_running(&record.name)
                || record.idle_for_millis(now) < timeout_ms
            {
                continue;
            }

            if record.status == DatabaseStatus::Active && self.is_lowest_member(&record) {
                let marked = self.commit_update(&record.name, |r| {
                    if r.status == DatabaseStatus::Active {
                        r.status = DatabaseStatus::Idle;
                    }
                });
                if let Err(e) = marked {
                    warn!(database = %record.name, error = %e, "failed to mark database idle");
                }
            }

            self.track_idle(&record);
            debug!(database = %record.name, idle_ms = record.idle_for_millis(now), "member idle");
            self.send(ClusterMessage::IdleNotification {
                database: record.name.clone(),
                reporter: me.clone(),
            });
        }
    }

    /// Start an idle barrier for `record` unless one is already running.
    fn track_idle(&self, record: &DatabaseRecord) {
        let Some(duty) = self.claim(Duty::IdleBarrier, &record.name) else {
            return;
        };
        let mut window = self.open_window(&record.name);
        let members: Vec<PeerId> = record.member_ids();
        let span = self.inner.config.database.idle_check_interval * 2;
        let name = record.name.clone();
        let lowest = self.is_lowest_member(record);

        let node = self.clone();
        tokio::spawn(async move {
            let _duty = duty;
            let seen = window
                .collect_until(span, |ev| covers(&idle_reporters(ev), &members))
                .await;
            drop(window);
            if seen.complete && lowest {
                node.coordinate_hibernation(&name).await;
            }
        });
    }

    /// Order every member to stop, then record `hibernated`.
    async fn coordinate_hibernation(&self, name: &str) {
        let Some(_duty) = self.claim(Duty::Hibernate, name) else {
            return;
        };
        let Some(record) = self.inner.store.get(name) else {
            return;
        };
        let timeout_ms = self.inner.config.database.hibernation_timeout.as_millis() as u64;
        if !matches!(record.status, DatabaseStatus::Active | DatabaseStatus::Idle)
            || record.idle_for_millis(epoch_millis()) < timeout_ms
        {
            debug!(database = %name, status = %record.status, "activity resumed, not hibernating");
            return;
        }

        let mut window = self.open_window(name);
        if let Err(e) = self.commit_update(name, |r| r.status = DatabaseStatus::Hibernating) {
            warn!(database = %name, error = %e, "failed to mark database hibernating");
            return;
        }
        info!(database = %name, members = ?record.member_ids(), "all members idle, hibernating");
        self.send(ClusterMessage::HibernateShutdown {
            database: name.to_string(),
            coordinator: self.inner.peer_id.clone(),
        });

        let members = record.member_ids();
        let done = window
            .collect_until(self.inner.config.timing.create_completion_timeout, |ev| {
                covers(&reporters(ev, DatabaseStatus::Hibernated, None), &members)
            })
            .await;
        if !done.complete {
            let confirmed = reporters(&done.items, DatabaseStatus::Hibernated, None);
            warn!(database = %name, ?confirmed, "not every member confirmed hibernation");
        }

        let result = self.commit_update(name, |r| {
            if r.status == DatabaseStatus::Hibernating {
                r.status = DatabaseStatus::Hibernated;
            }
        });
        match result {
            Ok(Some(r)) if r.status == DatabaseStatus::Hibernated => info!(database = %name, "database hibernated"),
            Ok(_) => debug!(database = %name, "hibernation superseded"),
            Err(e) => warn!(database = %name, error = %e, "failed to record hibernation"),
        }
    }

    pub(crate) fn on_hibernate_shutdown(&self, database: String, coordinator: PeerId) {
        let is_member = self
            .inner
            .store
            .get(&database)
            .is_some_and(|r| r.is_member(&self.inner.peer_id));
        if !is_member {
            return;
        }

        let node = self.clone();
        tokio::spawn(async move {
            match node.inner.instances.stop(&database, true).await {
                Ok(Some(_)) => info!(%database, %coordinator, "instance hibernated"),
                Ok(None) => debug!(%database, "nothing running to hibernate"),
                // The engine is gone either way; data stays for the next wake.
                Err(e) => warn!(%database, error = %e, "graceful stop failed"),
            }
            node.send(ClusterMessage::StatusUpdate {
                database,
                reporter: node.inner.peer_id.clone(),
                status: DatabaseStatus::Hibernated,
                epoch: None,
            });
        });
    }

    // ── Wake-up ─────────────────────────────────────────────────────

    /// Bring a hibernated database back and wait until its live members
    /// all serve again.
    pub(crate) async fn wake(&self, name: &str) -> CoordinatorResult<DatabaseRecord> {
        let record = self
            .inner
            .store
            .get(name)
            .ok_or_else(|| CoordinatorError::NotFound(name.to_string()))?;
        let members = self.live_members(&record);
        if members.is_empty() {
            return Err(CoordinatorError::DatabaseFailed(name.to_string()));
        }

        let mut window = self.open_window(name);
        if matches!(record.status, DatabaseStatus::Hibernated | DatabaseStatus::Hibernating) {
            self.commit_update(name, |r| {
                if matches!(r.status, DatabaseStatus::Hibernated | DatabaseStatus::Hibernating) {
                    r.status = DatabaseStatus::Waking;
                }
            })?;
        }
        info!(database = %name, members = ?members, "waking database");
        self.inner.bus.broadcast(&ClusterMessage::WakeupRequest {
            database: name.to_string(),
            requester: self.inner.peer_id.clone(),
        })?;

        let store = self.inner.store.clone();
        let woke = window
            .collect_until(self.inner.config.timing.wake_timeout, |ev| {
                covers(&reporters(ev, DatabaseStatus::Active, None), &members)
                    || store.get(name).is_some_and(|r| r.status == DatabaseStatus::Active)
                    || reporters(ev, DatabaseStatus::Failed, None)
                        .iter()
                        .any(|p| members.contains(p))
            })
            .await;
        drop(window);

        let active = reporters(&woke.items, DatabaseStatus::Active, None);
        let store_active = store.get(name).is_some_and(|r| r.status == DatabaseStatus::Active);
        if !covers(&active, &members) && !store_active {
            warn!(database = %name, ?active, "wake-up incomplete");
            return Err(CoordinatorError::WakeupTimedOut(name.to_string()));
        }

        let now = epoch_millis();
        let record = self
            .commit_update(name, |r| {
                r.status = DatabaseStatus::Active;
                r.last_query_at = r.last_query_at.max(now);
            })?
            .ok_or_else(|| CoordinatorError::NotFound(name.to_string()))?;
        info!(database = %name, "database awake");
        Ok(record)
    }

    pub(crate) fn on_wakeup_request(&self, database: String, requester: PeerId) {
        let Some(record) = self.inner.store.get(&database) else {
            debug!(%database, %requester, "wake request for unknown database");
            return;
        };
        let me = self.inner.peer_id.clone();
        if !record.is_member(&me) {
            return;
        }
        if self.inner.instances.state(&database).is_some() && !self.inner.instances.is_running(&database) {
            debug!(%database, "instance busy, wake deferred to the running transition");
            return;
        }

        let node = self.clone();
        tokio::spawn(async move {
            let status = node.wake_local(&record).await;
            node.send(ClusterMessage::StatusUpdate {
                database,
                reporter: me,
                status,
                epoch: None,
            });
        });
    }

    /// Relaunch this node's replica of `record` and report how it went.
    async fn wake_local(&self, record: &DatabaseRecord) -> DatabaseStatus {
        let me = &self.inner.peer_id;
        if self.inner.instances.is_running(&record.name) {
            return DatabaseStatus::Active;
        }

        let previous = record.members.get(me);
        let join = self.join_target(record);
        match self.inner.instances.wake(&record.name, previous, join).await {
            Ok(endpoint) => {
                if previous != Some(&endpoint) {
                    info!(database = %record.name, http_port = endpoint.http_port, "woke on new ports");
                    let me = me.clone();
                    if let Err(e) = self.commit_update(&record.name, |r| {
                        r.members.insert(me, endpoint);
                    }) {
                        warn!(database = %record.name, error = %e, "failed to record new endpoint");
                    }
                }
                DatabaseStatus::Active
            }
            Err(e) => {
                warn!(database = %record.name, error = %e, "wake failed");
                DatabaseStatus::Failed
            }
        }
    }

    pub(crate) fn is_lowest_member(&self, record: &DatabaseRecord) -> bool {
        elect(record.members.keys()).is_ok_and(|p| p == self.inner.peer_id)
    }
}

