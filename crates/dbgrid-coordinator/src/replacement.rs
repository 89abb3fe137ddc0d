//! Node replacement.
//!
//! When the health monitor gives up on a peer, the lowest surviving
//! member of each affected database asks for a stand-in, takes the first
//! offer, points it at a surviving member to join through, and swaps the
//! member entry once the stand-in is serving.

use std::collections::BTreeSet;

use tracing::{debug, error, info, warn};

use dbgrid_cluster::{ClusterMessage, elect};
use dbgrid_health::PeerHealth;
use dbgrid_state::{DatabaseStatus, MemberEndpoint, PeerId};

use crate::error::{CoordinatorError, CoordinatorResult};
use crate::events::{replacement_offers, reporters};
use crate::node::{Duty, Node};

impl Node {
    /// Health transition callback.
    pub(crate) fn on_peer_health(&self, peer: PeerId, health: PeerHealth) {
        if health == PeerHealth::Healthy {
            info!(%peer, "peer healthy again");
            return;
        }
        let err = CoordinatorError::HealthCheckTimeout(peer.clone());
        warn!(error = %err, "peer presumed failed");
        self.inner.store.remove_capacity(&peer);

        for record in self.inner.store.records_with_member(&peer) {
            if record.status == DatabaseStatus::Failed {
                continue;
            }
            let survivors: BTreeSet<PeerId> = self
                .live_members(&record)
                .into_iter()
                .filter(|p| *p != peer)
                .collect();

            if survivors.is_empty() {
                error!(database = %record.name, lost = %peer, "no surviving members, database failed");
                if let Err(e) = self.commit_update(&record.name, |r| r.status = DatabaseStatus::Failed) {
                    warn!(database = %record.name, error = %e, "failed to mark database failed");
                }
                continue;
            }
            if elect(&survivors).ok().as_deref() != Some(self.inner.peer_id.as_str()) {
                continue;
            }

            let node = self.clone();
            let failed = peer.clone();
            tokio::spawn(async move {
                let database = record.name;
                if let Err(e) = node.replace(&database, &failed).await {
                    warn!(%database, failed_peer = %failed, error = %e, "replacement failed");
                }
            });
        }
    }

    /// Find, start and register a replacement for `failed` in `database`.
    pub(crate) async fn replace(&self, database: &str, failed: &str) -> CoordinatorResult<()> {
        let Some(_duty) = self.claim(Duty::Replace, database) else {
            debug!(%database, "replacement already in progress");
            return Ok(());
        };
        let timeout = self.inner.config.timing.replacement_timeout;
        let me = self.inner.peer_id.clone();

        let mut window = self.open_window(database);
        info!(%database, failed_peer = %failed, "requesting replacement");
        self.inner.bus.broadcast(&ClusterMessage::NodeReplacementNeeded {
            database: database.to_string(),
            failed_peer: failed.to_string(),
            requester: me.clone(),
        })?;

        let offered = window
            .collect_until(timeout, |ev| !replacement_offers(ev, failed).is_empty())
            .await;
        let Some((replacement, endpoint)) = replacement_offers(&offered.items, failed).into_iter().next() else {
            return Err(CoordinatorError::ReplacementUnavailable {
                database: database.to_string(),
                failed_peer: failed.to_string(),
            });
        };

        let record = self.get_status(database)?;
        let join_address = record
            .members
            .get(&me)
            .map(MemberEndpoint::http_addr)
            .ok_or_else(|| CoordinatorError::NotFound(database.to_string()))?;

        info!(%database, failed_peer = %failed, %replacement, "accepting first replacement offer");
        self.send(ClusterMessage::NodeReplacementConfirm {
            database: database.to_string(),
            failed_peer: failed.to_string(),
            replacement: replacement.clone(),
            endpoint: endpoint.clone(),
            join_address,
        });

        let joined = window
            .collect_until(timeout, |ev| {
                reporters(ev, DatabaseStatus::Active, None).contains(&replacement)
                    || reporters(ev, DatabaseStatus::Hibernated, None).contains(&replacement)
                    || reporters(ev, DatabaseStatus::Failed, None).contains(&replacement)
            })
            .await;
        let failed_to_join = reporters(&joined.items, DatabaseStatus::Failed, None).contains(&replacement);
        if !joined.complete || failed_to_join {
            return Err(CoordinatorError::ReplacementUnavailable {
                database: database.to_string(),
                failed_peer: failed.to_string(),
            });
        }

        let failed_peer = failed.to_string();
        let new_member = replacement.clone();
        self.commit_update(database, move |r| r.replace_member(&failed_peer, new_member, endpoint))?;
        info!(%database, failed_peer = %failed, %replacement, "member replaced");
        Ok(())
    }

    pub(crate) fn on_replacement_needed(&self, database: String, failed_peer: PeerId, requester: PeerId) {
        let me = &self.inner.peer_id;
        if failed_peer == *me {
            warn!(%database, %requester, "peer believes this node failed");
            return;
        }
        let Some(record) = self.inner.store.get(&database) else {
            return;
        };
        if record.is_member(me) || self.inner.instances.state(&database).is_some() || !self.has_capacity() {
            return;
        }

        let key = (database.clone(), failed_peer.clone());
        let endpoint = {
            let mut offers = self.inner.replacement_offers.lock().expect("offers lock");
            if offers.contains_key(&key) {
                return;
            }
            let endpoint = match self.inner.instances.reserve() {
                Ok(ep) => ep,
                Err(e) => {
                    warn!(%database, error = %e, "cannot reserve ports for replacement offer");
                    return;
                }
            };
            offers.insert(key.clone(), endpoint.clone());
            endpoint
        };

        debug!(%database, %failed_peer, http_port = endpoint.http_port, "offering replacement");
        self.send(ClusterMessage::NodeReplacementOffer {
            database,
            failed_peer,
            offerer: me.clone(),
            endpoint,
        });

        let expiry = self.inner.config.timing.replacement_timeout * 2;
        self.spawn_after(expiry, move |node| {
            let stale = node.inner.replacement_offers.lock().expect("offers lock").remove(&key);
            if let Some(endpoint) = stale {
                node.inner.instances.release(&endpoint);
                debug!(database = %key.0, "replacement offer expired");
            }
        });
    }

    pub(crate) fn on_replacement_confirm(
        &self,
        database: String,
        failed_peer: PeerId,
        replacement: PeerId,
        endpoint: MemberEndpoint,
        join_address: String,
    ) {
        let reserved = self
            .inner
            .replacement_offers
            .lock()
            .expect("offers lock")
            .remove(&(database.clone(), failed_peer.clone()));

        if replacement != self.inner.peer_id {
            if let Some(ep) = reserved {
                self.inner.instances.release(&ep);
                debug!(%database, %replacement, "offer not taken, released ports");
            }
            return;
        }
        let Some(reserved) = reserved else {
            warn!(%database, %failed_peer, "confirmed an offer no longer held");
            return;
        };
        if reserved != endpoint {
            warn!(%database, offered = ?reserved, confirmed = ?endpoint, "confirm names different ports, using reservation");
        }

        let hibernated = self
            .inner
            .store
            .get(&database)
            .is_some_and(|r| matches!(r.status, DatabaseStatus::Hibernated | DatabaseStatus::Hibernating));

        let node = self.clone();
        tokio::spawn(async move {
            let status = if hibernated {
                // Joins on the next wake, from whichever member is up.
                node.inner.instances.release(&reserved);
                DatabaseStatus::Hibernated
            } else {
                match node.inner.instances.launch(&database, reserved, Some(join_address)).await {
                    Ok(_) => {
                        info!(%database, %failed_peer, "replacement instance running");
                        DatabaseStatus::Active
                    }
                    Err(e) => {
                        warn!(%database, error = %e, "replacement instance failed to start");
                        DatabaseStatus::Failed
                    }
                }
            };
            node.send(ClusterMessage::StatusUpdate {
                database,
                reporter: node.inner.peer_id.clone(),
                status,
                epoch: None,
            });
        });
    }
}
