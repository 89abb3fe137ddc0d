//! Instance manager — the local half of every database's lifecycle.
//!
//! Tracks which databases have an engine on this node, launches them on
//! reserved ports and tears them down again. A launch holds a
//! [`LaunchGuard`] until the engine answers its probe; if the launch
//! fails, times out or is cancelled, the guard stops the engine and
//! returns the ports.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use dbgrid_state::{MemberEndpoint, validate_database_name};

use crate::engine::{Engine, EngineHandle, LaunchSpec};
use crate::error::{InstanceError, InstanceResult};
use crate::ports::PortManager;

const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// State of a database's engine on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalState {
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, Clone)]
struct LocalInstance {
    state: LocalState,
    endpoint: MemberEndpoint,
    handle: Option<EngineHandle>,
}

type InstanceMap = Arc<Mutex<HashMap<String, LocalInstance>>>;

#[derive(Clone)]
pub struct InstanceManager {
    advertise_host: String,
    databases_dir: PathBuf,
    start_timeout: Duration,
    ports: Arc<PortManager>,
    engine: Arc<dyn Engine>,
    instances: InstanceMap,
}

impl InstanceManager {
    pub fn new(
        advertise_host: impl Into<String>,
        databases_dir: impl Into<PathBuf>,
        ports: Arc<PortManager>,
        engine: Arc<dyn Engine>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            advertise_host: advertise_host.into(),
            databases_dir: databases_dir.into(),
            start_timeout,
            ports,
            engine,
            instances: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn databases_dir(&self) -> &Path {
        &self.databases_dir
    }

    pub fn data_dir(&self, database: &str) -> PathBuf {
        self.databases_dir.join(database)
    }

    pub fn ports(&self) -> &PortManager {
        &self.ports
    }

    // ── Port reservations ───────────────────────────────────────────

    /// Reserve a fresh port pair and describe it as an endpoint.
    pub fn reserve(&self) -> InstanceResult<MemberEndpoint> {
        let (http, raft) = self.ports.allocate_pair()?;
        Ok(MemberEndpoint::new(self.advertise_host.clone(), http, raft))
    }

    /// Reserve `previous` again if it is free, else a fresh pair.
    pub fn reserve_preferring(&self, previous: Option<&MemberEndpoint>) -> InstanceResult<MemberEndpoint> {
        if let Some(prev) = previous {
            match self.ports.allocate_specific(prev.http_port, prev.raft_port) {
                Ok(()) => {
                    return Ok(MemberEndpoint::new(
                        self.advertise_host.clone(),
                        prev.http_port,
                        prev.raft_port,
                    ));
                }
                Err(e) => debug!(error = %e, "previous ports unavailable, allocating fresh pair"),
            }
        }
        self.reserve()
    }

    /// Return a reservation that was never launched.
    pub fn release(&self, endpoint: &MemberEndpoint) {
        self.ports.release(endpoint.http_port, endpoint.raft_port);
    }

    // ── Launch and teardown ─────────────────────────────────────────

    /// Launch `database` on an already reserved `endpoint` and wait until
    /// the engine is healthy. The reservation is consumed either way.
    pub async fn launch(
        &self,
        database: &str,
        endpoint: MemberEndpoint,
        join: Option<String>,
    ) -> InstanceResult<MemberEndpoint> {
        let mut guard = LaunchGuard {
            database: database.to_string(),
            endpoint: endpoint.clone(),
            handle: None,
            ports: Arc::clone(&self.ports),
            engine: Arc::clone(&self.engine),
            instances: Arc::clone(&self.instances),
            armed: true,
            registered: false,
        };

        if let Err(e) = validate_database_name(database) {
            return Err(InstanceError::InvalidName(e.to_string()));
        }

        {
            let mut instances = self.instances.lock().expect("instances lock");
            if instances.contains_key(database) {
                return Err(InstanceError::AlreadyRunning(database.to_string()));
            }
            instances.insert(
                database.to_string(),
                LocalInstance {
                    state: LocalState::Starting,
                    endpoint: endpoint.clone(),
                    handle: None,
                },
            );
            guard.registered = true;
        }

        let spec = LaunchSpec {
            database: database.to_string(),
            data_dir: self.data_dir(database),
            advertise_host: endpoint.host.clone(),
            http_port: endpoint.http_port,
            raft_port: endpoint.raft_port,
            join,
        };
        tokio::fs::create_dir_all(&spec.data_dir).await?;

        let handle = self.engine.start(&spec).await?;
        guard.handle = Some(handle.clone());

        let deadline = Instant::now() + self.start_timeout;
        while !self.engine.probe(&spec).await {
            if Instant::now() >= deadline {
                warn!(%database, timeout = ?self.start_timeout, "engine did not become healthy");
                return Err(InstanceError::StartTimedOut {
                    database: database.to_string(),
                    timeout_ms: self.start_timeout.as_millis() as u64,
                });
            }
            tokio::time::sleep(PROBE_INTERVAL).await;
        }

        guard.disarm();
        if let Some(inst) = self.instances.lock().expect("instances lock").get_mut(database) {
            inst.state = LocalState::Running;
            inst.handle = Some(handle);
        }
        info!(
            %database,
            http_port = endpoint.http_port,
            raft_port = endpoint.raft_port,
            joined = spec.join.is_some(),
            "instance running"
        );
        Ok(endpoint)
    }

    /// Reserve fresh ports and launch.
    pub async fn start(&self, database: &str, join: Option<String>) -> InstanceResult<MemberEndpoint> {
        let endpoint = self.reserve()?;
        self.launch(database, endpoint, join).await
    }

    /// Relaunch a hibernated database on its previous ports when possible.
    pub async fn wake(
        &self,
        database: &str,
        previous: Option<&MemberEndpoint>,
        join: Option<String>,
    ) -> InstanceResult<MemberEndpoint> {
        let endpoint = self.reserve_preferring(previous)?;
        self.launch(database, endpoint, join).await
    }

    /// Stop the local engine and release its ports. Data stays on disk.
    /// Returns the endpoint it was serving on, or `None` if nothing ran.
    pub async fn stop(&self, database: &str, graceful: bool) -> InstanceResult<Option<MemberEndpoint>> {
        let handle = {
            let mut instances = self.instances.lock().expect("instances lock");
            let Some(inst) = instances.get_mut(database) else {
                return Ok(None);
            };
            if inst.state != LocalState::Running {
                debug!(%database, state = ?inst.state, "stop skipped, instance not running");
                return Ok(None);
            }
            inst.state = LocalState::Stopping;
            inst.handle.take()
        };

        let result = match &handle {
            Some(h) => self.engine.stop(h, graceful).await,
            None => Ok(()),
        };

        let removed = self.instances.lock().expect("instances lock").remove(database);
        let endpoint = removed.map(|inst| inst.endpoint);
        if let Some(ep) = &endpoint {
            self.ports.release(ep.http_port, ep.raft_port);
        }

        match result {
            Ok(()) => {
                info!(%database, graceful, "instance stopped");
                Ok(endpoint)
            }
            Err(e) => {
                error!(%database, error = %e, "engine stop failed");
                Err(e)
            }
        }
    }

    /// Stop every local engine. Used on shutdown.
    pub async fn stop_all(&self) {
        for database in self.running() {
            if let Err(e) = self.stop(&database, true).await {
                warn!(%database, error = %e, "failed to stop instance on shutdown");
            }
        }
    }

    // ── Queries ─────────────────────────────────────────────────────

    pub fn state(&self, database: &str) -> Option<LocalState> {
        self.instances.lock().expect("instances lock").get(database).map(|i| i.state)
    }

    pub fn is_running(&self, database: &str) -> bool {
        self.state(database) == Some(LocalState::Running)
    }

    pub fn endpoint(&self, database: &str) -> Option<MemberEndpoint> {
        self.instances
            .lock()
            .expect("instances lock")
            .get(database)
            .map(|i| i.endpoint.clone())
    }

    /// Databases with a running engine, sorted.
    pub fn running(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .instances
            .lock()
            .expect("instances lock")
            .iter()
            .filter(|(_, i)| i.state == LocalState::Running)
            .map(|(n, _)| n.clone())
            .collect();
        names.sort();
        names
    }

    /// Instances in any state, counted against the node's capacity.
    pub fn count(&self) -> usize {
        self.instances.lock().expect("instances lock").len()
    }
}

/// Undo for an in-flight launch. Unless disarmed, dropping it removes
/// the starting entry, returns the ports and stops the engine in the
/// background.
struct LaunchGuard {
    database: String,
    endpoint: MemberEndpoint,
    handle: Option<EngineHandle>,
    ports: Arc<PortManager>,
    engine: Arc<dyn Engine>,
    instances: InstanceMap,
    armed: bool,
    registered: bool,
}

impl LaunchGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for LaunchGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if self.registered {
            if let Ok(mut instances) = self.instances.lock() {
                instances.remove(&self.database);
            }
        }
        self.ports.release(self.endpoint.http_port, self.endpoint.raft_port);

        if let Some(handle) = self.handle.take() {
            let engine = Arc::clone(&self.engine);
            let database = self.database.clone();
            warn!(%database, "launch abandoned, stopping engine");
            if let Ok(rt) = tokio::runtime::Handle::try_current() {
                rt.spawn(async move {
                    if let Err(e) = engine.stop(&handle, false).await {
                        error!(%database, error = %e, "failed to stop abandoned engine");
                    }
                });
            }
        } else {
            debug!(database = %self.database, "launch abandoned before engine start");
        }
    }
}
