//! Database engine processes.
//!
//! [`Engine`] is the process-management seam: start an engine for a
//! database, stop it, and probe whether it is serving. The coordinator
//! never talks to a process directly.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use dbgrid_core::EngineConfig;
use dbgrid_health::http_probe;

use crate::error::{InstanceError, InstanceResult};

/// Everything an engine needs to launch one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub database: String,
    pub data_dir: PathBuf,
    pub advertise_host: String,
    pub http_port: u16,
    pub raft_port: u16,
    /// HTTP address of an existing member to join. `None` bootstraps.
    pub join: Option<String>,
}

impl LaunchSpec {
    pub fn http_addr(&self) -> String {
        format!("{}:{}", self.advertise_host, self.http_port)
    }

    pub fn raft_addr(&self) -> String {
        format!("{}:{}", self.advertise_host, self.raft_port)
    }
}

/// Opaque reference to a started engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EngineHandle {
    pub database: String,
    pub id: u64,
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn start(&self, spec: &LaunchSpec) -> InstanceResult<EngineHandle>;

    /// Stop the engine. Stopping an unknown handle succeeds.
    async fn stop(&self, handle: &EngineHandle, graceful: bool) -> InstanceResult<()>;

    /// Whether the engine behind `spec` answers its health endpoint.
    async fn probe(&self, spec: &LaunchSpec) -> bool;
}

// ── Subprocess engine ───────────────────────────────────────────────

/// Runs each replica as a child process of the configured binary
/// (rqlite-style flags).
pub struct SubprocessEngine {
    config: EngineConfig,
    children: Mutex<HashMap<u64, Child>>,
    next_id: Mutex<u64>,
}

impl SubprocessEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            children: Mutex::new(HashMap::new()),
            next_id: Mutex::new(1),
        }
    }

    /// Command-line arguments for one replica.
    pub fn args(&self, spec: &LaunchSpec) -> Vec<String> {
        let mut args = vec![
            "-http-addr".to_string(),
            spec.http_addr(),
            "-raft-addr".to_string(),
            spec.raft_addr(),
        ];
        if let Some(join) = &spec.join {
            args.push("-join".to_string());
            args.push(join.clone());
        }
        args.extend(self.config.extra_args.iter().cloned());
        args.push(spec.data_dir.display().to_string());
        args
    }

    pub fn running(&self) -> usize {
        self.children.lock().expect("children lock").len()
    }
}

#[async_trait]
impl Engine for SubprocessEngine {
    async fn start(&self, spec: &LaunchSpec) -> InstanceResult<EngineHandle> {
        let args = self.args(spec);
        let child = Command::new(&self.config.binary)
            .args(&args)
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| InstanceError::SubprocessStartFailed {
                database: spec.database.clone(),
                reason: format!("{}: {e}", self.config.binary),
            })?;

        let id = {
            let mut next = self.next_id.lock().expect("id lock");
            let id = *next;
            *next += 1;
            id
        };
        info!(
            database = %spec.database,
            pid = child.id(),
            http_port = spec.http_port,
            raft_port = spec.raft_port,
            join = ?spec.join,
            "engine process spawned"
        );
        self.children.lock().expect("children lock").insert(id, child);

        Ok(EngineHandle {
            database: spec.database.clone(),
            id,
        })
    }

    async fn stop(&self, handle: &EngineHandle, graceful: bool) -> InstanceResult<()> {
        let removed = self.children.lock().expect("children lock").remove(&handle.id);
        let Some(mut child) = removed else {
            return Ok(());
        };

        if graceful {
            if let Some(pid) = child.id() {
                // SAFETY: signalling a child we spawned and have not reaped.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
                match tokio::time::timeout(self.config.stop_grace, child.wait()).await {
                    Ok(Ok(status)) => {
                        info!(database = %handle.database, %status, "engine exited");
                        return Ok(());
                    }
                    Ok(Err(e)) => {
                        return Err(InstanceError::StopFailed {
                            database: handle.database.clone(),
                            reason: e.to_string(),
                        });
                    }
                    Err(_) => {
                        warn!(database = %handle.database, grace = ?self.config.stop_grace, "engine ignored SIGTERM, killing");
                    }
                }
            }
        }

        child.kill().await.map_err(|e| InstanceError::StopFailed {
            database: handle.database.clone(),
            reason: e.to_string(),
        })?;
        debug!(database = %handle.database, "engine killed");
        Ok(())
    }

    async fn probe(&self, spec: &LaunchSpec) -> bool {
        http_probe(&spec.http_addr(), &self.config.status_path, Duration::from_secs(1))
            .await
            .is_healthy()
    }
}

// ── In-memory engine ────────────────────────────────────────────────

#[derive(Default)]
struct MemoryState {
    next_id: u64,
    running: HashMap<u64, LaunchSpec>,
    failing: HashSet<String>,
    unhealthy: HashSet<String>,
    launches: Vec<LaunchSpec>,
    stops: usize,
}

/// Engine that only records launches. Used for dry runs and by the
/// multi-node tests, which script failures per database.
#[derive(Default)]
pub struct MemoryEngine {
    state: Mutex<MemoryState>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every start for `database` fail.
    pub fn fail_starts(&self, database: &str) {
        self.state.lock().expect("engine lock").failing.insert(database.to_string());
    }

    /// Make probes for `database` report unhealthy (or healthy again).
    pub fn set_unhealthy(&self, database: &str, unhealthy: bool) {
        let mut state = self.state.lock().expect("engine lock");
        if unhealthy {
            state.unhealthy.insert(database.to_string());
        } else {
            state.unhealthy.remove(database);
        }
    }

    pub fn is_running(&self, database: &str) -> bool {
        self.state
            .lock()
            .expect("engine lock")
            .running
            .values()
            .any(|spec| spec.database == database)
    }

    /// Every launch so far, oldest first.
    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.state.lock().expect("engine lock").launches.clone()
    }

    pub fn stops(&self) -> usize {
        self.state.lock().expect("engine lock").stops
    }
}

#[async_trait]
impl Engine for MemoryEngine {
    async fn start(&self, spec: &LaunchSpec) -> InstanceResult<EngineHandle> {
        let mut state = self.state.lock().expect("engine lock");
        if state.failing.contains(&spec.database) {
            return Err(InstanceError::SubprocessStartFailed {
                database: spec.database.clone(),
                reason: "scripted failure".to_string(),
            });
        }
        state.next_id += 1;
        let id = state.next_id;
        state.running.insert(id, spec.clone());
        state.launches.push(spec.clone());
        Ok(EngineHandle {
            database: spec.database.clone(),
            id,
        })
    }

    async fn stop(&self, handle: &EngineHandle, _graceful: bool) -> InstanceResult<()> {
        let mut state = self.state.lock().expect("engine lock");
        if state.running.remove(&handle.id).is_some() {
            state.stops += 1;
        }
        Ok(())
    }

    async fn probe(&self, spec: &LaunchSpec) -> bool {
        let state = self.state.lock().expect("engine lock");
        !state.unhealthy.contains(&spec.database)
            && state
                .running
                .values()
                .any(|s| s.database == spec.database && s.http_port == spec.http_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(join: Option<&str>) -> LaunchSpec {
        LaunchSpec {
            database: "orders".into(),
            data_dir: PathBuf::from("/data/databases/orders"),
            advertise_host: "10.0.0.1".into(),
            http_port: 5001,
            raft_port: 7001,
            join: join.map(str::to_string),
        }
    }

    #[test]
    fn subprocess_args_bootstrap_and_join() {
        let engine = SubprocessEngine::new(EngineConfig::default());
        assert_eq!(
            engine.args(&spec(None)),
            vec!["-http-addr", "10.0.0.1:5001", "-raft-addr", "10.0.0.1:7001", "/data/databases/orders"]
        );

        let joined = engine.args(&spec(Some("10.0.0.2:5003")));
        assert_eq!(&joined[4..6], ["-join", "10.0.0.2:5003"]);
    }

    #[tokio::test]
    async fn subprocess_missing_binary_fails_to_start() {
        let engine = SubprocessEngine::new(EngineConfig {
            binary: "/nonexistent/dbgrid-engine".into(),
            ..EngineConfig::default()
        });
        let err = engine.start(&spec(None)).await.unwrap_err();
        assert!(matches!(err, InstanceError::SubprocessStartFailed { .. }));
        assert_eq!(engine.running(), 0);
    }

    #[tokio::test]
    async fn subprocess_stop_unknown_handle_is_ok() {
        let engine = SubprocessEngine::new(EngineConfig::default());
        let handle = EngineHandle {
            database: "orders".into(),
            id: 42,
        };
        engine.stop(&handle, true).await.unwrap();
    }

    #[tokio::test]
    async fn memory_engine_lifecycle() {
        let engine = MemoryEngine::new();
        let handle = engine.start(&spec(None)).await.unwrap();
        assert!(engine.probe(&spec(None)).await);

        engine.set_unhealthy("orders", true);
        assert!(!engine.probe(&spec(None)).await);
        engine.set_unhealthy("orders", false);

        engine.stop(&handle, true).await.unwrap();
        engine.stop(&handle, true).await.unwrap();
        assert!(!engine.is_running("orders"));
        assert_eq!(engine.stops(), 1);
        assert_eq!(engine.launches().len(), 1);
    }

    #[tokio::test]
    async fn memory_engine_scripted_failure() {
        let engine = MemoryEngine::new();
        engine.fail_starts("orders");
        assert!(engine.start(&spec(None)).await.is_err());
        assert!(engine.launches().is_empty());
    }
}
