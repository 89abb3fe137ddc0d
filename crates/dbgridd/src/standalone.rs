//! Standalone mode — one node on the in-process bus.
//!
//! In this mode, the daemon:
//! 1. Loads and validates the configuration
//! 2. Starts a `Node` (journal, reconciliation, background loops)
//! 3. Creates or wakes any `--ensure` databases
//! 4. Waits for Ctrl-C, then stops local engines and keeps their data

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};

use dbgrid_cluster::{LocalHub, MessageBus};
use dbgrid_coordinator::Node;
use dbgrid_core::Config;
use dbgrid_instance::{Engine, MemoryEngine, SubprocessEngine};

/// Load the config file (or defaults) and apply command-line overrides.
pub fn resolve_config(
    path: Option<&Path>,
    peer_id: Option<String>,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(path) => Config::from_file(path).with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(peer_id) = peer_id {
        config.node.peer_id = peer_id;
    }
    if let Some(data_dir) = data_dir {
        config.node.data_dir = data_dir;
    }
    if config.node.peer_id.is_empty() {
        config.node.peer_id = "standalone".to_string();
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(config: Config, ensure: Vec<String>, dry_run: bool) -> anyhow::Result<()> {
    info!(peer_id = %config.node.peer_id, data_dir = ?config.node.data_dir, "dbgrid daemon starting in standalone mode");

    let engine: Arc<dyn Engine> = if dry_run {
        info!("dry run, engines are not spawned");
        Arc::new(MemoryEngine::new())
    } else {
        info!(binary = %config.engine.binary, "using subprocess engine");
        Arc::new(SubprocessEngine::new(config.engine.clone()))
    };

    let hub = LocalHub::new();
    let bus: Arc<dyn MessageBus> = Arc::new(hub.connect(config.node.peer_id.clone()));
    let node = Node::start(config, bus, engine).await?;

    for name in &ensure {
        match node.ensure_active(name).await {
            Ok(record) => info!(
                database = %record.name,
                status = %record.status,
                members = ?record.member_ids(),
                "database ready"
            ),
            Err(e) => error!(database = %name, error = %e, "failed to ensure database"),
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("installing Ctrl-C handler")?;
    info!("shutdown signal received");

    node.shutdown().await;
    info!("dbgrid daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_get_a_peer_id() {
        let config = resolve_config(None, None, None).unwrap();
        assert_eq!(config.node.peer_id, "standalone");
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbgrid.toml");
        std::fs::write(
            &path,
            r#"
[node]
peer_id = "from-file"
data_dir = "/srv/dbgrid"

[database]
replication_factor = 1
"#,
        )
        .unwrap();

        let config = resolve_config(Some(&path), Some("node-a".into()), Some(dir.path().to_path_buf())).unwrap();
        assert_eq!(config.node.peer_id, "node-a");
        assert_eq!(config.node.data_dir, dir.path());
        assert_eq!(config.database.replication_factor, 1);
    }

    #[test]
    fn invalid_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dbgrid.toml");
        std::fs::write(&path, "[database]\nreplication_factor = 0\n").unwrap();
        assert!(resolve_config(Some(&path), None, None).is_err());
        assert!(resolve_config(Some(&dir.path().join("missing.toml")), None, None).is_err());
    }
}
