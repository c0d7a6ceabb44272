//! Wiring: build the manager and its collaborators from the loaded config.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::task::JoinHandle;

use pg_domain::config::{Config, ManagerConfig};
use pg_manager::{FileConfigStore, Manager, ManagerHandle, RuntimeInfo, SystemLauncher};

use crate::controller::RestController;

/// Where configs and sandboxes live: the configured directory, else
/// `~/.polyglot`, else `./polyglot-data`.
pub fn resolve_config_dir(manager: &ManagerConfig) -> PathBuf {
    manager
        .config_dir
        .clone()
        .or_else(|| dirs::home_dir().map(|home| home.join(".polyglot")))
        .unwrap_or_else(|| PathBuf::from("polyglot-data"))
}

/// Spawn the manager loop with the production launcher, store and
/// controller client.
pub fn start_manager(config: &Config) -> anyhow::Result<(ManagerHandle, JoinHandle<()>)> {
    let config_dir = resolve_config_dir(&config.manager);
    std::fs::create_dir_all(&config_dir)
        .with_context(|| format!("creating config dir {}", config_dir.display()))?;
    tracing::info!(config_dir = %config_dir.display(), "using config dir");

    let controller = RestController::new(&config.controller).context("building controller client")?;
    let launcher = SystemLauncher::new(config.mqtt.clone(), config.manager.send_timeout());
    let store = FileConfigStore::new(config_dir.join("configs"));

    let mut manager_config = config.manager.clone();
    manager_config.config_dir = Some(config_dir);

    Ok(Manager::builder(manager_config, Arc::new(launcher), Arc::new(store), Arc::new(controller))
        .runtime(RuntimeInfo::new(config.controller.version.clone(), &config.mqtt))
        .spawn())
}

/// Register every configured worker. A bad definition is logged and
/// skipped so that the others still come up.
pub async fn register_workers(handle: &ManagerHandle, config: &Config) -> usize {
    let mut registered = 0;
    for definition in &config.workers {
        let id = definition.id.clone();
        match handle.add_worker(definition.clone()).await {
            Ok(()) => registered += 1,
            Err(e) => tracing::error!(worker_id = %id, error = %e, "failed to register node server"),
        }
    }
    registered
}
