//! CLI command implementations.

pub mod merge_request;
pub mod sync;

use anyhow::{Context, Result};
use refwatch_config::{RepositoryConfig, load_config};
use refwatch_core::{Repository, SyncMode};
use refwatch_db::{
    BranchStore, BuildStore, MemoryStore, PgBranchStore, PgBuildStore, create_pool,
    run_migrations,
};
use refwatch_hosting::HostingBackends;
use refwatch_scheduler::{StatusReporter, SyncEngine, status_channel};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub fn validate(path: &Path) -> Result<()> {
    match load_config(path) {
        Ok(config) => {
            println!("Configuration is valid");
            for repository in config.repositories {
                let repository = repository.into_repository();
                let mode = match repository.mode {
                    SyncMode::Poll => "poll",
                    SyncMode::Hook => "hook",
                };
                println!(
                    "  {}  {} ({}, {}, running-max {})",
                    repository.id,
                    repository.url,
                    repository.provider,
                    mode,
                    repository.policy.running_max
                );
            }
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

/// Engine and repositories built from a configuration file.
pub(crate) struct Runtime {
    pub engine: SyncEngine,
    pub reporter: StatusReporter,
    pub repositories: Vec<Repository>,
}

pub(crate) async fn runtime(config_path: &Path) -> Result<Runtime> {
    let config = load_config(config_path)
        .with_context(|| format!("Failed to load config file: {}", config_path.display()))?;
    debug!(repositories = config.repositories.len(), "Loaded configuration");

    let branches: Arc<dyn BranchStore>;
    let builds: Arc<dyn BuildStore>;
    match &config.server.database_url {
        Some(database_url) => {
            let pool = create_pool(database_url)
                .await
                .context("Failed to connect to database")?;
            run_migrations(&pool).await?;
            branches = Arc::new(PgBranchStore::new(pool.clone()));
            builds = Arc::new(PgBuildStore::new(pool));
        }
        None => {
            warn!("No database configured, builds are not persisted");
            let store = Arc::new(MemoryStore::new());
            branches = store.clone();
            builds = store;
        }
    }

    let backends = Arc::new(HostingBackends::new(
        config.server.work_dir.clone(),
        config.server.status_url.clone(),
    ));
    let (statuses, reporter) = status_channel(backends.clone());

    Ok(Runtime {
        engine: SyncEngine::new(branches, builds, backends, statuses),
        reporter,
        repositories: config
            .repositories
            .into_iter()
            .map(RepositoryConfig::into_repository)
            .collect(),
    })
}

/// Find a configured repository by clone URL or by its base (`host/ns/name`).
pub(crate) fn select<'a>(repositories: &'a [Repository], url: &str) -> Result<&'a Repository> {
    let wanted = refwatch_core::repository::repository_base(url);
    repositories
        .iter()
        .find(|r| r.url == url || r.base() == wanted)
        .with_context(|| format!("Repository not configured: {}", url))
}
