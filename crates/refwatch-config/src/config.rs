//! Top-level configuration file parsing.

use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::nodes::{invalid, require_count, require_string};
use crate::repository::{RepositoryConfig, parse_repository};
use crate::{ConfigError, ConfigResult};

/// Config file used when none is given.
pub const DEFAULT_CONFIG_PATH: &str = "refwatch.kdl";

/// Server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub listen: String,
    /// PostgreSQL URL. Without one, state is kept in memory.
    pub database_url: Option<String>,
    /// Directory holding the bare mirrors.
    pub work_dir: PathBuf,
    /// Base URL linked from commit statuses.
    pub status_url: Option<String>,
    /// Seconds between two synchronization rounds.
    pub poll_interval: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:3000".to_string(),
            database_url: None,
            work_dir: PathBuf::from("refwatch-data"),
            status_url: None,
            poll_interval: 60,
        }
    }
}

impl ServerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval)
    }
}

/// Complete configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub repositories: Vec<RepositoryConfig>,
}

/// Read and parse a configuration file.
pub fn load_config(path: impl AsRef<Path>) -> ConfigResult<Config> {
    let text = std::fs::read_to_string(path)?;
    parse_config(&text)
}

/// Parse a configuration from KDL text.
pub fn parse_config(kdl: &str) -> ConfigResult<Config> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = Config::default();
    let mut seen = HashSet::new();

    for node in doc.nodes() {
        match node.name().value() {
            "server" => {
                config.server = parse_server(node)?;
            }
            "repository" => {
                let repository = parse_repository(node)?;
                if !seen.insert(repository.url.clone()) {
                    return Err(ConfigError::Duplicate(format!(
                        "repository '{}'",
                        repository.url
                    )));
                }
                config.repositories.push(repository);
            }
            _ => {} // Ignore unknown nodes
        }
    }

    Ok(config)
}

fn parse_server(node: &KdlNode) -> ConfigResult<ServerConfig> {
    let mut server = ServerConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "listen" => {
                    server.listen = require_string(child)?;
                }
                "database-url" => {
                    server.database_url = Some(require_string(child)?);
                }
                "work-dir" => {
                    server.work_dir = PathBuf::from(require_string(child)?);
                }
                "status-url" => {
                    server.status_url = Some(require_string(child)?);
                }
                "poll-interval" => {
                    server.poll_interval = require_count(child)?;
                    if server.poll_interval == 0 {
                        return Err(invalid(child, "must be at least 1 second"));
                    }
                }
                _ => {}
            }
        }
    }

    Ok(server)
}
