//! KDL configuration parsing for refwatch.
//!
//! This crate handles parsing of:
//! - Server settings (listen address, database, work directory, polling)
//! - Tracked repositories and their admission policy

pub mod config;
pub mod error;
mod nodes;
pub mod repository;

pub use config::{Config, DEFAULT_CONFIG_PATH, ServerConfig, load_config, parse_config};
pub use error::{ConfigError, ConfigResult};
pub use repository::RepositoryConfig;
