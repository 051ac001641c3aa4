//! Repository configuration parsing.

use kdl::KdlNode;
use refwatch_core::{Provider, Repository, RepositoryPolicy, SyncMode};
use serde::{Deserialize, Serialize};

use crate::nodes::{get_first_string_arg, invalid, require_bool, require_count, require_string};
use crate::{ConfigError, ConfigResult};

/// A tracked repository as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub url: String,
    pub provider: Provider,
    /// Environment variable holding the hosting API token.
    pub token_env: Option<String>,
    pub policy: RepositoryPolicy,
    pub mode: SyncMode,
    /// Environment variable holding the webhook secret.
    pub webhook_secret_env: Option<String>,
}

impl RepositoryConfig {
    /// Build the repository record, reading secrets from the process environment.
    pub fn into_repository(self) -> Repository {
        self.to_repository_with(|name| std::env::var(name).ok())
    }

    /// Build the repository record, reading secrets through `lookup`.
    pub fn to_repository_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Repository {
        let mut repository =
            Repository::new(self.url.clone(), self.provider).with_policy(self.policy.clone());
        repository.mode = self.mode;
        repository.token = self.token_env.as_deref().and_then(&lookup);
        repository.webhook_secret = self.webhook_secret_env.as_deref().and_then(&lookup);
        repository
    }
}

/// Parse a `repository "<url>" { ... }` node.
pub(crate) fn parse_repository(node: &KdlNode) -> ConfigResult<RepositoryConfig> {
    let url = get_first_string_arg(node)
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| ConfigError::MissingField("repository url".to_string()))?;

    let mut config = RepositoryConfig {
        url,
        provider: Provider::Gitlab,
        token_env: None,
        policy: RepositoryPolicy::default(),
        mode: SyncMode::default(),
        webhook_secret_env: None,
    };

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "provider" => {
                    config.provider = require_string(child)?
                        .parse()
                        .map_err(|e: String| invalid(child, &e))?;
                }
                "token-env" => {
                    config.token_env = Some(require_string(child)?);
                }
                "running-max" => {
                    // Stores page with signed 64-bit offsets.
                    let max = require_count(child)?;
                    config.policy.running_max = i64::try_from(max)
                        .ok()
                        .and_then(|max| usize::try_from(max).ok())
                        .ok_or_else(|| invalid(child, "too large"))?;
                }
                "merge-request-only" => {
                    config.policy.merge_request_only = require_bool(child)?;
                }
                "sticky-protected" => {
                    config.policy.sticky_protected = require_bool(child)?;
                }
                "ignore-duplicates" => {
                    config.policy.ignore_duplicates = require_bool(child)?;
                }
                "mode" => {
                    config.mode = require_string(child)?
                        .parse()
                        .map_err(|e: String| invalid(child, &e))?;
                }
                "webhook-secret-env" => {
                    config.webhook_secret_env = Some(require_string(child)?);
                }
                _ => {} // Ignore unknown nodes
            }
        }
    }

    Ok(config)
}
