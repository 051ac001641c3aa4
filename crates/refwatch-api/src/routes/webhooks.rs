//! Webhook endpoint for repositories in hook mode.
//!
//! A verified webhook records its arrival time on the repository and asks
//! the poller for an immediate pass. The payload itself is not inspected:
//! the pass fetches the full ref snapshot anyway.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use chrono::Utc;
use hmac::{Hmac, Mac};
use refwatch_core::{Provider, Repository, RepositoryId};
use sha2::Sha256;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/{repository_id}", post(receive_hook))
}

async fn receive_hook(
    State(state): State<AppState>,
    Path(repository_id): Path<RepositoryId>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let repository = state
        .registry
        .get(repository_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("repository {}", repository_id)))?;

    if !verify_request(&repository, &headers, &body) {
        warn!(repo = %repository.url, "Invalid webhook signature");
        return Err(ApiError::Unauthorized("invalid webhook signature".to_string()));
    }

    let event = headers
        .get("X-GitHub-Event")
        .or_else(|| headers.get("X-Gitlab-Event"))
        .and_then(|v| v.to_str().ok())
        .unwrap_or("unknown");
    info!(repo = %repository.url, event = %event, "Received webhook");

    state.registry.record_hook(repository_id, Utc::now()).await;

    match state.wake.try_send(repository_id) {
        Ok(()) => {}
        Err(TrySendError::Full(_)) => {
            debug!(repo = %repository.url, "Poller busy, pass already queued");
        }
        Err(TrySendError::Closed(_)) => {
            warn!(repo = %repository.url, "Poller stopped, webhook not scheduled");
        }
    }

    Ok(StatusCode::ACCEPTED)
}

/// Check the webhook against the repository's secret, if one is configured.
///
/// GitHub signs the body (`X-Hub-Signature-256`); GitLab echoes the secret
/// (`X-Gitlab-Token`). Plain repositories accept either.
fn verify_request(repository: &Repository, headers: &HeaderMap, body: &[u8]) -> bool {
    let Some(secret) = repository.webhook_secret.as_deref() else {
        return true;
    };

    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok());
    let token = headers.get("X-Gitlab-Token").and_then(|v| v.to_str().ok());

    match repository.provider {
        Provider::Github => verify_github_signature(secret, body, signature),
        Provider::Gitlab => verify_gitlab_token(secret, token),
        Provider::Plain => {
            verify_github_signature(secret, body, signature) || verify_gitlab_token(secret, token)
        }
    }
}

fn verify_github_signature(secret: &str, body: &[u8], signature: Option<&str>) -> bool {
    let Some(signature) = signature else {
        return false;
    };

    // Signature format: "sha256=<hex>"
    let Some(sig_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(sig_bytes) = hex::decode(sig_hex) else {
        return false;
    };

    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);

    mac.verify_slice(&sig_bytes).is_ok()
}

fn verify_gitlab_token(secret: &str, token: Option<&str>) -> bool {
    let Some(token) = token else {
        return false;
    };
    // constant time over the token length
    token.len() == secret.len()
        && token
            .bytes()
            .zip(secret.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}
