//! Errors raised at the network boundaries of a synchronization pass.

use thiserror::Error;

/// The remote ref listing could not be produced.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("git {command} failed: {stderr}")]
    Git { command: String, stderr: String },

    #[error("malformed ref listing: {0}")]
    Malformed(String),
}

/// The external hosting service rejected or failed a request.
#[derive(Debug, Error)]
pub enum RemoteServiceError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("invalid repository endpoint: {0}")]
    Endpoint(String),
}
