//! HTTP server for refwatch.
//!
//! Provides health endpoints and the webhook receiver that wakes the poller.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
