//! Repository synchronization and build admission for refwatch.
//!
//! The [`SyncEngine`] reconciles remote refs into branches and builds and
//! applies the admission policy. Commit statuses are published out of band
//! by the [`StatusReporter`], and the [`Poller`] drives passes on a timer
//! or when a webhook arrives.

pub mod policy;
pub mod poller;
pub mod registry;
pub mod status;
pub mod sync;

pub use poller::Poller;
pub use registry::RepositoryRegistry;
pub use status::{StatusEvent, StatusQueue, StatusReporter, report_state, status_channel};
pub use sync::{SyncEngine, SyncError, SyncResult};
