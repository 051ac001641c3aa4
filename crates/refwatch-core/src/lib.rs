//! Core domain types and traits for refwatch.
//!
//! This crate contains:
//! - Resource identifiers
//! - Repository, branch and build records
//! - The ref listing and hosting service contracts
//! - Backend selection per repository

pub mod backend;
pub mod branch;
pub mod build;
pub mod error;
pub mod id;
pub mod refs;
pub mod remote;
pub mod repository;

pub use backend::Backends;
pub use branch::Branch;
pub use build::{Build, BuildResult, BuildState, CommitInfo, NewBuild};
pub use error::{FetchError, RemoteServiceError};
pub use id::{BranchId, BuildId, RepositoryId};
pub use refs::{RefEntry, RefFetcher};
pub use remote::{ExternalStatus, MergeRequestInfo, RemoteStatusClient};
pub use repository::{Provider, Repository, RepositoryPolicy, SyncMode};
