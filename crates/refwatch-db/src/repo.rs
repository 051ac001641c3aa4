//! Store traits and implementations.

pub mod branch;
pub mod build;
pub mod memory;

pub use branch::{BranchStore, PgBranchStore};
pub use build::{BuildQuery, BuildStore, PgBuildStore, SequenceOrder};
pub use memory::MemoryStore;
