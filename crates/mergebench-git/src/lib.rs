//! Git abstraction layer for mergebench.
//!
//! This crate defines the [`GitRepo`] trait - the single interface through
//! which the discovery engine reads a repository's commit graph. No other
//! mergebench crate imports gix directly; they program against the trait.
//!
//! # Crate layout
//!
//! - [`repo`] - the [`GitRepo`] trait definition.
//! - [`types`] - value types used in trait signatures ([`GitOid`], [`RefName`],
//!   [`CommitInfo`], [`HistoryEntry`]).
//! - [`error`] - the [`GitError`] enum returned by all trait methods.
//! - [`walk`] - the generic date-ordered history walk, used by backends
//!   without a native walker.
//! - [`memory`] - an in-memory commit graph, used as a test double.

pub mod error;
pub mod memory;
pub mod repo;
pub mod types;
pub mod walk;

// gix-backed implementation modules
mod gix_repo;
mod objects_impl;
mod refs_impl;

pub use gix_repo::GixRepo;

// Re-export the main trait and commonly used types at the crate root for
// ergonomic imports: `use mergebench_git::{GitRepo, GitOid, GitError};`
pub use error::GitError;
pub use memory::MemoryRepo;
pub use repo::GitRepo;
pub use types::{CommitInfo, GitOid, HistoryEntry, OidParseError, RefName, RefNameError};
