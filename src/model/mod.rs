//! Data model shared by discovery and evaluation.

pub mod types;

pub use types::{Classification, ErrorKind, MergeCandidate, RepoSlug, ValidationError};
