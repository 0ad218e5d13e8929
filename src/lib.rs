//! mergebench library crate.
//!
//! The primary interface is the `mergebench` binary. This crate holds the
//! engine: merge-candidate discovery over git history, the shared result
//! cache with its coordination layer, cache consolidation and curation, and
//! the evaluation worker.

pub mod cache;
pub mod config;
pub mod discovery;
pub mod exec;
pub mod model;
pub mod worker;

pub(crate) mod fsutil;
