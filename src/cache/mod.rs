//! Versioned response cache for offline support.
//!
//! This module provides:
//! - One named cache store per deployed version, populated at install
//! - Pruning of every store that is not the current version
//! - Read/write of response snapshots keyed by request identity
//! - Source metadata telling callers whether data came from network or cache

mod layer;
mod storage;
mod traits;

pub use layer::{CacheLayer, SeedReport};
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource};

#[cfg(test)]
pub(crate) use layer::tests::BrokenStorage;
