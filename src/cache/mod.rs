//! Generation cache for offline support.
//!
//! This module provides the storage side of the cache worker:
//! - Named generation stores mapping request keys to stored responses
//! - Atomic creation of a complete generation (no partial installs)
//! - The cache-first strategy with network fallback and offline document

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStore, SqliteStore};
pub use traits::{RequestKey, ServeSource, Served, StoredResponse};
