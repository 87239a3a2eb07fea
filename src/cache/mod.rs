//! Persistent cache generations for intercepted responses.
//!
//! A generation is a named collection of request-key to response entries.
//! Two are current at any time: the static generation holding the precached
//! app shell, and the dynamic generation filled opportunistically at runtime.

mod generation;
mod storage;

pub use generation::GenerationNames;
pub use storage::{CacheHandle, CacheStore, CachedEntry, SqliteStore};
