//! Client-side customer cache and synchronization.
//!
//! This module keeps a working set of customers that:
//! - Persists across runs in a local SQLite store
//! - Answers searches locally first, asking the directory only on a miss
//!   that a recent sync cannot vouch for
//! - Heals itself by writing directory results back into the store
//! - Falls back to memory-only operation when no persistent storage exists

mod coordinator;
mod error;
mod storage;
mod traits;

pub use coordinator::{CustomerCache, SyncPolicy};
pub use storage::{LocalStore, NoopStore, SqliteStore};
pub use traits::CacheResult;
