use std::sync::Arc;

use thiserror::Error;

use crate::directory::DirectoryError;

/// Failures of the persistent local store.
#[derive(Error, Debug)]
pub enum StoreError {
  /// No persistent storage on this platform. Permanent; detected at init.
  #[error("Persistent storage unavailable: {0}")]
  Unavailable(String),

  #[error("Storage I/O failed: {0}")]
  Io(#[from] rusqlite::Error),

  #[error("Stored customer {id} is unreadable: {source}")]
  Corrupt {
    id: String,
    #[source]
    source: serde_json::Error,
  },

  #[error("Storage lock poisoned")]
  Poisoned,
}

/// A failed full resync.
///
/// Every caller awaiting the same in-flight sync receives a clone of this.
#[derive(Error, Debug, Clone)]
pub enum SyncError {
  #[error("Customer sync failed: {0}")]
  Directory(Arc<DirectoryError>),

  /// The sync task panicked or was torn down with the runtime.
  #[error("Customer sync stopped: {0}")]
  Aborted(String),
}

impl From<DirectoryError> for SyncError {
  fn from(err: DirectoryError) -> Self {
    SyncError::Directory(Arc::new(err))
  }
}
