//! Result types for cache reads that never fail.

/// Result from a cache operation, including data and metadata about the source.
///
/// Operations returning this degrade instead of erroring; `source` says how.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
}

impl<T> CacheResult<T> {
  pub fn new(data: T, source: CacheSource) -> Self {
    Self { data, source }
  }

  /// Whether the answer came from a fallback after a failure.
  pub fn is_degraded(&self) -> bool {
    self.source == CacheSource::Degraded
  }
}

/// Indicates where a cache answer came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// The in-memory working set, unfiltered
  Memory,
  /// A match in the local store
  Local,
  /// Query too short to search
  Skipped,
  /// Nothing local, and a sync inside the trust window says nothing exists
  TrustedEmpty,
  /// Fresh data from the directory
  Remote,
  /// The directory failed; serving whatever was cached
  Degraded,
}

impl CacheSource {
  pub fn label(self) -> &'static str {
    match self {
      CacheSource::Memory => "memory",
      CacheSource::Local => "local store",
      CacheSource::Skipped => "query too short",
      CacheSource::TrustedEmpty => "recent sync",
      CacheSource::Remote => "directory",
      CacheSource::Degraded => "cached fallback",
    }
  }
}
