//! Remote customer directory: the backend that owns customer records.
//!
//! The cache only talks to the directory through [`CustomerDirectory`], so
//! tests can swap the HTTP client for an in-process fake.

pub mod api_types;
pub mod client;
pub mod error;
pub mod types;

use std::future::Future;

pub use client::DirectoryClient;
pub use error::DirectoryError;
pub use types::{CustomerDraft, CustomerRecord};

/// Operations the customer directory exposes.
///
/// Records come back with whatever balance the server sent and no
/// `balance_last_updated` stamp; the cache decides how far to trust them.
pub trait CustomerDirectory: Send + Sync + 'static {
  /// Every customer, for a full resync.
  fn list_customers(&self) -> impl Future<Output = Result<Vec<CustomerRecord>, DirectoryError>> + Send;

  /// One customer including the live balance.
  fn get_customer(&self, id: &str) -> impl Future<Output = Result<CustomerRecord, DirectoryError>> + Send;

  /// Server-side search.
  fn search_customers(
    &self,
    query: &str,
  ) -> impl Future<Output = Result<Vec<CustomerRecord>, DirectoryError>> + Send;

  fn create_customer(
    &self,
    draft: &CustomerDraft,
  ) -> impl Future<Output = Result<CustomerRecord, DirectoryError>> + Send;

  fn update_customer(
    &self,
    id: &str,
    draft: &CustomerDraft,
  ) -> impl Future<Output = Result<CustomerRecord, DirectoryError>> + Send;
}
