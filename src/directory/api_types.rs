//! Serde-deserializable types matching the customer directory responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use serde::Deserialize;

use super::error::DirectoryError;
use super::types::CustomerRecord;

// ============================================================================
// Response envelope
// ============================================================================

/// Every endpoint wraps its payload in `{success, data?, message?}`.
#[derive(Debug, Deserialize)]
pub struct ApiEnvelope<T> {
  #[serde(default)]
  pub success: bool,
  pub data: Option<T>,
  pub message: Option<String>,
}

impl<T> ApiEnvelope<T> {
  /// Unwrap the payload, turning `success: false` into a rejection.
  pub fn into_data(self) -> Result<T, DirectoryError> {
    if !self.success {
      return Err(DirectoryError::Rejected(
        self
          .message
          .unwrap_or_else(|| "request was not successful".to_string()),
      ));
    }
    self
      .data
      .ok_or_else(|| DirectoryError::InvalidResponse("envelope has no data".to_string()))
  }
}

// ============================================================================
// Customer payload
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiCustomer {
  #[serde(alias = "_id")]
  pub id: String,
  #[serde(default)]
  pub name: String,
  #[serde(default)]
  pub phone: String,
  pub whatsapp: Option<String>,
  pub house_no: Option<String>,
  pub street_no: Option<String>,
  pub area: Option<String>,
  pub city: Option<String>,
  pub address: Option<String>,
  pub bottle_count: Option<i64>,
  pub avg_days_to_refill: Option<i64>,
  pub is_active: Option<bool>,
  #[serde(alias = "balance")]
  pub current_balance: Option<f64>,
}

impl ApiCustomer {
  /// Map into the cached projection, keeping whatever balance the server sent.
  /// Callers decide whether that balance is trusted.
  pub fn into_record(self) -> CustomerRecord {
    CustomerRecord {
      whatsapp: non_blank(self.whatsapp),
      house_no: non_blank(self.house_no),
      street_no: non_blank(self.street_no),
      area: non_blank(self.area),
      city: non_blank(self.city),
      address: non_blank(self.address),
      bottle_count: self.bottle_count,
      avg_days_to_refill: self.avg_days_to_refill,
      is_active: self.is_active.unwrap_or(true),
      current_balance: self.current_balance,
      ..CustomerRecord::new(self.id, self.name, self.phone)
    }
  }
}

fn non_blank(value: Option<String>) -> Option<String> {
  value.filter(|v| !v.trim().is_empty())
}
