use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Cached projection of a customer.
///
/// `current_balance` is volatile: it is only trustworthy right after a
/// per-customer fetch, and `balance_last_updated` records when that was.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRecord {
  pub id: String,
  pub name: String,
  pub phone: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub whatsapp: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub house_no: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub street_no: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub area: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub city: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub bottle_count: Option<i64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub avg_days_to_refill: Option<i64>,
  #[serde(default = "default_active")]
  pub is_active: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub current_balance: Option<f64>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub balance_last_updated: Option<DateTime<Utc>>,
}

fn default_active() -> bool {
  true
}

impl CustomerRecord {
  /// Create an active record with only the required fields set.
  pub fn new(id: impl Into<String>, name: impl Into<String>, phone: impl Into<String>) -> Self {
    Self {
      id: id.into(),
      name: name.into(),
      phone: phone.into(),
      whatsapp: None,
      house_no: None,
      street_no: None,
      area: None,
      city: None,
      address: None,
      bottle_count: None,
      avg_days_to_refill: None,
      is_active: true,
      current_balance: None,
      balance_last_updated: None,
    }
  }

  /// Drop the balance snapshot. Bulk syncs never carry a trusted balance.
  pub fn without_balance(mut self) -> Self {
    self.current_balance = None;
    self.balance_last_updated = None;
    self
  }

  /// Mark the carried balance as verified at `at`.
  pub fn with_balance_checked_at(mut self, at: DateTime<Utc>) -> Self {
    self.balance_last_updated = Some(at);
    self
  }

  /// The fields a local search matches against, in match order.
  pub fn search_fields(&self) -> [Option<&str>; 5] {
    [
      Some(self.name.as_str()),
      Some(self.phone.as_str()),
      self.whatsapp.as_deref(),
      self.house_no.as_deref(),
      self.address.as_deref(),
    ]
  }

  /// One-line label for terminal output.
  pub fn label(&self) -> String {
    match self.house_no.as_deref() {
      Some(house) => format!("{} ({}, house {})", self.name, self.phone, house),
      None => format!("{} ({})", self.name, self.phone),
    }
  }
}

/// Payload for creating or updating a customer on the directory.
///
/// Unset fields are omitted from the request body, so an update only touches
/// what the caller filled in. Balances are never sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerDraft {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub name: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub phone: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub whatsapp: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub house_no: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub street_no: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub area: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub city: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub address: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub bottle_count: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub avg_days_to_refill: Option<i64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub is_active: Option<bool>,
}

impl CustomerDraft {
  /// Whether the draft has the fields the directory requires on create.
  pub fn is_complete(&self) -> bool {
    let filled = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
    filled(&self.name) && filled(&self.phone)
  }

  /// Whether the draft would change anything.
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}
