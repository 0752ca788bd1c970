use std::time::Duration;

use color_eyre::{eyre::eyre, Result};
use reqwest::{header, Client, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::debug;
use url::Url;

use crate::config::{Config, DirectoryConfig};

use super::api_types::{ApiCustomer, ApiEnvelope};
use super::error::DirectoryError;
use super::types::{CustomerDraft, CustomerRecord};
use super::CustomerDirectory;

/// HTTP client for the customer directory.
/// Clone is cheap - reqwest::Client shares its connection pool.
#[derive(Clone)]
pub struct DirectoryClient {
  client: Client,
  base_url: Url,
  token: Option<String>,
}

impl DirectoryClient {
  pub fn new(config: &DirectoryConfig) -> Result<Self> {
    let base_url =
      Url::parse(&config.url).map_err(|e| eyre!("Invalid directory URL {}: {}", config.url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Directory URL {} cannot be used as a base", config.url));
    }

    let client = Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token: Config::get_api_token(),
    })
  }

  /// Build `{base}/seg/seg...`, percent-encoding each segment.
  fn endpoint(&self, segments: &[&str]) -> Url {
    let mut url = self.base_url.clone();
    if let Ok(mut path) = url.path_segments_mut() {
      path.pop_if_empty().extend(segments);
    }
    url
  }

  /// Send a request and unwrap the `{success, data, message}` envelope.
  async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, DirectoryError> {
    let request = match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    };

    let response = request
      .header(header::ACCEPT, "application/json")
      .send()
      .await?;

    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(DirectoryError::from_status(status, &error_message(&body)));
    }

    let bytes = response.bytes().await?;
    let envelope: ApiEnvelope<T> = serde_json::from_slice(&bytes)
      .map_err(|e| DirectoryError::InvalidResponse(format!("Failed to parse response: {}", e)))?;
    envelope.into_data()
  }
}

/// Prefer the envelope's `message` over the raw body when the server sent one.
fn error_message(body: &str) -> String {
  serde_json::from_str::<ApiEnvelope<serde_json::Value>>(body)
    .ok()
    .and_then(|env| env.message)
    .unwrap_or_else(|| body.to_string())
}

fn into_records(customers: Vec<ApiCustomer>) -> Vec<CustomerRecord> {
  customers.into_iter().map(ApiCustomer::into_record).collect()
}

impl CustomerDirectory for DirectoryClient {
  async fn list_customers(&self) -> Result<Vec<CustomerRecord>, DirectoryError> {
    let url = self.endpoint(&["customers"]);
    debug!(%url, "Listing customers");
    let customers: Vec<ApiCustomer> = self.send(self.client.get(url)).await?;
    Ok(into_records(customers))
  }

  async fn get_customer(&self, id: &str) -> Result<CustomerRecord, DirectoryError> {
    let url = self.endpoint(&["customers", id]);
    debug!(%url, "Fetching customer");
    let customer: ApiCustomer = self.send(self.client.get(url)).await?;
    Ok(customer.into_record())
  }

  async fn search_customers(&self, query: &str) -> Result<Vec<CustomerRecord>, DirectoryError> {
    let mut url = self.endpoint(&["customers", "search"]);
    url.query_pairs_mut().append_pair("q", query);
    debug!(%url, "Searching directory");
    let customers: Vec<ApiCustomer> = self.send(self.client.get(url)).await?;
    Ok(into_records(customers))
  }

  async fn create_customer(&self, draft: &CustomerDraft) -> Result<CustomerRecord, DirectoryError> {
    let url = self.endpoint(&["customers"]);
    let customer: ApiCustomer = self.send(self.client.post(url).json(draft)).await?;
    Ok(customer.into_record())
  }

  async fn update_customer(
    &self,
    id: &str,
    draft: &CustomerDraft,
  ) -> Result<CustomerRecord, DirectoryError> {
    let url = self.endpoint(&["customers", id]);
    let customer: ApiCustomer = self.send(self.client.put(url).json(draft)).await?;
    Ok(customer.into_record())
  }
}
