use thiserror::Error;

#[derive(Error, Debug)]
pub enum DirectoryError {
  #[error("Directory unreachable: {0}")]
  Unavailable(#[from] reqwest::Error),

  #[error("Unauthorized - check the API token")]
  Unauthorized,

  #[error("Customer not found: {0}")]
  NotFound(String),

  #[error("Directory rejected the request: {0}")]
  Rejected(String),

  #[error("Directory error (status {status}): {message}")]
  Remote { status: u16, message: String },

  #[error("Invalid response: {0}")]
  InvalidResponse(String),
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl DirectoryError {
  /// Truncate a response body to avoid logging excessive data
  fn truncate_body(body: &str) -> String {
    if body.len() <= MAX_ERROR_BODY_LENGTH {
      return body.to_string();
    }
    let mut end = MAX_ERROR_BODY_LENGTH;
    while !body.is_char_boundary(end) {
      end -= 1;
    }
    format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
  }

  pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
    let truncated = Self::truncate_body(body);
    match status.as_u16() {
      401 | 403 => DirectoryError::Unauthorized,
      404 => DirectoryError::NotFound(truncated),
      code => DirectoryError::Remote {
        status: code,
        message: truncated,
      },
    }
  }
}
