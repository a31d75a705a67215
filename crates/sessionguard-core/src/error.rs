use reqwest::StatusCode;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized - token may be expired")]
    AuthExpired,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Token refresh failed: {0}")]
    RefreshFailure(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for ClientError {
    fn from(err: reqwest::Error) -> Self {
        ClientError::Network(err.to_string())
    }
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ClientError {
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

    pub fn from_status(status: StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ClientError::AuthExpired,
            403 => ClientError::AccessDenied(truncated),
            404 => ClientError::NotFound(truncated),
            429 => ClientError::RateLimited,
            500..=599 => ClientError::ServerError(truncated),
            _ => ClientError::InvalidResponse(format!("Status {}: {}", status, truncated)),
        }
    }

    /// Pull a human readable message out of an error body.
    /// Servers answer `{"message": "..."}` or `{"error": "..."}`; anything
    /// else is returned as-is (truncated).
    pub fn server_message(body: &str) -> String {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
            for key in ["message", "error"] {
                if let Some(msg) = value.get(key).and_then(|v| v.as_str()) {
                    return msg.to_string();
                }
            }
        }
        Self::truncate_body(body)
    }

    /// True for errors that mean the session can no longer authenticate
    pub fn is_auth_error(&self) -> bool {
        matches!(
            self,
            ClientError::AuthExpired | ClientError::AuthFailed(_) | ClientError::RefreshFailure(_)
        )
    }
}
