//! HTTP transport seam.
//!
//! The authentication pipeline only needs `send(request) -> response`; the
//! [`Transport`] trait is that seam, and [`ReqwestTransport`] is the default
//! implementation over a pooled `reqwest::Client`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ClientError;

// ============================================================================
// Constants
// ============================================================================

/// Maximum number of retries for rate-limited (429) requests.
/// 3 retries with exponential backoff usually succeeds without excessive delay.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay in milliseconds for rate limiting.
/// 1 second is polite to the server while not making users wait too long.
const INITIAL_BACKOFF_MS: u64 = 1000;

// ============================================================================
// Request / Response
// ============================================================================

/// An outgoing API call, replayable as many times as needed.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    /// Path relative to the configured base URL, e.g. `/auth/user`
    pub path: String,
    pub headers: HeaderMap,
    pub body: Option<serde_json::Value>,
    /// Set once the request has been replayed after a renewal
    pub(crate) retried: bool,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            body: None,
            retried: false,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ClientError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ClientError::InvalidResponse(format!("Failed to encode request body: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn header(mut self, name: header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Whether this request has already been replayed once
    pub fn is_retried(&self) -> bool {
        self.retried
    }

    /// The bearer credential currently stamped on the request, if any
    pub fn bearer_token(&self) -> Option<&str> {
        self.headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// A completed exchange with the server, whatever its status.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: StatusCode,
    pub body: String,
}

impl ApiResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Expiry signal from the server
    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Turn a non-2xx response into the matching `ClientError`
    pub fn error_for_status(self) -> Result<Self, ClientError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(ClientError::from_status(self.status, &self.body))
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ClientError> {
        serde_json::from_str(&self.body)
            .map_err(|e| ClientError::InvalidResponse(format!("Failed to parse JSON response: {}", e)))
    }
}

// ============================================================================
// Transport
// ============================================================================

/// Sends a request and returns the server's response.
/// Non-2xx statuses are responses, not errors; only transport failures are `Err`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError>;
}

/// Transport over reqwest.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    base_url: String,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ClientError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, base_url))
    }

    /// Build around an existing client, sharing its connection pool
    pub fn with_client(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        format!(
            "{}/{}",
            self.base_url.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(&self, request: &ApiRequest) -> Result<ApiResponse, ClientError> {
        let url = self.url_for(&request.path);
        let mut retries = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(request.headers.clone());
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await?;
            let status = response.status();

            if status == StatusCode::TOO_MANY_REQUESTS && retries < MAX_RATE_LIMIT_RETRIES {
                retries += 1;
                warn!(url = %url, retry = retries, backoff_ms = backoff_ms, "Rate limited, backing off");
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms *= 2; // Exponential backoff
                continue;
            }

            let body = response.text().await?;
            debug!(method = %request.method, url = %url, status = status.as_u16(), "Response received");
            return Ok(ApiResponse::new(status, body));
        }
    }
}
