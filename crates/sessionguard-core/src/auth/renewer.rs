use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::models::{RefreshRequest, RefreshResponse};
use crate::transport::{ApiRequest, Transport};

/// Credentials issued by a successful renewal
#[derive(Clone, PartialEq, Eq)]
pub struct RenewedCredentials {
    pub access_token: String,
    /// Present only when the server rotated the refresh credential
    pub refresh_token: Option<String>,
}

impl From<RefreshResponse> for RenewedCredentials {
    fn from(resp: RefreshResponse) -> Self {
        Self {
            access_token: resp.access_token,
            refresh_token: resp.refresh_token,
        }
    }
}

/// Exchanges a refresh credential for a new access credential.
#[async_trait]
pub trait Renewer: Send + Sync {
    async fn renew(&self, refresh_token: &str) -> Result<RenewedCredentials, ClientError>;
}

/// Renews against the server's refresh endpoint.
///
/// Goes straight to the transport: a 401 here is a refresh failure and must
/// never re-enter the expiry path.
pub struct RefreshEndpoint {
    transport: Arc<dyn Transport>,
    path: String,
}

impl RefreshEndpoint {
    pub fn new(transport: Arc<dyn Transport>, path: impl Into<String>) -> Self {
        Self {
            transport,
            path: path.into(),
        }
    }
}

#[async_trait]
impl Renewer for RefreshEndpoint {
    async fn renew(&self, refresh_token: &str) -> Result<RenewedCredentials, ClientError> {
        let request = ApiRequest::post(self.path.as_str()).json(&RefreshRequest {
            refresh_token: refresh_token.to_string(),
        })?;

        let response = self
            .transport
            .send(&request)
            .await
            .map_err(|e| ClientError::RefreshFailure(e.to_string()))?;

        if !response.is_success() {
            warn!(status = response.status.as_u16(), "Refresh endpoint rejected the refresh credential");
            return Err(ClientError::RefreshFailure(format!(
                "status {}: {}",
                response.status.as_u16(),
                ClientError::server_message(&response.body)
            )));
        }

        let parsed: RefreshResponse = response
            .json()
            .map_err(|e| ClientError::RefreshFailure(e.to_string()))?;
        if parsed.access_token.is_empty() {
            return Err(ClientError::RefreshFailure(
                "refresh response carried an empty access token".to_string(),
            ));
        }
        debug!(rotated = parsed.refresh_token.is_some(), "Refresh endpoint issued a new access token");
        Ok(parsed.into())
    }
}
