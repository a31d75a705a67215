use std::sync::Arc;

use tracing::{debug, warn};

use super::coordinator::{RefreshCoordinator, RenewalOutcome};
use super::RequestAuthenticator;
use crate::error::ClientError;
use crate::transport::{ApiRequest, ApiResponse, Transport};

/// Parks requests that hit an expired credential until the renewal cycle
/// resolves, then replays each of them exactly once.
pub struct RetryDispatcher {
    coordinator: Arc<RefreshCoordinator>,
    transport: Arc<dyn Transport>,
}

impl RetryDispatcher {
    pub fn new(coordinator: Arc<RefreshCoordinator>, transport: Arc<dyn Transport>) -> Self {
        Self {
            coordinator,
            transport,
        }
    }

    /// Handle a request the server answered with 401.
    ///
    /// A request that was already replayed fails with `AuthFailed`. Otherwise
    /// it waits for the renewal outcome and is resent once with the new
    /// credential; the replay's response is returned as-is unless it is
    /// another 401.
    pub async fn on_expiry(&self, mut request: ApiRequest) -> Result<ApiResponse, ClientError> {
        if request.retried {
            warn!(path = %request.path, "Request rejected again after renewal");
            return Err(ClientError::AuthFailed(
                "request rejected after credential renewal".to_string(),
            ));
        }
        request.retried = true;

        let sent_with = request.bearer_token().map(str::to_string);
        match self.coordinator.await_renewal(sent_with.as_deref()).await {
            RenewalOutcome::Success(token) => {
                let request = RequestAuthenticator::attach_token(request, &token);
                debug!(path = %request.path, "Replaying request with renewed credential");
                let response = self.transport.send(&request).await?;
                if response.is_unauthorized() {
                    warn!(path = %request.path, "Replayed request still unauthorized");
                    return Err(ClientError::AuthFailed(
                        "request rejected after credential renewal".to_string(),
                    ));
                }
                Ok(response)
            }
            RenewalOutcome::Failure(reason) => {
                debug!(path = %request.path, reason = %reason, "Dropping request, session could not be renewed");
                Err(ClientError::AuthFailed("session expired".to_string()))
            }
        }
    }
}
