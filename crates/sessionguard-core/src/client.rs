//! Authenticated API client.
//!
//! `AuthClient` is the single entry point the rest of an application uses:
//! every request goes out with the current bearer credential, a 401 sends it
//! through the renewal pipeline, and anything else comes back unchanged.

use std::sync::Arc;

use anyhow::Result;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::auth::failure::EVENT_CHANNEL_CAPACITY;
use crate::auth::{
    EphemeralBackend, FileBackend, KeyringBackend, RefreshCoordinator, RefreshEndpoint,
    RequestAuthenticator, RetryDispatcher, Session, SessionBackend, SessionEvent,
    SessionFailureHandler, SessionStore,
};
use crate::config::{Config, Endpoints, StorageKind};
use crate::error::ClientError;
use crate::models::{LoginRequest, LoginResponse, User};
use crate::transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};

pub struct AuthClient {
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    authenticator: RequestAuthenticator,
    coordinator: Arc<RefreshCoordinator>,
    dispatcher: RetryDispatcher,
    failure: Arc<SessionFailureHandler>,
    events: broadcast::Sender<SessionEvent>,
    endpoints: Endpoints,
}

impl AuthClient {
    /// Create a client over reqwest with the storage backend named in `config`
    pub fn from_config(config: &Config) -> Result<Self> {
        let transport = Arc::new(ReqwestTransport::new(
            config.base_url.as_str(),
            config.request_timeout(),
        )?);

        let backend: Box<dyn SessionBackend> = match config.storage {
            StorageKind::File => Box::new(FileBackend::new(config.cache_dir()?)),
            StorageKind::Keyring => Box::new(KeyringBackend::new()),
            StorageKind::Memory => Box::new(EphemeralBackend),
        };
        debug!(storage = ?config.storage, base_url = %config.base_url, "Creating auth client");

        Ok(Self::new(config, transport, Arc::new(SessionStore::open(backend))))
    }

    /// Wire the pipeline over an explicit transport and store
    pub fn new(config: &Config, transport: Arc<dyn Transport>, store: Arc<SessionStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let failure = Arc::new(SessionFailureHandler::new(Arc::clone(&store), events.clone()));
        let renewer = Arc::new(RefreshEndpoint::new(
            Arc::clone(&transport),
            config.endpoints.refresh.as_str(),
        ));
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            renewer,
            Arc::clone(&failure),
            events.clone(),
            config.renewal_timeout(),
        ));
        let dispatcher = RetryDispatcher::new(Arc::clone(&coordinator), Arc::clone(&transport));

        Self {
            authenticator: RequestAuthenticator::new(Arc::clone(&store)),
            transport,
            store,
            coordinator,
            dispatcher,
            failure,
            events,
            endpoints: config.endpoints.clone(),
        }
    }

    // ===== Authenticated requests =====

    /// Send a request with the current credential.
    ///
    /// A 401 is absorbed by renewal and replay; it only surfaces as
    /// `ClientError::AuthFailed`. Every other status is returned as a response.
    pub async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ClientError> {
        let request = self.authenticator.attach(request).await;
        let response = self.transport.send(&request).await?;

        if response.is_unauthorized() {
            debug!(path = %request.path, "Access credential rejected");
            return self.dispatcher.on_expiry(request).await;
        }
        Ok(response)
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.send(ApiRequest::get(path)).await?.error_for_status()?.json()
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        let request = ApiRequest::post(path).json(body)?;
        self.send(request).await?.error_for_status()?.json()
    }

    // ===== Auth endpoints =====

    /// Exchange email and password for a session
    pub async fn login(&self, email: &str, password: &str) -> Result<User, ClientError> {
        let request = ApiRequest::post(self.endpoints.login.as_str()).json(&LoginRequest {
            email: email.to_string(),
            password: password.to_string(),
        })?;

        let response = self.transport.send(&request).await?;
        if !response.is_success() {
            warn!(status = response.status.as_u16(), "Login rejected");
            return Err(if response.status.is_client_error() {
                ClientError::AuthFailed(ClientError::server_message(&response.body))
            } else {
                ClientError::from_status(response.status, &response.body)
            });
        }

        let parsed: LoginResponse = response.json()?;
        if let Err(e) = self
            .store
            .set(Session::new(parsed.access_token, parsed.refresh_token))
            .await
        {
            warn!(error = %e, "Logged in, but the session will not survive a restart");
        }
        self.failure.rearm();
        let _ = self.events.send(SessionEvent::LoggedIn);

        info!("Login successful");
        Ok(parsed.user.unwrap_or_default())
    }

    /// Fetch the logged-in user's record
    pub async fn user_details(&self) -> Result<User, ClientError> {
        self.get_json(self.endpoints.user_details.as_str()).await
    }

    /// End the session. The server call is best-effort; the local session is
    /// cleared whatever the server says.
    pub async fn logout(&self) {
        let request = self
            .authenticator
            .attach(ApiRequest::post(self.endpoints.logout.as_str()))
            .await;

        match self.transport.send(&request).await {
            Ok(response) if response.is_success() => debug!("Server acknowledged logout"),
            Ok(response) => warn!(status = response.status.as_u16(), "Server rejected logout, clearing session anyway"),
            Err(e) => warn!(error = %e, "Logout request failed, clearing session anyway"),
        }

        if let Err(e) = self.store.clear().await {
            warn!(error = %e, "Session cleared in memory but not in storage");
        }
        let _ = self.events.send(SessionEvent::LoggedOut);
        info!("Logged out");
    }

    // ===== Session state =====

    /// Receive session lifecycle events (login, renewal, expiry, logout)
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    /// The application has reacted to the last `SessionEvent::Expired`
    pub fn acknowledge_expiry(&self) {
        self.failure.acknowledge();
    }

    pub async fn session(&self) -> Option<Session> {
        self.store.get().await
    }

    pub async fn is_authenticated(&self) -> bool {
        self.store.is_authenticated().await
    }

    /// Number of renewal cycles this client has started
    pub fn renewal_cycles(&self) -> u64 {
        self.coordinator.cycles_started()
    }
}
