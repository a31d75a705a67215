use std::sync::Arc;

use reqwest::header::{self, HeaderValue};
use tracing::warn;

use super::SessionStore;
use crate::transport::ApiRequest;

/// Stamps outgoing requests with the current access credential.
#[derive(Clone)]
pub struct RequestAuthenticator {
    store: Arc<SessionStore>,
}

impl RequestAuthenticator {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    /// Attach the stored access credential, or pass the request through
    /// unmodified when there is no session.
    pub async fn attach(&self, request: ApiRequest) -> ApiRequest {
        match self.store.access_token().await {
            Some(token) => Self::attach_token(request, &token),
            None => request,
        }
    }

    /// Attach an explicit credential, replacing any previous one
    pub fn attach_token(mut request: ApiRequest, token: &str) -> ApiRequest {
        match HeaderValue::from_str(&format!("Bearer {}", token)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                request.headers.insert(header::AUTHORIZATION, value);
            }
            Err(_) => {
                warn!(path = %request.path, "Access credential is not a valid header value, sending without it");
                request.headers.remove(header::AUTHORIZATION);
            }
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{EphemeralBackend, Session};

    fn store() -> Arc<SessionStore> {
        Arc::new(SessionStore::empty(Box::new(EphemeralBackend)))
    }

    #[tokio::test]
    async fn test_attach_with_session() {
        let store = store();
        store.set(Session::new("T1", Some("R1".into()))).await.expect("set");
        let auth = RequestAuthenticator::new(store);

        let req = auth.attach(ApiRequest::get("/auth/user")).await;
        assert_eq!(
            req.headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()),
            Some("Bearer T1")
        );
        assert_eq!(req.bearer_token(), Some("T1"));
    }

    #[tokio::test]
    async fn test_attach_without_session_passes_through() {
        let auth = RequestAuthenticator::new(store());
        let req = auth.attach(ApiRequest::get("/public")).await;
        assert!(req.headers.get(header::AUTHORIZATION).is_none());
        assert_eq!(req.path, "/public");
    }

    #[test]
    fn test_attach_token_replaces_old_credential() {
        let req = RequestAuthenticator::attach_token(ApiRequest::get("/x"), "T1");
        let req = RequestAuthenticator::attach_token(req, "T2");
        assert_eq!(req.bearer_token(), Some("T2"));
        assert_eq!(req.headers.get_all(header::AUTHORIZATION).iter().count(), 1);
    }

    #[test]
    fn test_unencodable_token_is_dropped() {
        let req = RequestAuthenticator::attach_token(ApiRequest::get("/x"), "T1");
        let req = RequestAuthenticator::attach_token(req, "bad\ntoken");
        assert!(req.bearer_token().is_none());
    }
}
