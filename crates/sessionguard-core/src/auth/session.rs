use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::backend::SessionBackend;

/// The credential pair for the one logical session of this process.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub established_at: DateTime<Utc>,
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl Session {
    pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token,
            established_at: Utc::now(),
            renewed_at: None,
        }
    }

    /// Same session with a renewed access credential.
    /// A rotated refresh credential replaces the old one; otherwise it is kept.
    pub fn renewed(&self, access_token: String, rotated_refresh: Option<String>) -> Self {
        Self {
            access_token,
            refresh_token: rotated_refresh.or_else(|| self.refresh_token.clone()),
            established_at: self.established_at,
            renewed_at: Some(Utc::now()),
        }
    }

    /// Whether `other` is this session, possibly with a renewed access
    /// credential. A new login never matches the session it replaced.
    pub fn same_login(&self, other: &Session) -> bool {
        self.established_at == other.established_at && self.refresh_token == other.refresh_token
    }

    pub fn can_renew(&self) -> bool {
        self.refresh_token.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Time since the access credential was last issued
    pub fn credential_age(&self) -> Duration {
        Utc::now() - self.renewed_at.unwrap_or(self.established_at)
    }

    /// Get minutes since the access credential was issued (for display)
    pub fn minutes_since_issue(&self) -> i64 {
        self.credential_age().num_minutes().max(0)
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("established_at", &self.established_at)
            .field("renewed_at", &self.renewed_at)
            .finish()
    }
}

/// Holds the current session in memory and mirrors it to a backend.
///
/// The in-memory copy is authoritative for the running process. A backend
/// write that fails is logged and returned, but never rolls back memory.
pub struct SessionStore {
    current: RwLock<Option<Session>>,
    backend: Box<dyn SessionBackend>,
}

impl SessionStore {
    /// Open the store, loading any session persisted by a previous run.
    /// An unreadable session starts the process logged out.
    pub fn open(backend: Box<dyn SessionBackend>) -> Self {
        let loaded = match backend.load() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted session, starting logged out");
                None
            }
        };
        debug!(has_session = loaded.is_some(), "Session store opened");
        Self {
            current: RwLock::new(loaded),
            backend,
        }
    }

    /// Store that starts empty regardless of what the backend holds
    pub fn empty(backend: Box<dyn SessionBackend>) -> Self {
        Self {
            current: RwLock::new(None),
            backend,
        }
    }

    pub async fn get(&self) -> Option<Session> {
        self.current.read().await.clone()
    }

    pub async fn set(&self, session: Session) -> Result<()> {
        let mut guard = self.current.write().await;
        let persisted = self.backend.save(&session);
        *guard = Some(session);
        if let Err(e) = persisted {
            warn!(error = %e, "Failed to persist session");
            return Err(e);
        }
        Ok(())
    }

    /// Replace the session with `f(current)` if one exists and `still_current`
    /// accepts it, atomically with respect to `set` and `clear`. Returns the
    /// new session, or `None` when nothing was updated.
    pub async fn update_if<P, F>(&self, still_current: P, f: F) -> Result<Option<Session>>
    where
        P: FnOnce(&Session) -> bool,
        F: FnOnce(&Session) -> Session,
    {
        let mut guard = self.current.write().await;
        let Some(updated) = guard.as_ref().filter(|s| still_current(*s)).map(f) else {
            return Ok(None);
        };
        *guard = Some(updated.clone());
        if let Err(e) = self.backend.save(&updated) {
            warn!(error = %e, "Failed to persist session");
            return Err(e);
        }
        Ok(Some(updated))
    }

    pub async fn clear(&self) -> Result<()> {
        let mut guard = self.current.write().await;
        *guard = None;
        if let Err(e) = self.backend.clear() {
            warn!(error = %e, "Failed to clear persisted session");
            return Err(e);
        }
        Ok(())
    }

    /// Clear the session only if `still_current` accepts what is stored
    /// (`None` when logged out). Returns whether it was cleared; a backend
    /// error means memory was cleared but storage was not.
    pub async fn clear_if<P>(&self, still_current: P) -> Result<bool>
    where
        P: FnOnce(Option<&Session>) -> bool,
    {
        let mut guard = self.current.write().await;
        if !still_current(guard.as_ref()) {
            return Ok(false);
        }
        *guard = None;
        if let Err(e) = self.backend.clear() {
            warn!(error = %e, "Failed to clear persisted session");
            return Err(e);
        }
        Ok(true)
    }

    pub async fn access_token(&self) -> Option<String> {
        self.current.read().await.as_ref().map(|s| s.access_token.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.current.read().await.is_some()
    }
}
