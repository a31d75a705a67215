use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{Session, SessionStore};

/// Capacity of the session event channel.
/// Events are rare (login, renewal, expiry); a slow subscriber only lags.
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Session lifecycle notifications for the embedding application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    /// A renewal cycle issued a new access credential
    Renewed,
    /// The session could not be renewed and has been cleared; the
    /// application should send the user back to login
    Expired { reason: String },
    LoggedOut,
}

/// Reacts to unrecoverable renewal failure.
///
/// Clears the store whenever it still holds the session that failed, but
/// emits [`SessionEvent::Expired`] only once until re-armed by a login or an
/// explicit [`acknowledge`](Self::acknowledge). A session that was logged out
/// or replaced in the meantime is left alone and nothing is emitted.
pub struct SessionFailureHandler {
    store: Arc<SessionStore>,
    events: broadcast::Sender<SessionEvent>,
    armed: AtomicBool,
}

impl SessionFailureHandler {
    pub fn new(store: Arc<SessionStore>, events: broadcast::Sender<SessionEvent>) -> Self {
        Self {
            store,
            events,
            armed: AtomicBool::new(true),
        }
    }

    /// Clear the session and notify the application, if `still_current`
    /// accepts what the store holds (`None` when logged out).
    /// Returns whether the `Expired` event was emitted by this call.
    pub async fn on_renewal_failure<P>(&self, reason: &str, still_current: P) -> bool
    where
        P: FnOnce(Option<&Session>) -> bool,
    {
        match self.store.clear_if(still_current).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(reason = reason, "Session ended or replaced during renewal, not expiring it");
                return false;
            }
            Err(e) => warn!(error = %e, "Session cleared in memory but not in storage"),
        }

        if !self.armed.swap(false, Ordering::AcqRel) {
            debug!(reason = reason, "Session expiry already signalled");
            return false;
        }

        info!(reason = reason, "Session expired, re-authentication required");
        if self
            .events
            .send(SessionEvent::Expired {
                reason: reason.to_string(),
            })
            .is_err()
        {
            debug!("No subscribers for session events");
        }
        true
    }

    /// The application has handled the last expiry; the next failure
    /// will be signalled again
    pub fn acknowledge(&self) {
        self.armed.store(true, Ordering::Release);
    }

    pub(crate) fn rearm(&self) {
        self.acknowledge();
    }
}
