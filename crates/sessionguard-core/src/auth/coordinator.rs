//! Single-flight renewal of the access credential.
//!
//! `RefreshCoordinator` owns the `Idle | Refreshing` state. The transition
//! out of `Idle` happens under a mutex, so when many requests hit an expired
//! credential at once exactly one of them starts a renewal cycle and the
//! rest wait on that cycle's shared outcome.
//!
//! The cycle itself runs in its own tokio task. Waiters (including the one
//! that started it) may be cancelled without leaving the state stuck in
//! `Refreshing`.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use super::failure::{SessionEvent, SessionFailureHandler};
use super::renewer::{RenewedCredentials, Renewer};
use super::{Session, SessionStore};
use crate::error::ClientError;

/// Result of one renewal cycle, shared by every waiter of that cycle
#[derive(Clone, PartialEq, Eq)]
pub enum RenewalOutcome {
    /// Carries the new access credential
    Success(String),
    Failure(String),
}

impl RenewalOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RenewalOutcome::Success(_))
    }
}

impl fmt::Debug for RenewalOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenewalOutcome::Success(_) => f.write_str("Success(<redacted>)"),
            RenewalOutcome::Failure(reason) => f.debug_tuple("Failure").field(reason).finish(),
        }
    }
}

type CycleOutcome = Shared<BoxFuture<'static, RenewalOutcome>>;

enum RefreshState {
    Idle,
    Refreshing { cycle: u64, outcome: CycleOutcome },
}

pub struct RefreshCoordinator {
    state: Arc<Mutex<RefreshState>>,
    store: Arc<SessionStore>,
    renewer: Arc<dyn Renewer>,
    failure: Arc<SessionFailureHandler>,
    events: broadcast::Sender<SessionEvent>,
    renewal_timeout: Option<Duration>,
    cycles: AtomicU64,
}

impl RefreshCoordinator {
    pub fn new(
        store: Arc<SessionStore>,
        renewer: Arc<dyn Renewer>,
        failure: Arc<SessionFailureHandler>,
        events: broadcast::Sender<SessionEvent>,
        renewal_timeout: Option<Duration>,
    ) -> Self {
        Self {
            state: Arc::new(Mutex::new(RefreshState::Idle)),
            store,
            renewer,
            failure,
            events,
            renewal_timeout,
            cycles: AtomicU64::new(0),
        }
    }

    /// Wait for a usable access credential after an expiry signal.
    ///
    /// `sent_with` is the access credential the failed request carried.
    /// If the store already holds a different one, renewal has happened
    /// since that request left and its credential is returned directly.
    pub async fn await_renewal(&self, sent_with: Option<&str>) -> RenewalOutcome {
        let mut state = self.state.lock().await;

        if let RefreshState::Refreshing { cycle, outcome } = &*state {
            debug!(cycle = *cycle, "Renewal in progress, waiting on it");
            let outcome = outcome.clone();
            drop(state);
            return outcome.await;
        }

        let Some(session) = self.store.get().await else {
            drop(state);
            return self.fail_without_cycle("no active session", |s| s.is_none()).await;
        };

        if sent_with != Some(session.access_token.as_str()) {
            debug!("Access credential changed since the request was sent, reusing it");
            return RenewalOutcome::Success(session.access_token);
        }

        if !session.can_renew() {
            drop(state);
            return self
                .fail_without_cycle("no refresh credential", |s| {
                    s.is_some_and(|s| s.same_login(&session))
                })
                .await;
        }

        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let outcome = self.start_cycle(cycle, session);
        *state = RefreshState::Refreshing {
            cycle,
            outcome: outcome.clone(),
        };
        drop(state);

        outcome.await
    }

    /// Whether a renewal cycle is currently in flight
    pub async fn is_refreshing(&self) -> bool {
        matches!(*self.state.lock().await, RefreshState::Refreshing { .. })
    }

    /// Number of renewal cycles started since construction
    pub fn cycles_started(&self) -> u64 {
        self.cycles.load(Ordering::Relaxed)
    }

    async fn fail_without_cycle<P>(&self, reason: &str, still_current: P) -> RenewalOutcome
    where
        P: FnOnce(Option<&Session>) -> bool,
    {
        info!(reason = reason, "Access credential expired and cannot be renewed");
        self.failure.on_renewal_failure(reason, still_current).await;
        RenewalOutcome::Failure(reason.to_string())
    }

    /// Renew `session` in a detached task. Only that session is updated or
    /// expired when the task finishes; a logout or new login in the meantime
    /// wins.
    fn start_cycle(&self, cycle: u64, session: Session) -> CycleOutcome {
        let state = Arc::clone(&self.state);
        let store = Arc::clone(&self.store);
        let renewer = Arc::clone(&self.renewer);
        let failure = Arc::clone(&self.failure);
        let events = self.events.clone();
        let timeout = self.renewal_timeout;

        info!(cycle = cycle, "Access credential expired, renewing");

        let task = tokio::spawn(async move {
            let refresh_token = session.refresh_token.clone().unwrap_or_default();
            let renewal = AssertUnwindSafe(renew_with_timeout(renewer.as_ref(), &refresh_token, timeout))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(ClientError::RefreshFailure("renewal panicked".to_string())));

            let outcome = match renewal {
                Ok(credentials) => apply_renewal(&store, &events, cycle, &session, credentials).await,
                Err(e) => {
                    warn!(cycle = cycle, error = %e, "Renewal failed");
                    let reason = e.to_string();
                    failure
                        .on_renewal_failure(&reason, |current| {
                            current.is_some_and(|c| c.same_login(&session))
                        })
                        .await;
                    RenewalOutcome::Failure(reason)
                }
            };

            let mut guard = state.lock().await;
            if matches!(&*guard, RefreshState::Refreshing { cycle: current, .. } if *current == cycle) {
                *guard = RefreshState::Idle;
            }
            outcome
        });

        task.map(|joined| {
            joined.unwrap_or_else(|e| RenewalOutcome::Failure(format!("renewal task aborted: {}", e)))
        })
        .boxed()
        .shared()
    }
}

async fn renew_with_timeout(
    renewer: &dyn Renewer,
    refresh_token: &str,
    timeout: Option<Duration>,
) -> Result<RenewedCredentials, ClientError> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, renewer.renew(refresh_token))
            .await
            .unwrap_or_else(|_| Err(ClientError::RefreshFailure("renewal timed out".to_string()))),
        None => renewer.renew(refresh_token).await,
    }
}

async fn apply_renewal(
    store: &SessionStore,
    events: &broadcast::Sender<SessionEvent>,
    cycle: u64,
    renewing: &Session,
    credentials: RenewedCredentials,
) -> RenewalOutcome {
    let RenewedCredentials {
        access_token,
        refresh_token,
    } = credentials;
    let rotated = refresh_token.is_some();

    let renewed = store
        .update_if(
            |current| current.same_login(renewing),
            |current| current.renewed(access_token.clone(), refresh_token),
        )
        .await;
    match renewed {
        Ok(Some(_)) => {}
        Ok(None) => {
            info!(cycle = cycle, "Session ended or replaced during renewal, discarding new credential");
            return RenewalOutcome::Failure("session ended during renewal".to_string());
        }
        // In-memory session is already updated; only persistence failed
        Err(e) => warn!(cycle = cycle, error = %e, "Renewed credential not persisted"),
    }

    info!(cycle = cycle, rotated = rotated, "Access credential renewed");
    let _ = events.send(SessionEvent::Renewed);
    RenewalOutcome::Success(access_token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::failure::EVENT_CHANNEL_CAPACITY;
    use crate::auth::EphemeralBackend;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Barrier;

    struct StubRenewer {
        calls: AtomicUsize,
        delay: Duration,
        result: Result<(String, Option<String>), String>,
        panics: bool,
    }

    impl StubRenewer {
        fn ok(access: &str, delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                result: Ok((access.to_string(), None)),
                panics: false,
            }
        }

        fn rotating(access: &str, refresh: &str) -> Self {
            Self {
                result: Ok((access.to_string(), Some(refresh.to_string()))),
                ..Self::ok(access, Duration::ZERO)
            }
        }

        fn failing(reason: &str, delay: Duration) -> Self {
            Self {
                result: Err(reason.to_string()),
                ..Self::ok("", delay)
            }
        }

        fn panicking() -> Self {
            Self {
                panics: true,
                ..Self::ok("", Duration::ZERO)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Renewer for StubRenewer {
        async fn renew(&self, refresh_token: &str) -> Result<RenewedCredentials, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            assert_eq!(refresh_token, "R1");
            tokio::time::sleep(self.delay).await;
            if self.panics {
                panic!("renewer blew up");
            }
            match &self.result {
                Ok((access, refresh)) => Ok(RenewedCredentials {
                    access_token: access.clone(),
                    refresh_token: refresh.clone(),
                }),
                Err(reason) => Err(ClientError::RefreshFailure(reason.clone())),
            }
        }
    }

    struct Harness {
        store: Arc<SessionStore>,
        renewer: Arc<StubRenewer>,
        coordinator: Arc<RefreshCoordinator>,
        events: broadcast::Receiver<SessionEvent>,
    }

    async fn harness(renewer: StubRenewer, session: Option<Session>, timeout: Option<Duration>) -> Harness {
        let store = Arc::new(SessionStore::empty(Box::new(EphemeralBackend)));
        if let Some(session) = session {
            store.set(session).await.expect("set");
        }
        let (tx, rx) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let failure = Arc::new(SessionFailureHandler::new(Arc::clone(&store), tx.clone()));
        let renewer = Arc::new(renewer);
        let coordinator = Arc::new(RefreshCoordinator::new(
            Arc::clone(&store),
            renewer.clone(),
            failure,
            tx,
            timeout,
        ));
        Harness {
            store,
            renewer,
            coordinator,
            events: rx,
        }
    }

    fn expired_session() -> Option<Session> {
        Some(Session::new("T1", Some("R1".to_string())))
    }

    fn drain(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn concurrent_waiters(coordinator: &Arc<RefreshCoordinator>, n: usize) -> Vec<RenewalOutcome> {
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|_| {
                let coordinator = Arc::clone(coordinator);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    barrier.wait().await;
                    coordinator.await_renewal(Some("T1")).await
                })
            })
            .collect();
        futures::future::join_all(handles)
            .await
            .into_iter()
            .map(|r| r.expect("waiter task joins"))
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_expiry_renews_once() {
        let mut h = harness(StubRenewer::ok("T2", Duration::from_millis(100)), expired_session(), None).await;

        let outcomes = concurrent_waiters(&h.coordinator, 16).await;

        assert_eq!(h.renewer.calls(), 1);
        assert_eq!(h.coordinator.cycles_started(), 1);
        assert!(outcomes.iter().all(|o| *o == RenewalOutcome::Success("T2".to_string())));
        assert_eq!(h.store.access_token().await.as_deref(), Some("T2"));
        assert!(!h.coordinator.is_refreshing().await);
        assert_eq!(drain(&mut h.events), vec![SessionEvent::Renewed]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_renewal_clears_and_signals_once() {
        let mut h = harness(
            StubRenewer::failing("refresh token revoked", Duration::from_millis(50)),
            expired_session(),
            None,
        )
        .await;

        let outcomes = concurrent_waiters(&h.coordinator, 8).await;

        assert_eq!(h.renewer.calls(), 1);
        assert!(outcomes.iter().all(|o| matches!(o, RenewalOutcome::Failure(_))));
        assert!(h.store.get().await.is_none());
        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], SessionEvent::Expired { reason } if reason.contains("revoked")));
        assert!(!h.coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_missing_refresh_credential_fails_without_cycle() {
        let mut h = harness(
            StubRenewer::ok("T2", Duration::ZERO),
            Some(Session::new("T1", None)),
            None,
        )
        .await;

        let outcome = h.coordinator.await_renewal(Some("T1")).await;

        assert!(matches!(outcome, RenewalOutcome::Failure(ref r) if r == "no refresh credential"));
        assert_eq!(h.renewer.calls(), 0);
        assert_eq!(h.coordinator.cycles_started(), 0);
        assert!(!h.coordinator.is_refreshing().await);
        assert!(h.store.get().await.is_none());
        assert_eq!(drain(&mut h.events).len(), 1);
    }

    #[tokio::test]
    async fn test_stale_credential_reuses_current_one() {
        let h = harness(
            StubRenewer::ok("T3", Duration::ZERO),
            Some(Session::new("T2", Some("R1".to_string()))),
            None,
        )
        .await;

        let outcome = h.coordinator.await_renewal(Some("T1")).await;

        assert_eq!(outcome, RenewalOutcome::Success("T2".to_string()));
        assert_eq!(h.renewer.calls(), 0);
    }

    #[tokio::test]
    async fn test_sequential_cycles_each_renew() {
        let h = harness(StubRenewer::ok("T2", Duration::ZERO), expired_session(), None).await;
        assert!(h.coordinator.await_renewal(Some("T1")).await.is_success());

        // T2 expires in turn
        assert!(h.coordinator.await_renewal(Some("T2")).await.is_success());
        assert_eq!(h.renewer.calls(), 2);
        assert_eq!(h.coordinator.cycles_started(), 2);
    }

    #[tokio::test]
    async fn test_rotated_refresh_credential_is_stored() {
        let h = harness(StubRenewer::rotating("T2", "R2"), expired_session(), None).await;

        assert!(h.coordinator.await_renewal(Some("T1")).await.is_success());

        let session = h.store.get().await.expect("session kept");
        assert_eq!(session.access_token, "T2");
        assert_eq!(session.refresh_token.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_renewal_timeout_fails_waiters() {
        let mut h = harness(
            StubRenewer::ok("T2", Duration::from_secs(10)),
            expired_session(),
            Some(Duration::from_millis(50)),
        )
        .await;

        let outcome = h.coordinator.await_renewal(Some("T1")).await;

        assert!(matches!(outcome, RenewalOutcome::Failure(ref r) if r.contains("timed out")));
        assert!(!h.coordinator.is_refreshing().await);
        assert!(h.store.get().await.is_none());
        assert_eq!(drain(&mut h.events).len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_initiator_does_not_strand_cycle() {
        let h = harness(StubRenewer::ok("T2", Duration::from_millis(100)), expired_session(), None).await;

        let initiator = tokio::spawn({
            let coordinator = Arc::clone(&h.coordinator);
            async move { coordinator.await_renewal(Some("T1")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        initiator.abort();

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!h.coordinator.is_refreshing().await);
        assert_eq!(h.store.access_token().await.as_deref(), Some("T2"));
        assert_eq!(h.renewer.calls(), 1);
    }

    #[tokio::test]
    async fn test_panicking_renewer_resolves_failure() {
        let h = harness(StubRenewer::panicking(), expired_session(), None).await;

        let outcome = h.coordinator.await_renewal(Some("T1")).await;

        assert!(matches!(outcome, RenewalOutcome::Failure(ref r) if r.contains("panicked")));
        assert!(!h.coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_logout_during_renewal_discards_credential() {
        let mut h = harness(StubRenewer::ok("T2", Duration::from_millis(100)), expired_session(), None).await;

        let waiter = tokio::spawn({
            let coordinator = Arc::clone(&h.coordinator);
            async move { coordinator.await_renewal(Some("T1")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.store.clear().await.expect("clear");

        let outcome = waiter.await.expect("waiter joins");
        assert!(matches!(outcome, RenewalOutcome::Failure(_)));
        assert!(h.store.get().await.is_none());
        // An explicit logout is not an expiry
        assert!(drain(&mut h.events).is_empty());
    }

    async fn replace_session_mid_cycle(h: &Harness, replacement: Option<Session>) -> RenewalOutcome {
        let waiter = tokio::spawn({
            let coordinator = Arc::clone(&h.coordinator);
            async move { coordinator.await_renewal(Some("T1")).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        match replacement {
            Some(session) => h.store.set(session).await.expect("set"),
            None => h.store.clear().await.expect("clear"),
        }
        waiter.await.expect("waiter joins")
    }

    fn fresh_login() -> Session {
        Session::new("FRESH", Some("RFRESH".to_string()))
    }

    #[tokio::test]
    async fn test_login_during_renewal_keeps_new_session() {
        let mut h = harness(StubRenewer::ok("T2", Duration::from_millis(100)), expired_session(), None).await;

        let outcome = replace_session_mid_cycle(&h, Some(fresh_login())).await;

        assert!(matches!(outcome, RenewalOutcome::Failure(_)));
        let session = h.store.get().await.expect("fresh session kept");
        assert_eq!(session.access_token, "FRESH");
        assert_eq!(session.refresh_token.as_deref(), Some("RFRESH"));
        assert!(drain(&mut h.events).is_empty());
        assert!(!h.coordinator.is_refreshing().await);
    }

    #[tokio::test]
    async fn test_login_during_failed_renewal_is_not_expired() {
        let mut h = harness(
            StubRenewer::failing("revoked", Duration::from_millis(100)),
            expired_session(),
            None,
        )
        .await;

        let outcome = replace_session_mid_cycle(&h, Some(fresh_login())).await;

        assert!(matches!(outcome, RenewalOutcome::Failure(_)));
        assert_eq!(h.store.access_token().await.as_deref(), Some("FRESH"));
        assert!(drain(&mut h.events).is_empty());
    }

    #[tokio::test]
    async fn test_logout_during_failed_renewal_emits_nothing() {
        let mut h = harness(
            StubRenewer::failing("revoked", Duration::from_millis(100)),
            expired_session(),
            None,
        )
        .await;

        let outcome = replace_session_mid_cycle(&h, None).await;

        assert!(matches!(outcome, RenewalOutcome::Failure(_)));
        assert!(h.store.get().await.is_none());
        assert!(drain(&mut h.events).is_empty());
    }

    #[test]
    fn test_outcome_debug_redacts_token() {
        let debug = format!("{:?}", RenewalOutcome::Success("T2-secret".to_string()));
        assert!(!debug.contains("T2-secret"));
    }
}
