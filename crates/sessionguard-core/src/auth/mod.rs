//! Authentication module: session storage and credential renewal.
//!
//! This module provides:
//! - `SessionStore`: the current access/refresh credential pair, persisted
//!   through a `SessionBackend` (file, OS keychain, or memory)
//! - `RequestAuthenticator`: stamps requests with the bearer credential
//! - `RefreshCoordinator`: single-flight renewal state machine
//! - `RetryDispatcher`: replays requests once after renewal
//! - `SessionFailureHandler`: clears the session and emits `SessionEvent::Expired`

pub mod authenticator;
pub mod backend;
pub mod coordinator;
pub mod dispatcher;
pub mod failure;
pub mod renewer;
pub mod session;

pub use authenticator::RequestAuthenticator;
pub use backend::{EphemeralBackend, FileBackend, KeyringBackend, SessionBackend};
pub use coordinator::{RefreshCoordinator, RenewalOutcome};
pub use dispatcher::RetryDispatcher;
pub use failure::{SessionEvent, SessionFailureHandler};
pub use renewer::{RefreshEndpoint, RenewedCredentials, Renewer};
pub use session::{Session, SessionStore};
