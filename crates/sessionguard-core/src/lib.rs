//! sessionguard core - an authenticated HTTP client layer.
//!
//! Attaches a bearer credential to outgoing requests, notices when the
//! server rejects it as expired, renews it once no matter how many requests
//! noticed at the same time, and replays the affected requests.
//!
//! The entry point is [`AuthClient`].

pub mod auth;
pub mod client;
pub mod config;
pub mod error;
pub mod models;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use auth::{Session, SessionEvent, SessionStore};
pub use client::AuthClient;
pub use config::{Config, Endpoints, StorageKind};
pub use error::ClientError;
pub use models::User;
pub use transport::{ApiRequest, ApiResponse, ReqwestTransport, Transport};
