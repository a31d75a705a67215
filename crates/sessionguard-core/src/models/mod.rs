//! Data models for the authentication API.
//!
//! - `LoginRequest`, `LoginResponse`: credential exchange at login
//! - `RefreshRequest`, `RefreshResponse`: access credential renewal
//! - `User`: the account record returned by login and user details

pub mod auth;
pub mod user;

pub use auth::{LoginRequest, LoginResponse, RefreshRequest, RefreshResponse};
pub use user::User;
