//! Core library for the STEMIC event-management client.
//!
//! The interesting part lives in [`auth`]: a [`SessionManager`] that owns the
//! bearer-token session, verifies it at startup, refreshes it before it
//! lapses, and forces a logout (with a notice and a redirect) when it cannot.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod notify;

pub use api::{ApiClient, ApiError};
pub use auth::{Claims, RefreshError, Role, SessionError, SessionManager, SessionSettings, SessionState};
pub use config::Config;
