//! Authentication module for managing the client-side session lifecycle.
//!
//! This module provides:
//! - `SessionManager`: single owner of auth state, with startup verification,
//!   single-flight refresh, and a background expiry check
//! - `Claims` / `decode`: decode-only reading of bearer tokens
//! - `TokenStore`: persistent key-value storage for the token pair
//! - `CredentialStore`: remembered passwords via the OS keyring
//!
//! Tokens are refreshed when less than 5 minutes of lifetime remain.

pub mod claims;
pub mod credentials;
pub mod error;
pub mod manager;
mod monitor;
pub mod store;

use async_trait::async_trait;

use crate::api::ApiError;
use crate::models::TokenPair;

pub use claims::{decode, Claims, Role};
pub use credentials::CredentialStore;
pub use error::{RefreshError, SessionError};
pub use manager::{SessionManager, SessionSettings, SessionState};
pub use store::{FileTokenStore, MemoryTokenStore, ProfileCache, TokenStore};

/// Exchanges a refresh credential for a new access token.
#[async_trait]
pub trait RefreshEndpoint: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, ApiError>;
}
