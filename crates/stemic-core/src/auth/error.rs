use thiserror::Error;

use crate::api::ApiError;

/// Why a refresh did not produce a usable access token.
///
/// Cloneable so a single in-flight refresh can hand the same outcome to every
/// caller waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("No refresh token stored")]
    MissingRefreshToken,

    #[error("Refresh token rejected: {0}")]
    Rejected(String),

    #[error("Network error during refresh: {0}")]
    Network(String),

    #[error("Server unavailable during refresh: {0}")]
    Unavailable(String),

    #[error("Refresh returned a token that cannot be decoded")]
    MalformedToken,

    #[error("Refresh returned a token that is already expired")]
    ExpiredToken,

    #[error("Session ended while the refresh was in flight")]
    SessionEnded,

    #[error("Session store error: {0}")]
    Storage(String),
}

impl RefreshError {
    /// Failures the background loop may wait out instead of ending the session
    pub fn is_transient(&self) -> bool {
        matches!(self, RefreshError::Network(_) | RefreshError::Unavailable(_))
    }
}

impl From<ApiError> for RefreshError {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::NetworkError(e) => RefreshError::Network(e.to_string()),
            ApiError::RateLimited => RefreshError::Unavailable("rate limited".to_string()),
            ApiError::ServerError(body) => RefreshError::Unavailable(body),
            other => RefreshError::Rejected(other.to_string()),
        }
    }
}

/// Why `login` refused a token.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Access token cannot be decoded")]
    MalformedToken,

    #[error("Access token is already expired")]
    ExpiredToken,

    #[error("Session store error: {0}")]
    Storage(String),
}
