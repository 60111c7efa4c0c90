//! Bearer token claims and the decode-only token reader.
//!
//! Tokens are issued and signed by the STEMIC API. The client never verifies
//! signatures; it only reads the payload segment to learn who is signed in
//! and when the token stops being accepted.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Account role carried in the token payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "user", alias = "end_user", alias = "usuario", alias = "participant")]
    EndUser,
    #[serde(rename = "organizer", alias = "organizador")]
    Organizer,
    #[serde(rename = "admin", alias = "administrador")]
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::EndUser => "user",
            Role::Organizer => "organizer",
            Role::Admin => "admin",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decoded access token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject - the user ID.
    #[serde(alias = "id", alias = "userId")]
    pub sub: String,
    pub role: Role,
    /// Expiration timestamp (seconds since epoch).
    pub exp: i64,
    /// Issued-at timestamp (seconds since epoch).
    #[serde(default)]
    pub iat: Option<i64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Claims {
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// A token is expired at and after its `exp` instant.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn time_until_expiry_at(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at() - now
    }

    /// Whether the remaining lifetime is positive but below `threshold`.
    ///
    /// Already-expired tokens are not "expiring soon"; they belong to the
    /// hard failure path.
    pub fn expires_soon_at(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        let remaining = self.time_until_expiry_at(now);
        remaining > Duration::zero() && remaining < threshold
    }

    /// Get minutes remaining until expiry (for display)
    pub fn minutes_until_expiry(&self) -> i64 {
        self.time_until_expiry_at(Utc::now()).num_minutes().max(0)
    }
}

/// Read the claims out of a compact JWS token without checking its signature.
///
/// Never fails loudly: anything that is not three dot-separated segments with
/// a base64url JSON payload carrying the required claims yields `None`.
pub fn decode(token: &str) -> Option<Claims> {
    let mut segments = token.trim().split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    if segments.next().is_some() || payload.is_empty() {
        return None;
    }

    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    serde_json::from_slice(&bytes).ok()
}
