use serde::{Deserialize, Serialize};

use crate::auth::Role;

/// Tokens issued by the authority after a credential or refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenPair {
    #[serde(alias = "accessToken", alias = "token")]
    pub access_token: String,
    #[serde(default, alias = "refreshToken")]
    pub refresh_token: Option<String>,
    /// Some endpoints embed the signed-in user next to the tokens
    #[serde(default, alias = "usuario")]
    pub user: Option<UserProfile>,
}

/// Cached profile of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    #[serde(alias = "_id", alias = "userId")]
    pub id: String,
    #[serde(alias = "correo")]
    pub email: String,
    #[serde(default, alias = "nombre")]
    pub name: Option<String>,
    #[serde(default, alias = "rol")]
    pub role: Option<Role>,
}

impl UserProfile {
    /// Name for display, falling back to the email address
    pub fn display_name(&self) -> &str {
        self.name.as_deref().filter(|n| !n.trim().is_empty()).unwrap_or(&self.email)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
}
