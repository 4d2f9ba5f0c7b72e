// Authentication types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which side of the portal a session belongs to.
///
/// Selects the refresh and login endpoints. When nothing else is known the
/// client assumes [`Role::Employee`]; the default can be overridden with
/// `AUTH_ROLE`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[default]
    Employee,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Employee => "employee",
            Role::Admin => "admin",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "employee" | "user" => Ok(Role::Employee),
            "admin" | "administrator" => Ok(Role::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// Snapshot of the current session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_token: String,
    pub refresh_token: String,
    pub role: Role,
    /// `false` means there is no usable session until the next login
    pub valid: bool,

    /// Bumped on every mutation of the store
    #[serde(skip)]
    pub generation: u64,

    pub updated_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// An empty, invalid session
    pub fn signed_out(role: Role) -> Self {
        Self {
            access_token: String::new(),
            refresh_token: String::new(),
            role,
            valid: false,
            generation: 0,
            updated_at: None,
        }
    }

    /// Short prefix of the access token, safe for logs
    pub fn token_hint(&self) -> String {
        let end = self
            .access_token
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.access_token.len());
        format!("{}...", &self.access_token[..end])
    }
}

/// Token pair returned by a refresh or login exchange
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPair {
    pub access_token: String,
    /// Absent when the server keeps the old refresh token valid
    pub refresh_token: Option<String>,
}

/// Refresh request body
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest<'a> {
    pub refresh_token: &'a str,
}

/// Login request body
#[derive(Serialize)]
pub struct LoginRequest<'a> {
    pub email: &'a str,
    pub password: &'a str,
}

/// Token response shared by the refresh and login endpoints
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenResponse {
    #[serde(default)]
    pub access_token: String,
    pub refresh_token: Option<String>,
}

impl From<TokenResponse> for TokenPair {
    fn from(data: TokenResponse) -> Self {
        TokenPair {
            access_token: data.access_token,
            refresh_token: data.refresh_token.filter(|t| !t.is_empty()),
        }
    }
}

/// Notifications emitted to the surrounding application
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// A new session was installed by login
    LoggedIn { role: Role },
    /// Tokens were rotated by a successful refresh
    Refreshed { generation: u64 },
    /// The refresh failed; credentials were cleared and a new login is required
    Expired { reason: String },
    /// The session was cleared on request
    LoggedOut,
}
