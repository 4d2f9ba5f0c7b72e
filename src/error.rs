// Error handling module
// Defines the errors surfaced to callers of the API client

use thiserror::Error;

/// Errors returned by [`crate::http_client::ApiClient::send`] and friends
#[derive(Error, Debug)]
pub enum ClientError {
    /// Transport-level failure (timeout, DNS, connection reset).
    /// Never triggers a token refresh.
    #[error("Network error ({kind}): {message}")]
    Network { kind: &'static str, message: String },

    /// The API rejected the request with 401/403 and no further refresh applies
    #[error("Authentication failed: {status} - {message}")]
    Auth { status: u16, message: String },

    /// The session could not be refreshed; the user must log in again
    #[error("Session expired, please log in again")]
    SessionExpired,

    /// The request could not be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl ClientError {
    /// Build a network error from a reqwest transport failure
    pub fn from_transport(err: &reqwest::Error) -> Self {
        ClientError::Network {
            kind: transport_error_kind(err),
            message: err.to_string(),
        }
    }

    /// Short label for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            ClientError::Network { kind, .. } => *kind,
            ClientError::Auth { .. } => "auth_error",
            ClientError::SessionExpired => "session_expired",
            ClientError::InvalidRequest(_) => "invalid_request",
            ClientError::Internal(_) => "internal_error",
        }
    }

    /// True for errors that mean the user has to re-authenticate
    pub fn requires_login(&self) -> bool {
        matches!(self, ClientError::SessionExpired | ClientError::Auth { .. })
    }
}

/// Failure of the refresh-token exchange itself.
///
/// Internal to the refresh coordinator: callers only ever see
/// [`ClientError::SessionExpired`] as a consequence.
#[derive(Error, Debug, Clone)]
pub enum RefreshExchangeError {
    /// Refresh endpoint answered with a non-success status
    #[error("refresh rejected: {status} - {message}")]
    Rejected { status: u16, message: String },

    /// Refresh endpoint could not be reached
    #[error("refresh transport failure ({kind}): {message}")]
    Transport { kind: &'static str, message: String },

    /// Refresh response could not be understood
    #[error("invalid refresh response: {0}")]
    InvalidResponse(String),

    /// Exchange exceeded its deadline
    #[error("refresh timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// No refresh token is stored for this session
    #[error("no refresh token available")]
    MissingRefreshToken,

    /// Exchange implementation panicked
    #[error("refresh exchange panicked")]
    Panicked,
}

/// Categorize a reqwest error for logs and error values
pub fn transport_error_kind(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timeout"
    } else if e.is_connect() {
        "connection_failed"
    } else if e.is_request() {
        "request_error"
    } else if e.is_body() {
        "body_error"
    } else if e.is_decode() {
        "decode_error"
    } else {
        "unknown"
    }
}

/// Result type alias for client operations
pub type Result<T> = std::result::Result<T, ClientError>;
