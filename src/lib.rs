// Leave portal API client - library root

pub mod auth;
pub mod config;
pub mod error;
pub mod http_client;
pub mod metrics;

pub use auth::{AuthManager, Credentials, Role, SessionEvent};
pub use error::{ClientError, Result};
pub use http_client::{ApiClient, ApiRequest};
