// Authentication module
// Session storage, login/logout and single-flight token refresh

mod coordinator;
mod credentials;
mod manager;
mod refresh;
mod store;
mod types;

pub use coordinator::RefreshCoordinator;
pub use credentials::{CredentialPersistence, SqliteCredentials};
pub use manager::AuthManager;
pub use refresh::{
    join_url, AuthEndpoints, HttpRefreshExchange, RefreshExchange, DEFAULT_ADMIN_LOGIN_PATH,
    DEFAULT_ADMIN_REFRESH_PATH, DEFAULT_EMPLOYEE_LOGIN_PATH, DEFAULT_EMPLOYEE_REFRESH_PATH,
};
pub use store::CredentialStore;
pub use types::{Credentials, Role, SessionEvent, TokenPair};
