use anyhow::{Context, Result};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::coordinator::RefreshCoordinator;
use super::credentials::CredentialPersistence;
use super::refresh::{post_for_tokens, AuthEndpoints, HttpRefreshExchange, RefreshExchange};
use super::store::CredentialStore;
use super::types::{Credentials, LoginRequest, Role, SessionEvent};
use crate::error::{ClientError, RefreshExchangeError};
use crate::metrics::AuthMetrics;

/// Authentication manager
/// Owns the session: login/logout plus the shared refresh coordinator
pub struct AuthManager {
    /// Current credentials
    store: Arc<CredentialStore>,

    /// Single-flight refresh
    coordinator: RefreshCoordinator,

    /// Login/refresh endpoints
    endpoints: AuthEndpoints,

    /// HTTP client for login requests
    client: Client,
}

impl AuthManager {
    /// Create an AuthManager talking to the real refresh endpoints
    pub fn new(
        endpoints: AuthEndpoints,
        default_role: Role,
        persistence: Option<Arc<dyn CredentialPersistence>>,
        refresh_timeout: Duration,
    ) -> Result<Self> {
        let store = Arc::new(match persistence {
            Some(persistence) => CredentialStore::with_persistence(persistence, default_role),
            None => CredentialStore::new(default_role),
        });

        let exchange = Arc::new(HttpRefreshExchange::new(endpoints.clone(), refresh_timeout)?);

        Self::from_parts(
            store,
            exchange,
            endpoints,
            Arc::new(AuthMetrics::new()),
            refresh_timeout,
        )
    }

    /// Assemble from explicit parts (custom exchange, shared metrics)
    pub fn from_parts(
        store: Arc<CredentialStore>,
        exchange: Arc<dyn RefreshExchange>,
        endpoints: AuthEndpoints,
        metrics: Arc<AuthMetrics>,
        refresh_timeout: Duration,
    ) -> Result<Self> {
        let client = Client::builder()
            .timeout(refresh_timeout)
            .build()
            .context("Failed to create HTTP client")?;

        let coordinator =
            RefreshCoordinator::new(store.clone(), exchange, metrics, refresh_timeout);

        Ok(Self {
            store,
            coordinator,
            endpoints,
            client,
        })
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    pub fn coordinator(&self) -> &RefreshCoordinator {
        &self.coordinator
    }

    pub fn metrics(&self) -> &Arc<AuthMetrics> {
        self.coordinator.metrics()
    }

    pub fn endpoints(&self) -> &AuthEndpoints {
        &self.endpoints
    }

    /// Session events; `Expired` means the application must send the user
    /// back to the login screen
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.coordinator.subscribe()
    }

    /// Current session snapshot
    pub fn credentials(&self) -> Credentials {
        self.store.get()
    }

    /// Exchange email/password for a session on the role's login endpoint
    pub async fn login(&self, role: Role, email: &str, password: &str) -> Result<(), ClientError> {
        let url = self.endpoints.login_url(role);
        tracing::info!(role = %role, url = %url, "Logging in...");

        let pair = post_for_tokens(&self.client, &url, &LoginRequest { email, password })
            .await
            .map_err(|e| match e {
                RefreshExchangeError::Rejected { status, message } => {
                    ClientError::Auth { status, message }
                }
                RefreshExchangeError::Transport { kind, message } => {
                    ClientError::Network { kind, message }
                }
                other => ClientError::Internal(anyhow::anyhow!("Login failed: {}", other)),
            })?;

        let refresh_token = pair.refresh_token.ok_or_else(|| {
            ClientError::Internal(anyhow::anyhow!(
                "Login response does not contain refreshToken"
            ))
        })?;

        let generation = self.store.login(pair.access_token, refresh_token, role);
        tracing::info!(role = %role, generation, "✅ Logged in");
        self.coordinator.notify(SessionEvent::LoggedIn { role });

        Ok(())
    }

    /// Forget the session
    pub fn logout(&self) {
        self.store.clear();
        tracing::info!("Logged out");
        self.coordinator.notify(SessionEvent::LoggedOut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::SqliteCredentials;

    fn manager_for(server: &mockito::ServerGuard) -> AuthManager {
        AuthManager::new(
            AuthEndpoints::new(server.url()),
            Role::Employee,
            None,
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_login_installs_session() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/admin/login")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"email": "hr@example.com", "password": "secret"}),
            ))
            .with_status(200)
            .with_body(r#"{"accessToken":"T1","refreshToken":"R1"}"#)
            .expect(1)
            .create_async()
            .await;

        let manager = manager_for(&server);
        let mut events = manager.subscribe();
        manager
            .login(Role::Admin, "hr@example.com", "secret")
            .await
            .unwrap();

        let creds = manager.credentials();
        assert!(creds.valid);
        assert_eq!(creds.access_token, "T1");
        assert_eq!(creds.refresh_token, "R1");
        assert_eq!(creds.role, Role::Admin);
        assert_eq!(
            events.recv().await.unwrap(),
            SessionEvent::LoggedIn { role: Role::Admin }
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_rejected() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/employee/login")
            .with_status(401)
            .with_body("bad credentials")
            .create_async()
            .await;

        let manager = manager_for(&server);
        let err = manager
            .login(Role::Employee, "a@example.com", "wrong")
            .await
            .unwrap_err();

        match err {
            ClientError::Auth { status, message } => {
                assert_eq!(status, 401);
                assert_eq!(message, "bad credentials");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert!(!manager.credentials().valid);
    }

    #[tokio::test]
    async fn test_login_without_refresh_token_fails() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/employee/login")
            .with_status(200)
            .with_body(r#"{"accessToken":"T1"}"#)
            .create_async()
            .await;

        let manager = manager_for(&server);
        let err = manager
            .login(Role::Employee, "a@example.com", "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Internal(_)));
        assert!(!manager.credentials().valid);
    }

    #[tokio::test]
    async fn test_logout_clears_session() {
        let manager = AuthManager::new(
            AuthEndpoints::new("http://127.0.0.1:9"),
            Role::Employee,
            None,
            Duration::from_secs(1),
        )
        .unwrap();
        manager
            .store()
            .login("T1".to_string(), "R1".to_string(), Role::Employee);
        let mut events = manager.subscribe();

        manager.logout();

        assert!(!manager.credentials().valid);
        assert_eq!(events.recv().await.unwrap(), SessionEvent::LoggedOut);
    }

    #[tokio::test]
    async fn test_session_restored_from_persistence() {
        let db: Arc<dyn CredentialPersistence> =
            Arc::new(SqliteCredentials::open_in_memory().unwrap());
        db.save(&Credentials {
            access_token: "T1".to_string(),
            refresh_token: "R1".to_string(),
            role: Role::Admin,
            valid: true,
            generation: 0,
            updated_at: None,
        })
        .unwrap();

        let manager = AuthManager::new(
            AuthEndpoints::new("http://127.0.0.1:9"),
            Role::Employee,
            Some(db),
            Duration::from_secs(1),
        )
        .unwrap();

        let creds = manager.credentials();
        assert!(creds.valid);
        assert_eq!(creds.role, Role::Admin);
        assert_eq!(creds.access_token, "T1");
    }
}
