// Refresh-token exchange against the role-specific endpoints

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use reqwest::Client;
use serde::Serialize;
use std::time::Duration;

use super::types::{RefreshRequest, Role, TokenPair, TokenResponse};
use crate::error::{transport_error_kind, RefreshExchangeError};

/// Default endpoint paths, relative to the API base URL
pub const DEFAULT_EMPLOYEE_REFRESH_PATH: &str = "/employee/refresh-token";
pub const DEFAULT_ADMIN_REFRESH_PATH: &str = "/admin/refresh-token";
pub const DEFAULT_EMPLOYEE_LOGIN_PATH: &str = "/employee/login";
pub const DEFAULT_ADMIN_LOGIN_PATH: &str = "/admin/login";

/// Where each role logs in and refreshes
#[derive(Debug, Clone)]
pub struct AuthEndpoints {
    pub base_url: String,
    pub employee_refresh_path: String,
    pub admin_refresh_path: String,
    pub employee_login_path: String,
    pub admin_login_path: String,
}

impl AuthEndpoints {
    /// Endpoints with the default paths under `base_url`
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            employee_refresh_path: DEFAULT_EMPLOYEE_REFRESH_PATH.to_string(),
            admin_refresh_path: DEFAULT_ADMIN_REFRESH_PATH.to_string(),
            employee_login_path: DEFAULT_EMPLOYEE_LOGIN_PATH.to_string(),
            admin_login_path: DEFAULT_ADMIN_LOGIN_PATH.to_string(),
        }
    }

    pub fn refresh_url(&self, role: Role) -> String {
        let path = match role {
            Role::Employee => &self.employee_refresh_path,
            Role::Admin => &self.admin_refresh_path,
        };
        join_url(&self.base_url, path)
    }

    pub fn login_url(&self, role: Role) -> String {
        let path = match role {
            Role::Employee => &self.employee_login_path,
            Role::Admin => &self.admin_login_path,
        };
        join_url(&self.base_url, path)
    }
}

/// Join a base URL and a path without doubling or dropping the slash
pub fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Exchanges a refresh token for a new token pair.
///
/// The coordinator only cares about success or failure; the wire format
/// belongs to the implementation.
pub trait RefreshExchange: Send + Sync {
    fn exchange<'a>(
        &'a self,
        role: Role,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenPair, RefreshExchangeError>>;
}

/// JSON refresh exchange over HTTP
pub struct HttpRefreshExchange {
    client: Client,
    endpoints: AuthEndpoints,
}

impl HttpRefreshExchange {
    pub fn new(endpoints: AuthEndpoints, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client, endpoints })
    }
}

impl RefreshExchange for HttpRefreshExchange {
    fn exchange<'a>(
        &'a self,
        role: Role,
        refresh_token: &'a str,
    ) -> BoxFuture<'a, Result<TokenPair, RefreshExchangeError>> {
        Box::pin(async move {
            if refresh_token.is_empty() {
                return Err(RefreshExchangeError::MissingRefreshToken);
            }

            let url = self.endpoints.refresh_url(role);
            tracing::info!(role = %role, url = %url, "Refreshing access token...");

            let pair = post_for_tokens(&self.client, &url, &RefreshRequest { refresh_token }).await?;

            tracing::info!(
                role = %role,
                rotated_refresh_token = pair.refresh_token.is_some(),
                "Access token refreshed"
            );
            Ok(pair)
        })
    }
}

/// POST a JSON body and read a token pair back
pub(crate) async fn post_for_tokens<B: Serialize + ?Sized>(
    client: &Client,
    url: &str,
    body: &B,
) -> Result<TokenPair, RefreshExchangeError> {
    let response = client
        .post(url)
        .header("Content-Type", "application/json")
        .json(body)
        .send()
        .await
        .map_err(|e| {
            let kind = transport_error_kind(&e);
            tracing::warn!(error_kind = kind, error = %e, url = %url, "Token request failed");
            RefreshExchangeError::Transport {
                kind,
                message: e.to_string(),
            }
        })?;

    let status = response.status();
    if !status.is_success() {
        let error_text = response.text().await.unwrap_or_default();
        tracing::error!(
            status = status.as_u16(),
            url = %url,
            response_body = %error_text,
            "Token endpoint rejected request"
        );
        return Err(RefreshExchangeError::Rejected {
            status: status.as_u16(),
            message: error_text,
        });
    }

    let data: TokenResponse = response
        .json()
        .await
        .map_err(|e| RefreshExchangeError::InvalidResponse(e.to_string()))?;

    if data.access_token.is_empty() {
        return Err(RefreshExchangeError::InvalidResponse(
            "response does not contain accessToken".to_string(),
        ));
    }

    Ok(data.into())
}
