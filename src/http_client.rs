use anyhow::{Context, Result};
use reqwest::{Client, Method, Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use crate::auth::{join_url, AuthManager};
use crate::error::ClientError;

/// An outbound API call.
///
/// Owned rather than a built `reqwest::Request` so it can be rebuilt with a
/// fresh token for the single retry after a refresh.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Extra header. `Authorization` is owned by the client and ignored here.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// JSON body
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, ClientError> {
        let value = serde_json::to_value(body)
            .map_err(|e| ClientError::InvalidRequest(format!("body is not valid JSON: {}", e)))?;
        self.body = Some(value);
        Ok(self)
    }
}

/// Which try of a logical call this is. A call gets at most one
/// `AfterRefresh` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attempt {
    First,
    AfterRefresh,
}

/// Outcome of one attempt on the wire
enum Dispatched {
    /// Anything that is not an authorization failure
    Passed(Response),
    /// 401/403, with the credential generation the attempt carried
    Unauthorized {
        status: u16,
        message: String,
        generation: u64,
    },
}

/// True for the statuses that trigger the refresh flow
pub fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

/// HTTP client for the leave portal API with bearer-token handling
pub struct ApiClient {
    /// Shared HTTP client with connection pooling
    client: Client,

    /// Session and refresh coordination
    auth_manager: Arc<AuthManager>,

    /// API base URL
    base_url: String,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(
        auth_manager: Arc<AuthManager>,
        base_url: impl Into<String>,
        max_connections: usize,
        connect_timeout: u64,
        request_timeout: u64,
    ) -> Result<Self> {
        let client = Client::builder()
            .pool_max_idle_per_host(max_connections)
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            auth_manager,
            base_url: base_url.into(),
        })
    }

    pub fn auth_manager(&self) -> &Arc<AuthManager> {
        &self.auth_manager
    }

    /// Send a request with the current access token.
    ///
    /// - 401/403: hands over to the refresh coordinator, then retries once
    /// - transport failure: `ClientError::Network`, no refresh
    /// - anything else, including 4xx/5xx business errors: returned as is
    pub async fn send(&self, request: ApiRequest) -> Result<Response, ClientError> {
        let metrics = self.auth_manager.metrics();
        metrics.record_request();

        let request_id = uuid::Uuid::new_v4().to_string()[..8].to_string();
        let span = tracing::debug_span!(
            "api_call",
            request_id = %request_id,
            method = %request.method,
            path = %request.path
        );

        let result = self.send_with_refresh(&request).instrument(span).await;
        if let Err(ref e) = result {
            metrics.record_error(e.kind());
        }
        result
    }

    async fn send_with_refresh(&self, request: &ApiRequest) -> Result<Response, ClientError> {
        let generation = match self.dispatch(request, Attempt::First).await? {
            Dispatched::Passed(response) => return Ok(response),
            Dispatched::Unauthorized {
                status, generation, ..
            } => {
                tracing::warn!(
                    status,
                    method = %request.method,
                    path = %request.path,
                    "Received {}, waiting for fresh token",
                    status
                );
                generation
            }
        };

        self.auth_manager
            .coordinator()
            .await_fresh_token(generation)
            .await?;

        match self.dispatch(request, Attempt::AfterRefresh).await? {
            Dispatched::Passed(response) => Ok(response),
            Dispatched::Unauthorized {
                status, message, ..
            } => {
                tracing::error!(
                    status,
                    method = %request.method,
                    path = %request.path,
                    response_body = %message,
                    "Request rejected again after token refresh"
                );
                Err(ClientError::Auth { status, message })
            }
        }
    }

    /// Build and execute one attempt
    async fn dispatch(
        &self,
        request: &ApiRequest,
        attempt: Attempt,
    ) -> Result<Dispatched, ClientError> {
        let creds = self.auth_manager.store().get();
        let url = join_url(&self.base_url, &request.path);

        let mut builder = self.client.request(request.method.clone(), &url);
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        for (name, value) in &request.headers {
            if name.eq_ignore_ascii_case("authorization") {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.json(body);
        }
        if creds.valid {
            builder = builder.bearer_auth(&creds.access_token);
        }

        let req = builder
            .build()
            .map_err(|e| ClientError::InvalidRequest(e.to_string()))?;

        tracing::debug!(
            method = %request.method,
            url = %url,
            ?attempt,
            authenticated = creds.valid,
            generation = creds.generation,
            "Sending HTTP request"
        );

        let response = self.client.execute(req).await.map_err(|e| {
            let err = ClientError::from_transport(&e);
            tracing::warn!(
                error_kind = err.kind(),
                error = %e,
                url = %url,
                ?attempt,
                "HTTP request error"
            );
            err
        })?;

        let status = response.status();
        tracing::debug!(status = %status, ?attempt, "Received HTTP response");

        if is_auth_failure(status) {
            let message = response.text().await.unwrap_or_default();
            return Ok(Dispatched::Unauthorized {
                status: status.as_u16(),
                message,
                generation: creds.generation,
            });
        }

        Ok(Dispatched::Passed(response))
    }
}
