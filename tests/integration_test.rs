// Integration tests for the leave portal client
//
// These tests run the full client against an in-process mock API that
// rejects stale tokens, and check the refresh behaviour callers observe
// when many requests hit an expired token at once.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::Barrier;

use leave_portal_client::{
    auth::{AuthEndpoints, AuthManager, Role, SessionEvent},
    error::ClientError,
    http_client::{ApiClient, ApiRequest},
};

// ==================================================================================================
// Mock API
// ==================================================================================================

/// How the mock refresh endpoints answer
#[derive(Clone, Copy)]
enum RefreshBehaviour {
    /// Issue T2/R2
    Rotate,
    /// Issue T2 only, keep the refresh token
    AccessOnly,
    /// 401 invalid refresh token
    Reject,
    /// Issue T2 but keep rejecting it on the API
    RotateButStillUnauthorized,
}

struct MockApi {
    /// Requests carrying the stale token wait here so they all fail together
    stale_barrier: Barrier,
    refresh_behaviour: RefreshBehaviour,
    employee_refreshes: AtomicUsize,
    admin_refreshes: AtomicUsize,
    /// Authorization header of every API request, in arrival order
    seen_authorization: Mutex<Vec<String>>,
}

impl MockApi {
    fn new(concurrent_stale: usize, refresh_behaviour: RefreshBehaviour) -> Arc<Self> {
        Arc::new(Self {
            stale_barrier: Barrier::new(concurrent_stale),
            refresh_behaviour,
            employee_refreshes: AtomicUsize::new(0),
            admin_refreshes: AtomicUsize::new(0),
            seen_authorization: Mutex::new(Vec::new()),
        })
    }

    fn refreshes(&self) -> usize {
        self.employee_refreshes.load(Ordering::SeqCst) + self.admin_refreshes.load(Ordering::SeqCst)
    }

    fn count_authorization(&self, value: &str) -> usize {
        self.seen_authorization
            .lock()
            .unwrap()
            .iter()
            .filter(|v| v.as_str() == value)
            .count()
    }
}

async fn handle_balance(State(api): State<Arc<MockApi>>, headers: HeaderMap) -> Response {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    api.seen_authorization
        .lock()
        .unwrap()
        .push(authorization.clone());

    match authorization.as_str() {
        "Bearer T1" => {
            api.stale_barrier.wait().await;
            (StatusCode::UNAUTHORIZED, "token expired").into_response()
        }
        "Bearer T2" => match api.refresh_behaviour {
            RefreshBehaviour::RotateButStillUnauthorized => {
                (StatusCode::UNAUTHORIZED, "account locked").into_response()
            }
            _ => Json(json!({"annual": 12, "sick": 5})).into_response(),
        },
        _ => (StatusCode::UNAUTHORIZED, "missing token").into_response(),
    }
}

async fn handle_refresh(api: &MockApi, body: Value) -> Response {
    if body.get("refreshToken").and_then(Value::as_str) != Some("R1") {
        return (StatusCode::BAD_REQUEST, "unknown refresh token").into_response();
    }

    // Slow enough that late 401s find the refresh still in flight
    tokio::time::sleep(Duration::from_millis(50)).await;

    match api.refresh_behaviour {
        RefreshBehaviour::Rotate | RefreshBehaviour::RotateButStillUnauthorized => {
            Json(json!({"accessToken": "T2", "refreshToken": "R2"})).into_response()
        }
        RefreshBehaviour::AccessOnly => Json(json!({"accessToken": "T2"})).into_response(),
        RefreshBehaviour::Reject => {
            (StatusCode::UNAUTHORIZED, "refresh token revoked").into_response()
        }
    }
}

async fn handle_employee_refresh(
    State(api): State<Arc<MockApi>>,
    Json(body): Json<Value>,
) -> Response {
    api.employee_refreshes.fetch_add(1, Ordering::SeqCst);
    handle_refresh(&api, body).await
}

async fn handle_admin_refresh(
    State(api): State<Arc<MockApi>>,
    Json(body): Json<Value>,
) -> Response {
    api.admin_refreshes.fetch_add(1, Ordering::SeqCst);
    handle_refresh(&api, body).await
}

async fn handle_not_found() -> Response {
    (StatusCode::NOT_FOUND, "no such leave request").into_response()
}

/// Start the mock API and return its base URL
async fn start_mock_api(api: Arc<MockApi>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let app = Router::new()
        .route("/leave/balance", get(handle_balance))
        .route("/leave/requests/404", get(handle_not_found))
        .route("/employee/refresh-token", post(handle_employee_refresh))
        .route("/admin/refresh-token", post(handle_admin_refresh))
        .with_state(api);

    tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    format!("http://127.0.0.1:{}", port)
}

// ==================================================================================================
// Test Helpers
// ==================================================================================================

async fn signed_in_client(api: Arc<MockApi>, role: Role) -> ApiClient {
    let base_url = start_mock_api(api).await;

    let auth_manager = Arc::new(
        AuthManager::new(
            AuthEndpoints::new(base_url.clone()),
            Role::Employee,
            None,
            Duration::from_secs(5),
        )
        .expect("Failed to create auth manager"),
    );
    auth_manager
        .store()
        .login("T1".to_string(), "R1".to_string(), role);

    ApiClient::new(auth_manager, base_url, 20, 5, 10).expect("Failed to create HTTP client")
}

async fn send_concurrently(
    client: &Arc<ApiClient>,
    count: usize,
) -> Vec<Result<reqwest::Response, ClientError>> {
    let handles: Vec<_> = (0..count)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.send(ApiRequest::get("/leave/balance")).await })
        })
        .collect();

    let mut results = Vec::with_capacity(count);
    for handle in handles {
        results.push(handle.await.expect("request task panicked"));
    }
    results
}

// ==================================================================================================
// Refresh Scenarios
// ==================================================================================================

#[tokio::test]
async fn test_five_concurrent_401s_share_one_refresh() {
    let api = MockApi::new(5, RefreshBehaviour::Rotate);
    let client = Arc::new(signed_in_client(api.clone(), Role::Employee).await);

    let results = send_concurrently(&client, 5).await;

    for result in results {
        let response = result.expect("request should succeed after refresh");
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["annual"], 12);
    }

    assert_eq!(api.refreshes(), 1);
    assert_eq!(api.count_authorization("Bearer T1"), 5);
    assert_eq!(api.count_authorization("Bearer T2"), 5);

    let creds = client.auth_manager().credentials();
    assert_eq!(creds.access_token, "T2");
    assert_eq!(creds.refresh_token, "R2");
    assert!(creds.valid);
    assert!(!client.auth_manager().coordinator().is_refreshing());
    assert_eq!(client.auth_manager().coordinator().queued(), 0);
}

#[tokio::test]
async fn test_ten_concurrent_401s_single_flight() {
    let api = MockApi::new(10, RefreshBehaviour::Rotate);
    let client = Arc::new(signed_in_client(api.clone(), Role::Employee).await);

    let results = send_concurrently(&client, 10).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(api.refreshes(), 1);

    let snapshot = client.auth_manager().metrics().snapshot();
    assert_eq!(snapshot.refreshes_started, 1);
    assert_eq!(snapshot.refreshes_succeeded, 1);
    assert_eq!(snapshot.total_requests, 10);
    // Every call either waited on the cycle or found the token already rotated
    assert_eq!(snapshot.calls_resumed + snapshot.stale_token_retries, 10);
}

#[tokio::test]
async fn test_failed_refresh_expires_all_callers() {
    let api = MockApi::new(5, RefreshBehaviour::Reject);
    let client = Arc::new(signed_in_client(api.clone(), Role::Employee).await);
    let mut events = client.auth_manager().subscribe();

    let results = send_concurrently(&client, 5).await;

    for result in results {
        assert!(matches!(result, Err(ClientError::SessionExpired)));
    }

    assert_eq!(api.refreshes(), 1);
    assert_eq!(api.count_authorization("Bearer T2"), 0);
    assert!(!client.auth_manager().credentials().valid);

    // One termination signal for the whole cycle
    assert!(matches!(
        events.recv().await.unwrap(),
        SessionEvent::Expired { .. }
    ));
    assert!(events.try_recv().is_err());

    // Later calls go out unauthenticated and fail without another refresh
    let err = client
        .send(ApiRequest::get("/leave/balance"))
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::SessionExpired));
    assert_eq!(api.refreshes(), 1);
}

#[tokio::test]
async fn test_retried_call_still_unauthorized() {
    let api = MockApi::new(1, RefreshBehaviour::RotateButStillUnauthorized);
    let client = signed_in_client(api.clone(), Role::Employee).await;

    let err = client
        .send(ApiRequest::get("/leave/balance"))
        .await
        .unwrap_err();

    match err {
        ClientError::Auth { status, message } => {
            assert_eq!(status, 401);
            assert_eq!(message, "account locked");
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(api.refreshes(), 1);
    assert_eq!(api.count_authorization("Bearer T2"), 1);
}

#[tokio::test]
async fn test_admin_session_uses_admin_endpoint() {
    let api = MockApi::new(3, RefreshBehaviour::Rotate);
    let client = Arc::new(signed_in_client(api.clone(), Role::Admin).await);

    let results = send_concurrently(&client, 3).await;

    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(api.admin_refreshes.load(Ordering::SeqCst), 1);
    assert_eq!(api.employee_refreshes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_partial_refresh_keeps_refresh_token() {
    let api = MockApi::new(2, RefreshBehaviour::AccessOnly);
    let client = Arc::new(signed_in_client(api.clone(), Role::Employee).await);

    let results = send_concurrently(&client, 2).await;

    assert!(results.iter().all(|r| r.is_ok()));
    let creds = client.auth_manager().credentials();
    assert_eq!(creds.access_token, "T2");
    assert_eq!(creds.refresh_token, "R1");
}

#[tokio::test]
async fn test_business_errors_do_not_refresh() {
    let api = MockApi::new(1, RefreshBehaviour::Rotate);
    let client = signed_in_client(api.clone(), Role::Employee).await;

    let response = client
        .send(ApiRequest::get("/leave/requests/404"))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(response.text().await.unwrap(), "no such leave request");
    assert_eq!(api.refreshes(), 0);
}
