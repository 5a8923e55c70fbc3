//! Drives `PhynClient` against an in-process fake of the Phyn cloud.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use chrono::NaiveDate;
use phyn_client::ApiError;
use phyn_client::AuthError;
use phyn_client::ClientOptions;
use phyn_client::Credentials;
use phyn_client::PhynClient;
use phyn_client::ProductCode;
use phyn_client::RemoteClient;
use phyn_client::RetryPolicy;
use serde_json::json;
use serde_json::Value;

#[derive(Default)]
struct Fake {
    logins: AtomicUsize,
    preference_calls: AtomicUsize,
    requests: Mutex<Vec<String>>,
    home_name: Mutex<String>,
}

type FakeState = Arc<Fake>;

fn record(state: &Fake, line: String) {
    state.requests.lock().unwrap().push(line);
}

async fn auth(State(state): State<FakeState>, headers: HeaderMap, body: Bytes) -> impl IntoResponse {
    assert_eq!(
        headers.get("x-amz-target").and_then(|v| v.to_str().ok()),
        Some("AWSCognitoIdentityProviderService.InitiateAuth")
    );
    assert_eq!(
        headers.get("content-type").and_then(|v| v.to_str().ok()),
        Some("application/x-amz-json-1.1")
    );
    let body: Value = serde_json::from_slice(&body).unwrap();
    if body["ClientId"] != "client" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"__type": "ResourceNotFoundException", "message": "User pool client does not exist."})),
        );
    }
    if body["AuthParameters"]["PASSWORD"] != "correct-horse" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"__type": "NotAuthorizedException", "message": "Incorrect username or password."})),
        );
    }
    let n = state.logins.fetch_add(1, Ordering::SeqCst) + 1;
    (
        StatusCode::OK,
        Json(json!({
            "AuthenticationResult": {
                "IdToken": format!("token-{}", n),
                "RefreshToken": "refresh",
                "ExpiresIn": 3600
            }
        })),
    )
}

async fn homes(
    State(state): State<FakeState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    assert_eq!(headers.get("x-api-key").unwrap(), "key-123");
    assert_eq!(headers.get("authorization").unwrap(), "token-1");
    assert_eq!(query.get("user_id").map(String::as_str), Some("me@example.com"));
    let name = state.home_name.lock().unwrap().clone();
    Json(json!([{
        "id": "home-1",
        "name": name,
        "devices": [
            {"device_id": "pp-1", "product_code": "PP2"},
            {"device_id": "pw-1", "product_code": "PW1", "name": "Basement"},
            {"device_id": "xx-1", "product_code": "XX1"}
        ]
    }]))
}

async fn state(Path(id): Path<String>) -> impl IntoResponse {
    if id == "broken" {
        return (StatusCode::BAD_GATEWAY, Json(json!({}))).into_response();
    }
    Json(json!({
        "product_code": "PP2",
        "fw_version": "5190401",
        "online_status": {"v": "online"},
        "flow": {"v": 0.25},
        "pressure": {"v": 61.5, "mean": 60.0},
        "temperature": {"mean": 68.4},
        "sov_status": {"v": "Open"}
    }))
    .into_response()
}

async fn consumption(
    Path(id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    assert_eq!(query.get("device_id"), Some(&id));
    assert_eq!(query.get("duration").map(String::as_str), Some("2026/10/18"));
    Json(json!({"water_consumption": 42.7}))
}

async fn valve(State(state): State<FakeState>, Path((id, action)): Path<(String, String)>) -> impl IntoResponse {
    record(&state, format!("sov {} {}", id, action));
    StatusCode::OK
}

async fn preferences(State(state): State<FakeState>, Path(id): Path<String>) -> impl IntoResponse {
    // First call is rate limited.
    if state.preference_calls.fetch_add(1, Ordering::SeqCst) == 0 {
        let mut headers = HeaderMap::new();
        headers.insert("retry-after", "0".parse().unwrap());
        return (StatusCode::TOO_MANY_REQUESTS, headers).into_response();
    }
    Json(json!([
        {"device_id": id, "name": "leak_sensitivity_away_mode", "value": "true"}
    ]))
    .into_response()
}

async fn set_preferences(
    State(state): State<FakeState>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> impl IntoResponse {
    record(
        &state,
        format!("pref {} {}={}", id, body[0]["name"].as_str().unwrap(), body[0]["value"].as_str().unwrap()),
    );
    StatusCode::OK
}

async fn iot_policy(Path(user): Path<String>) -> impl IntoResponse {
    if user != "me@example.com" {
        return StatusCode::NOT_FOUND.into_response();
    }
    Json(json!({"wss_url": "wss://broker.example.com/mqtt?X-Amz-Signature=abc"})).into_response()
}

async fn firmware() -> impl IntoResponse {
    StatusCode::UNAUTHORIZED
}

async fn spawn_fake() -> (String, FakeState) {
    let fake: FakeState = Arc::new(Fake::default());
    *fake.home_name.lock().unwrap() = "Cabin".to_string();

    let app = Router::new()
        .route("/auth", post(auth))
        .route("/homes", get(homes))
        .route("/devices/:id/state", get(state))
        .route("/devices/:id/consumption/details", get(consumption))
        .route("/devices/:id/sov/:action", post(valve))
        .route("/preferences/device/:id", get(preferences).post(set_preferences))
        .route("/firmware/latestVersion/v2", get(firmware))
        .route("/users/:user/iot_policy", post(iot_policy))
        .with_state(fake.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), fake)
}

fn options(base: &str) -> ClientOptions {
    ClientOptions {
        base_url: base.to_string(),
        auth_url: format!("{}/auth", base),
        client_id: "client".to_string(),
        api_key: "key-123".to_string(),
        request_timeout: Duration::from_secs(5),
        retry: RetryPolicy {
            max_retries: 2,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
        },
    }
}

#[tokio::test]
async fn test_login_and_discovery() {
    let (base, fake) = spawn_fake().await;
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), options(&base))
        .await
        .unwrap();

    let devices = client.list_devices().await.unwrap();
    assert_eq!(devices.len(), 2);
    assert_eq!(devices[0].id, "pp-1");
    assert_eq!(devices[0].product_code, ProductCode::PhynPlus2);
    assert_eq!(devices[1].name, "Phyn Water Sensor - Basement");
    assert_eq!(fake.logins.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_bad_password_is_rejected() {
    let (base, _fake) = spawn_fake().await;
    let result = PhynClient::authenticate(Credentials::new("me@example.com", "wrong"), options(&base)).await;
    match result {
        Err(AuthError::InvalidCredentials(msg)) => assert!(msg.contains("NotAuthorizedException")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("login should have failed"),
    }
}

#[tokio::test]
async fn test_unknown_client_is_not_a_credentials_error() {
    let (base, fake) = spawn_fake().await;
    let mut opts = options(&base);
    opts.client_id = "someone-else".to_string();
    let result = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), opts).await;
    match result {
        Err(AuthError::Rejected(msg)) => assert!(msg.contains("ResourceNotFoundException")),
        Err(other) => panic!("unexpected error: {}", other),
        Ok(_) => panic!("login should have failed"),
    }
    assert_eq!(fake.logins.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reserved_home_name() {
    let (base, fake) = spawn_fake().await;
    *fake.home_name.lock().unwrap() = "Home".to_string();
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), options(&base))
        .await
        .unwrap();

    let err = client.list_devices().await.unwrap_err();
    assert!(err.is_auth(), "expected auth error, got {:?}", err);
}

#[tokio::test]
async fn test_reads_and_error_classification() {
    let (base, _fake) = spawn_fake().await;
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), options(&base))
        .await
        .unwrap();
    let devices = client.list_devices().await.unwrap();
    let plus = &devices[0];

    let averages = client.get_realtime_averages(plus).await.unwrap();
    assert_eq!(averages.pressure.unwrap().value(), Some(61.5));
    assert_eq!(averages.temperature.unwrap().value(), Some(68.4));

    let usage = client
        .get_usage(plus, NaiveDate::from_ymd_opt(2026, 10, 18).unwrap())
        .await
        .unwrap();
    assert_eq!(usage.water_consumption, 42.7);

    let broken = phyn_client::Device::new("broken", "home-1", ProductCode::PhynPlus2);
    assert!(client.get_realtime_averages(&broken).await.unwrap_err().is_transient());

    assert!(matches!(client.get_firmware(plus).await, Err(ApiError::Auth(_))));
}

#[tokio::test]
async fn test_rate_limited_request_is_retried() {
    let (base, fake) = spawn_fake().await;
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), options(&base))
        .await
        .unwrap();
    let devices = client.list_devices().await.unwrap();

    let prefs = client.get_preferences(&devices[0]).await.unwrap();
    assert_eq!(prefs.flag(phyn_client::AWAY_MODE_PREFERENCE), Some(true));
    assert_eq!(fake.preference_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_rate_limit_without_retries_is_transient() {
    let (base, _fake) = spawn_fake().await;
    let mut opts = options(&base);
    opts.retry = RetryPolicy::disabled();
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), opts)
        .await
        .unwrap();
    let devices = client.list_devices().await.unwrap();

    assert!(client.get_preferences(&devices[0]).await.unwrap_err().is_transient());
}

#[tokio::test]
async fn test_commands() {
    let (base, fake) = spawn_fake().await;
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), options(&base))
        .await
        .unwrap();
    let devices = client.list_devices().await.unwrap();
    let plus = &devices[0];

    client.set_valve(plus, false).await.unwrap();
    client.set_valve(plus, true).await.unwrap();
    client.set_away_mode(plus, true).await.unwrap();
    client.set_scheduled_leak_test(plus, false).await.unwrap();

    let requests = fake.requests.lock().unwrap().clone();
    assert_eq!(
        requests,
        vec![
            "sov pp-1 Close",
            "sov pp-1 Open",
            "pref pp-1 leak_sensitivity_away_mode=true",
            "pref pp-1 scheduler_enable=false",
        ]
    );
}

#[tokio::test]
async fn test_reauthenticate_replaces_session() {
    let (base, fake) = spawn_fake().await;
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), options(&base))
        .await
        .unwrap();
    client.reauthenticate().await.unwrap();
    assert_eq!(fake.logins.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_iot_policy_for_logged_in_user() {
    let (base, _fake) = spawn_fake().await;
    let client = PhynClient::authenticate(Credentials::new("me@example.com", "correct-horse"), options(&base))
        .await
        .unwrap();

    let policy = client.iot_policy().await.unwrap();
    assert_eq!(policy.wss_url, "wss://broker.example.com/mqtt?X-Amz-Signature=abc");
}
