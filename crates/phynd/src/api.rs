use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::Path;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::response::Response;
use axum::routing::get;
use axum::routing::post;
use axum::Json;
use axum::Router;
use chrono::DateTime;
use chrono::Utc;
use phyn_client::Device;
use serde::Deserialize;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::cache::CacheEntry;
use crate::cache::EntityStateCache;
use crate::coordinator::Coordinator;
use crate::coordinator::PollStatus;
use crate::dispatcher::CommandDispatcher;
use crate::dispatcher::CommandError;
use crate::dispatcher::CommandRecord;
use crate::entity::descriptors;
use crate::entity::entity_states;
use crate::entity::render;
use crate::entity::EntityState;
use crate::entity::UnitSystem;
use crate::registry::DeviceRegistry;
use crate::snapshot::Snapshot;

/// Response for the /v1/ping endpoint
#[derive(Serialize)]
struct PingResponse {
    status: String,
}

/// Response for the /v1/info endpoint
#[derive(Serialize)]
struct InfoResponse {
    version: String,
    hostname: String,
}

#[derive(Serialize)]
struct StatusResponse {
    devices: usize,
    pending_commands: usize,
    poll: Arc<PollStatus>,
}

#[derive(Serialize)]
struct DeviceSummary {
    #[serde(flatten)]
    device: Arc<Device>,
    captured_at: Option<DateTime<Utc>>,
    stale: bool,
}

#[derive(Serialize)]
struct DeviceDetail {
    #[serde(flatten)]
    device: Arc<Device>,
    state: Option<CacheEntry>,
    entities: Vec<EntityState>,
}

#[derive(Debug, Deserialize)]
struct CommandRequest {
    attribute: String,
    value: String,
}

#[derive(Serialize)]
struct CommandResponse {
    device_id: String,
    attribute: String,
    value: String,
    snapshot: Option<Arc<Snapshot>>,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

/// An error rendered as a JSON body.
struct ApiFailure(StatusCode, String);

impl IntoResponse for ApiFailure {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorResponse { error: self.1 })).into_response()
    }
}

impl From<CommandError> for ApiFailure {
    fn from(e: CommandError) -> Self {
        let status = match &e {
            CommandError::Unsupported { .. } | CommandError::InvalidValue { .. } => {
                StatusCode::BAD_REQUEST
            }
            CommandError::UnknownDevice(_) => StatusCode::NOT_FOUND,
            CommandError::Auth(_) => StatusCode::UNAUTHORIZED,
            CommandError::Rejected(_) => StatusCode::CONFLICT,
            CommandError::Transient(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiFailure(status, e.to_string())
    }
}

/// Shared application state
pub struct AppState {
    pub version: &'static str,
    pub registry: Arc<DeviceRegistry>,
    pub cache: Arc<EntityStateCache>,
    pub coordinator: Arc<Coordinator>,
    pub dispatcher: Arc<CommandDispatcher>,
    pub units: UnitSystem,
}

/// Handler for GET /v1/ping
#[tracing::instrument]
async fn ping() -> impl IntoResponse {
    tracing::debug!("Handling /v1/ping request");
    (
        StatusCode::OK,
        Json(PingResponse {
            status: "ok".to_string(),
        }),
    )
}

/// Handler for GET /v1/info
#[tracing::instrument(skip(state))]
async fn info(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    Json(InfoResponse {
        version: state.version.to_string(),
        hostname,
    })
}

#[tracing::instrument(skip(state))]
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StatusResponse {
        devices: state.registry.len(),
        pending_commands: state.dispatcher.pending_count(),
        poll: state.coordinator.status(),
    })
}

#[tracing::instrument(skip(state))]
async fn list_devices(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let entries = state.cache.entries();
    let devices: Vec<_> = state
        .registry
        .list()
        .into_iter()
        .map(|device| {
            let entry = entries.get(&device.id);
            DeviceSummary {
                captured_at: entry.map(|e| e.snapshot.captured_at),
                stale: entry.is_some_and(|e| e.stale),
                device,
            }
        })
        .collect();
    Json(devices)
}

#[tracing::instrument(skip(state))]
async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
) -> Result<Json<DeviceDetail>, ApiFailure> {
    let Some(device) = state.registry.get(&device_id) else {
        return Err(ApiFailure(
            StatusCode::NOT_FOUND,
            format!("Unknown device {}", device_id),
        ));
    };

    let entry = state.cache.entry(&device_id);
    let entities = descriptors(&device, state.units)
        .iter()
        .map(|d| render(d, entry.as_ref(), state.units))
        .collect();

    Ok(Json(DeviceDetail {
        device,
        state: entry,
        entities,
    }))
}

#[tracing::instrument(skip(state))]
async fn list_entities(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(entity_states(&state.registry, &state.cache, state.units))
}

#[tracing::instrument(skip(state))]
async fn list_commands(State(state): State<Arc<AppState>>) -> Json<Vec<CommandRecord>> {
    Json(state.dispatcher.commands())
}

/// Handler for POST /v1/devices/:device_id/commands
#[tracing::instrument(skip(state))]
async fn send_command(
    State(state): State<Arc<AppState>>,
    Path(device_id): Path<String>,
    Json(request): Json<CommandRequest>,
) -> Result<Json<CommandResponse>, ApiFailure> {
    state
        .dispatcher
        .execute(&device_id, &request.attribute, &request.value)
        .await?;

    Ok(Json(CommandResponse {
        snapshot: state.cache.get(&device_id),
        device_id,
        attribute: request.attribute,
        value: request.value,
    }))
}

/// Create the API router with all endpoints
fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/info", get(info))
        .route("/v1/status", get(status))
        .route("/v1/devices", get(list_devices))
        .route("/v1/devices/:device_id", get(get_device))
        .route("/v1/devices/:device_id/commands", post(send_command))
        .route("/v1/entities", get(list_entities))
        .route("/v1/commands", get(list_commands))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP API server
///
/// Binds to `listen:port` and serves until `shutdown_rx` fires.
pub async fn serve(
    listen: String,
    port: u16,
    state: Arc<AppState>,
    shutdown_rx: tokio::sync::oneshot::Receiver<()>,
) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr: SocketAddr = format!("{}:{}", listen, port).parse()?;
    tracing::info!("Starting HTTP API server on {}", addr);

    let listener = TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_rx.await.ok();
            tracing::info!("HTTP API server shutting down gracefully");
        })
        .await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::Request;
    use chrono::Utc;
    use phyn_client::ApiError;
    use serde_json::json;
    use serde_json::Value;
    use tower::ServiceExt;

    use super::*;
    use crate::coordinator::PollSettings;
    use crate::mock::MockRemoteClient;
    use crate::snapshot::Metric;
    use crate::snapshot::ValveState;

    struct Harness {
        client: Arc<MockRemoteClient>,
        router: Router,
    }

    fn harness() -> Harness {
        let client = Arc::new(MockRemoteClient::new().with_plus("D").with_water_sensor("W"));
        let cache = Arc::new(EntityStateCache::new());
        let registry = Arc::new(DeviceRegistry::new());
        registry.replace(client.devices.lock().unwrap().clone());
        cache.put(
            "D",
            Snapshot::new(Utc::now())
                .with(Metric::ValveState, ValveState::Open)
                .with(Metric::Temperature, 21.5)
                .with(Metric::Online, true),
        );

        let (coordinator, _events) = Coordinator::new(
            client.clone(),
            cache.clone(),
            registry.clone(),
            PollSettings::default(),
        );
        let dispatcher = CommandDispatcher::new(client.clone(), cache.clone(), registry.clone());
        let state = Arc::new(AppState {
            version: "test",
            registry,
            cache,
            coordinator: Arc::new(coordinator),
            dispatcher: Arc::new(dispatcher),
            units: UnitSystem::UsCustomary,
        });
        Harness {
            client,
            router: create_router(state),
        }
    }

    async fn call(router: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, value)
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn command(device_id: &str, attribute: &str, value: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(format!("/v1/devices/{}/commands", device_id))
            .header("content-type", "application/json")
            .body(Body::from(
                json!({"attribute": attribute, "value": value}).to_string(),
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping() {
        let h = harness();
        let (status, body) = call(&h.router, get("/v1/ping")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));
    }

    #[tokio::test]
    async fn test_info_reports_version() {
        let h = harness();
        let (status, body) = call(&h.router, get("/v1/info")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["version"], "test");
    }

    #[tokio::test]
    async fn test_status() {
        let h = harness();
        let (status, body) = call(&h.router, get("/v1/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["devices"], 2);
        assert_eq!(body["poll"]["reauth_required"], false);
    }

    #[tokio::test]
    async fn test_devices() {
        let h = harness();
        let (status, body) = call(&h.router, get("/v1/devices")).await;
        assert_eq!(status, StatusCode::OK);
        let devices = body.as_array().unwrap();
        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0]["id"], "D");
        assert_eq!(devices[0]["product_code"], "PP2");
        assert_eq!(devices[0]["stale"], false);
        assert!(devices[1]["captured_at"].is_null());
    }

    #[tokio::test]
    async fn test_device_detail() {
        let h = harness();
        let (status, body) = call(&h.router, get("/v1/devices/D")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"]["snapshot"]["values"]["valve_state"], "open");
        let valve = body["entities"]
            .as_array()
            .unwrap()
            .iter()
            .find(|e| e["unique_id"] == "D_valve_state")
            .unwrap();
        assert_eq!(valve["platform"], "valve");
        assert_eq!(valve["control"], "valve_state");

        let (status, _) = call(&h.router, get("/v1/devices/nope")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_entities() {
        let h = harness();
        let (status, body) = call(&h.router, get("/v1/entities")).await;
        assert_eq!(status, StatusCode::OK);
        let entities = body.as_array().unwrap();
        // Phyn Plus has twelve entities, the water sensor eight.
        assert_eq!(entities.len(), 20);
        let sensor = entities
            .iter()
            .find(|e| e["unique_id"] == "W_humidity")
            .unwrap();
        assert_eq!(sensor["available"], false);
    }

    #[tokio::test]
    async fn test_command_updates_cache() {
        let h = harness();
        let (status, body) = call(&h.router, command("D", "valve_state", "closed")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["snapshot"]["values"]["valve_state"], "closed");
        assert_eq!(body["snapshot"]["values"]["temperature"], 21.5);
        assert_eq!(h.client.commands(), vec!["set_valve D false"]);

        let (_, body) = call(&h.router, get("/v1/commands")).await;
        let commands = body.as_array().unwrap();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0]["device_id"], "D");
        assert_eq!(commands[0]["attribute"], "valve_state");
        assert_eq!(commands[0]["desired"], "closed");
        assert_eq!(commands[0]["status"], "confirmed");

        let (_, body) = call(&h.router, get("/v1/status")).await;
        assert_eq!(body["pending_commands"], 0);
    }

    #[tokio::test]
    async fn test_command_errors() {
        let h = harness();

        let (status, body) = call(&h.router, command("W", "valve_state", "closed")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("does not support"));

        let (status, _) = call(&h.router, command("D", "valve_state", "ajar")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = call(&h.router, command("X", "away_mode", "on")).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(h.client.commands().is_empty());

        *h.client.command_failure.lock().unwrap() = Some(ApiError::Transient("503".into()));
        let (status, _) = call(&h.router, command("D", "away_mode", "on")).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);

        *h.client.command_failure.lock().unwrap() = Some(ApiError::Auth("401".into()));
        let (status, _) = call(&h.router, command("D", "away_mode", "on")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }
}
