//! HTTP handlers
//!
//! `/create` and `/delete` validate the request, turn it into an intent and
//! push it on the matching intake queue. `/logs` bridges an application's log
//! channel onto a websocket.

use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::stream::BoxStream;
use futures::{SinkExt, StreamExt};
use launchpad_controller::config::BrokerConfig;
use launchpad_controller::intent::validate_app_name;
use launchpad_controller::{DeleteIntent, DeployIntent, QueueError, RedisBroker, WorkQueue};
use rand::Rng;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tracing::{debug, error, info, warn};

const DEPLOYMENT_ID_PREFIX: &str = "dep-";
const DEPLOYMENT_ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const DEPLOYMENT_ID_SUFFIX_LEN: usize = 8;

/// Source of live log lines for one channel
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, QueueError>;
}

#[async_trait]
impl LogSource for RedisBroker {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>, QueueError> {
        RedisBroker::subscribe(self, channel).await
    }
}

#[derive(Clone)]
pub struct AppState {
    pub queue: Arc<dyn WorkQueue>,
    pub logs: Arc<dyn LogSource>,
    pub broker: Arc<BrokerConfig>,
}

#[derive(Debug, Deserialize)]
struct CreateRequest {
    gitrepo: Option<String>,
    appname: Option<String>,
    userid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DeleteRequest {
    appname: Option<String>,
    userid: Option<String>,
    #[serde(default)]
    force: bool,
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    app: Option<String>,
}

/// Request rejected or failed, rendered as `{"error": ...}`
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unavailable(err: &QueueError) -> Self {
        error!("Failed to enqueue intent: {}", err);
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: "failed to queue request".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

/// All routes; `request_timeout` bounds everything except the log stream
pub fn router(state: AppState, request_timeout: Duration) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/create", post(create_handler))
        .route("/delete", post(delete_handler))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ));

    Router::new()
        .route("/logs", get(logs_handler))
        .merge(api)
        .with_state(state)
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

fn parse<T: for<'de> Deserialize<'de>>(body: &Bytes) -> Result<T, ApiError> {
    serde_json::from_slice(body).map_err(|_| ApiError::bad_request("invalid json"))
}

/// Non-empty field, or `None`
fn present(field: Option<String>) -> Option<String> {
    field.map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

/// `dep-` followed by eight lowercase alphanumerics
#[must_use]
pub fn generate_deployment_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..DEPLOYMENT_ID_SUFFIX_LEN)
        .map(|_| char::from(DEPLOYMENT_ID_CHARSET[rng.gen_range(0..DEPLOYMENT_ID_CHARSET.len())]))
        .collect();
    format!("{DEPLOYMENT_ID_PREFIX}{suffix}")
}

async fn create_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: CreateRequest = parse(&body)?;
    let (Some(git_repo), Some(application_name), Some(user_id)) = (
        present(request.gitrepo),
        present(request.appname),
        present(request.userid),
    ) else {
        return Err(ApiError::bad_request("missing fields"));
    };

    let intent = DeployIntent {
        git_repo,
        deployment_id: generate_deployment_id(),
        application_name,
    };
    intent.validate().map_err(ApiError::bad_request)?;

    let payload = serde_json::to_string(&intent)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    state
        .queue
        .push(&state.broker.create_queue, &payload)
        .await
        .map_err(|e| ApiError::unavailable(&e))?;

    info!(
        app = %intent.application_name,
        user = %user_id,
        deployment = %intent.deployment_id,
        "Queued deploy request"
    );
    Ok(Json(json!({ "status": "ok", "depid": intent.deployment_id })))
}

async fn delete_handler(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let request: DeleteRequest = parse(&body)?;
    let (Some(application_name), Some(user_id)) =
        (present(request.appname), present(request.userid))
    else {
        return Err(ApiError::bad_request("missing fields"));
    };
    validate_app_name(&application_name).map_err(ApiError::bad_request)?;

    let intent = DeleteIntent {
        user_id,
        application_name,
        force: request.force,
    };
    let payload = serde_json::to_string(&intent)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    state
        .queue
        .push(&state.broker.delete_queue, &payload)
        .await
        .map_err(|e| ApiError::unavailable(&e))?;

    info!(app = %intent.application_name, force = intent.force, "Queued delete request");
    Ok(Json(json!({ "status": "ok" })))
}

async fn logs_handler(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let Some(app) = present(query.app) else {
        return Err(ApiError::bad_request("missing app"));
    };
    validate_app_name(&app).map_err(ApiError::bad_request)?;

    Ok(ws.on_upgrade(move |socket| stream_logs(socket, state, app)))
}

async fn stream_logs(socket: WebSocket, state: AppState, app: String) {
    let channel = state.broker.log_channel(&app);
    let mut lines = match state.logs.subscribe(&channel).await {
        Ok(lines) => lines,
        Err(e) => {
            warn!(app = %app, "Could not subscribe to {}: {}", channel, e);
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let greeting = format!("[SYSTEM] Connected to log stream for {app}...");
    if sender.send(Message::Text(greeting.into())).await.is_err() {
        return;
    }
    debug!(app = %app, "Log stream client connected");

    loop {
        tokio::select! {
            line = lines.next() => {
                let Some(line) = line else { break };
                if sender.send(Message::Text(line.into())).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_)) | Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    debug!(app = %app, "Log stream client disconnected");
}
