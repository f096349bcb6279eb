//! Progress transport: an SSE stream of [`AgentEvent`]s plus the inbound
//! start, cancel and approval signals, one-shot page analysis and the public
//! configuration.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use uuid::Uuid;

use crate::analysis::Analysis;
use crate::catalog::normalize_url;
use crate::config::ServerSettings;
use crate::controller::SessionSignals;
use crate::error::{FailureKind, StageFailure};
use crate::registry::{RegistryError, SessionRegistry};
use crate::session::Session;
use crate::types::{ActionRecord, ApprovalDecision, ApprovalRequest, SessionStatus};

const PORT_FALLBACKS: u16 = 10;

/// Emitted by a controller after every stage.
#[derive(Debug, Clone, Serialize)]
pub struct AgentEvent {
    pub session_id: Uuid,
    pub status: SessionStatus,
    pub iteration: u32,
    /// Base64 PNG, only after an observation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<String>,
    /// Log lines added since the previous event.
    pub lines: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalRequest>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StageFailure>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub record: Option<ActionRecord>,
}

impl AgentEvent {
    pub fn to_sse_event(&self) -> Event {
        let data = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        Event::default().event(self.status.as_str()).data(data)
    }
}

/// Work handed to the mission runner, which owns browser launching.
pub enum MissionCommand {
    Start {
        session: Session,
        signals: SessionSignals,
    },
    Analyze {
        goal: String,
        url: String,
        reply: oneshot::Sender<Result<Analysis, StageFailure>>,
    },
}

/// Settings a viewer may read through `GET /config`.
#[derive(Debug, Clone, Serialize)]
pub struct PublicConfig {
    pub max_iterations: u32,
    pub headless: bool,
    pub model: String,
    pub model_configured: bool,
}

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub cmd_tx: mpsc::Sender<MissionCommand>,
    pub event_tx: broadcast::Sender<AgentEvent>,
    pub public: PublicConfig,
}

#[derive(Deserialize)]
struct StartPayload {
    goal: String,
    url: String,
    #[serde(default)]
    max_iterations: Option<u32>,
}

#[derive(Deserialize)]
struct AnalyzePayload {
    goal: String,
    url: String,
}

#[derive(Deserialize)]
struct ApprovalPayload {
    approved: bool,
    #[serde(default)]
    reason: Option<String>,
}

enum ApiError {
    BadRequest(String),
    Registry(RegistryError),
    Analysis(StageFailure),
    Unavailable,
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        ApiError::Registry(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::Registry(e @ RegistryError::NotFound(_)) => (StatusCode::NOT_FOUND, e.to_string()),
            ApiError::Registry(e) => (StatusCode::CONFLICT, e.to_string()),
            ApiError::Analysis(failure) => {
                let status = match failure.kind {
                    FailureKind::NavigationFailure => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                return (status, Json(json!({ "error": failure.message, "failure": failure })))
                    .into_response();
            }
            ApiError::Unavailable => (
                StatusCode::SERVICE_UNAVAILABLE,
                "mission runner is not accepting work".to_string(),
            ),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/config", get(config_handler))
        .route("/analyze", post(analyze_handler))
        .route("/missions", post(start_handler).get(list_handler))
        .route("/missions/{id}", get(snapshot_handler))
        .route("/missions/{id}/cancel", post(cancel_handler))
        .route("/missions/{id}/approval", post(approval_handler))
        .route("/events", get(sse_handler))
        .route("/favicon.ico", get(|| async { StatusCode::NO_CONTENT }))
        .with_state(state)
}

/// Binds `host:port` (or the next free port of the following nine) and serves
/// in the background. Port 0 picks any free port.
pub async fn start_server(
    settings: &ServerSettings,
    registry: SessionRegistry,
    public: PublicConfig,
) -> std::io::Result<(mpsc::Receiver<MissionCommand>, broadcast::Sender<AgentEvent>, SocketAddr)> {
    let (cmd_tx, cmd_rx) = mpsc::channel::<MissionCommand>(16);
    let (event_tx, _) = broadcast::channel::<AgentEvent>(256);

    let state = Arc::new(AppState {
        registry,
        cmd_tx,
        event_tx: event_tx.clone(),
        public,
    });
    let app = router(state);

    let listener = bind_with_fallback(&settings.host, settings.port).await?;
    let addr = listener.local_addr()?;
    tracing::info!(target: "agent.web", %addr, "progress server listening");

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(target: "agent.web", error = %e, "progress server stopped");
        }
    });

    Ok((cmd_rx, event_tx, addr))
}

async fn bind_with_fallback(host: &str, port: u16) -> std::io::Result<TcpListener> {
    if port == 0 {
        return TcpListener::bind((host, 0)).await;
    }
    let mut last_err = None;
    for p in port..port.saturating_add(PORT_FALLBACKS) {
        match TcpListener::bind((host, p)).await {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                tracing::debug!(target: "agent.web", port = p, error = %e, "port busy");
                last_err = Some(e);
            }
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::other("no port to bind")))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "active_sessions": state.registry.active_count(),
    }))
}

async fn start_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<StartPayload>,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let goal = payload.goal.trim();
    let url = payload.url.trim();
    if goal.is_empty() || url.is_empty() {
        return Err(ApiError::BadRequest("goal and url are required".into()));
    }
    let cap = payload.max_iterations.unwrap_or(state.public.max_iterations);
    let session = Session::new(goal, normalize_url(url), cap);
    let id = session.id;
    tracing::info!(target: "agent.web", session_id = %id, goal, "mission requested");

    let signals = state.registry.create(&session);
    if state
        .cmd_tx
        .send(MissionCommand::Start { session, signals })
        .await
        .is_err()
    {
        state.registry.dispose(id);
        return Err(ApiError::Unavailable);
    }
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "id": id, "status": SessionStatus::Idle })),
    ))
}

async fn config_handler(State(state): State<Arc<AppState>>) -> Json<PublicConfig> {
    Json(state.public.clone())
}

async fn analyze_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AnalyzePayload>,
) -> Result<Json<Analysis>, ApiError> {
    let goal = payload.goal.trim();
    let url = payload.url.trim();
    if goal.is_empty() || url.is_empty() {
        return Err(ApiError::BadRequest("goal and url are required".into()));
    }
    tracing::info!(target: "agent.web", goal, url, "analysis requested");

    let (reply, outcome) = oneshot::channel();
    let command = MissionCommand::Analyze {
        goal: goal.to_string(),
        url: url.to_string(),
        reply,
    };
    if state.cmd_tx.send(command).await.is_err() {
        return Err(ApiError::Unavailable);
    }
    match outcome.await {
        Ok(Ok(analysis)) => Ok(Json(analysis)),
        Ok(Err(failure)) => Err(ApiError::Analysis(failure)),
        Err(_) => Err(ApiError::Unavailable),
    }
}

async fn list_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn snapshot_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let snapshot = state
        .registry
        .lookup(id)
        .ok_or(RegistryError::NotFound(id))?;
    Ok(Json(snapshot))
}

async fn cancel_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state.registry.cancel(id)?;
    Ok(StatusCode::ACCEPTED)
}

async fn approval_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(payload): Json<ApprovalPayload>,
) -> Result<StatusCode, ApiError> {
    let decision = if payload.approved {
        ApprovalDecision::Approve
    } else {
        ApprovalDecision::Deny {
            reason: payload.reason,
        }
    };
    tracing::info!(target: "agent.web", session_id = %id, ?decision, "approval received");
    state.registry.resolve_approval(id, decision)?;
    Ok(StatusCode::ACCEPTED)
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream =
        BroadcastStream::new(rx).filter_map(|result: Result<AgentEvent, _>| match result {
            Ok(event) => Some(Ok::<_, Infallible>(event.to_sse_event())),
            Err(_) => None,
        });
    Sse::new(stream).keep_alive(KeepAlive::default())
}
