use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::CorsLayer;

use lamport_core::config::AddressTable;
use lamport_core::coordinator::{CoordinatorError, CoordinatorStatus, MutualExclusionCoordinator};
use lamport_core::events::{EventSink, TracingEventSink};
use lamport_core::infrastructure_in_memory::{MemoryEventLog, RecordedEvent};
use lamport_core::node::LamportNode;
use lamport_core::types::NodeId;

use crate::handlers::*;
use crate::transport::TcpTransport;

const MAX_IN_FLIGHT_REQUESTS: usize = 64;

#[derive(Clone)]
pub struct AppState {
    node: Arc<LamportNode>,
    acquire_timeout: Option<Duration>,
    history: Option<Arc<MemoryEventLog>>,
}

type ApiResult<T> = (StatusCode, Json<ApiResponse<T>>);

pub async fn run(
    table: AddressTable,
    id: NodeId,
    http_host: &str,
    http_port: u16,
    events: &str,
) -> anyhow::Result<()> {
    let (transport, inbound) = TcpTransport::bind(id, &table).await?;
    let (sink, history) = create_event_sink(events);

    let coordinator = MutualExclusionCoordinator::from_table(id, &table, Arc::new(transport), sink)?;
    let node = LamportNode::start(Arc::new(coordinator), inbound)
        .context("failed to start dispatch thread")?;

    let state = AppState {
        node: Arc::new(node),
        acquire_timeout: table.acquire_timeout(),
        history,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/events", get(list_events))
        .route("/cs/request", post(request_entry))
        .route("/cs/ready", get(ready))
        .route("/cs/enter", post(enter))
        .route("/cs/release", post(release))
        .route("/cs/acquire", post(acquire))
        .layer(ConcurrencyLimitLayer::new(MAX_IN_FLIGHT_REQUESTS))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("{}:{}", http_host, http_port);
    tracing::info!(node = %id, peers = table.len() - 1, "🔒 Lamport node {} control API on http://{}", id, addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind control API on {}", addr))?;

    axum::serve(listener, app).await.context("control API failed")?;
    Ok(())
}

/// Build the event sink named by `--events`. Returns the in-memory log too
/// when one was chosen, so `/events` can serve it.
fn create_event_sink(choice: &str) -> (Arc<dyn EventSink>, Option<Arc<MemoryEventLog>>) {
    if choice == "tracing" {
        tracing::info!("📝 Event log: tracing");
        return (Arc::new(TracingEventSink), None);
    }

    if choice == "memory" {
        tracing::info!("💾 Event log: in-memory");
        let log = Arc::new(MemoryEventLog::new());
        let sink: Arc<dyn EventSink> = log.clone();
        return (sink, Some(log));
    }

    if let Some(path) = choice.strip_prefix("sqlite:") {
        #[cfg(feature = "sqlite")]
        {
            match lamport_core::infrastructure_sqlite::SqliteEventLog::open(path) {
                Ok(log) => {
                    tracing::info!("🗄️  Event log: SQLite at {}", path);
                    return (Arc::new(log), None);
                }
                Err(e) => {
                    tracing::error!("Failed to open SQLite event log at {}: {}. Falling back to tracing.", path, e);
                    return (Arc::new(TracingEventSink), None);
                }
            }
        }
        #[cfg(not(feature = "sqlite"))]
        {
            tracing::error!("SQLite support not compiled in (ignoring {}). Falling back to tracing.", path);
            return (Arc::new(TracingEventSink), None);
        }
    }

    tracing::warn!("Unknown event log '{}', using tracing", choice);
    (Arc::new(TracingEventSink), None)
}

fn failure<T: serde::Serialize>(err: CoordinatorError) -> ApiResult<T> {
    let status = match &err {
        CoordinatorError::InvalidState { .. } => StatusCode::CONFLICT,
        CoordinatorError::QuorumTimeout { .. } => StatusCode::REQUEST_TIMEOUT,
        CoordinatorError::UnknownSender(_) => StatusCode::BAD_REQUEST,
        CoordinatorError::ClockExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(ApiResponse::err(err.to_string())))
}

// ─── Handlers ───────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<ApiResponse<HealthResponse>> {
    let coordinator = state.node.coordinator();
    Json(ApiResponse::ok(HealthResponse {
        status: "ok".to_string(),
        node_id: coordinator.id().get(),
        peers: coordinator.peers().len(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    }))
}

async fn status(State(state): State<AppState>) -> Json<ApiResponse<CoordinatorStatus>> {
    Json(ApiResponse::ok(state.node.coordinator().status()))
}

async fn list_events(State(state): State<AppState>) -> ApiResult<Vec<RecordedEvent>> {
    match &state.history {
        Some(log) => (StatusCode::OK, Json(ApiResponse::ok(log.events()))),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("event history is only kept with --events memory")),
        ),
    }
}

async fn request_entry(State(state): State<AppState>) -> ApiResult<TimestampResponse> {
    match state.node.coordinator().request_entry() {
        Ok(timestamp) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::ok(TimestampResponse { timestamp })),
        ),
        Err(e) => failure(e),
    }
}

async fn ready(State(state): State<AppState>) -> Json<ApiResponse<ReadyResponse>> {
    let coordinator = state.node.coordinator();
    Json(ApiResponse::ok(ReadyResponse {
        ready: coordinator.can_enter(),
        state: coordinator.state(),
    }))
}

async fn enter(State(state): State<AppState>) -> ApiResult<StateResponse> {
    let coordinator = state.node.coordinator();
    match coordinator.enter() {
        Ok(()) => (
            StatusCode::OK,
            Json(ApiResponse::ok(StateResponse {
                state: coordinator.state(),
            })),
        ),
        Err(e) => failure(e),
    }
}

async fn release(State(state): State<AppState>) -> ApiResult<TimestampResponse> {
    match state.node.coordinator().release_entry() {
        Ok(timestamp) => (
            StatusCode::OK,
            Json(ApiResponse::ok(TimestampResponse { timestamp })),
        ),
        Err(e) => failure(e),
    }
}

async fn acquire(
    State(state): State<AppState>,
    body: Option<Json<AcquireRequest>>,
) -> ApiResult<StateResponse> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    if let Err(e) = req.validate() {
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::err(e)));
    }

    let timeout = req
        .timeout_ms
        .map(Duration::from_millis)
        .or(state.acquire_timeout);

    // `acquire` sleeps between polls; keep it off the async workers.
    let node = Arc::clone(&state.node);
    match tokio::task::spawn_blocking(move || node.acquire(timeout)).await {
        Ok(Ok(())) => (
            StatusCode::OK,
            Json(ApiResponse::ok(StateResponse {
                state: state.node.coordinator().state(),
            })),
        ),
        Ok(Err(e)) => failure(e),
        Err(e) => {
            tracing::error!(error = %e, "acquire task failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::err("acquire task failed")),
            )
        }
    }
}
