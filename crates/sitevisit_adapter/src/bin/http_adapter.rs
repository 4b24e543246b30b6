#![forbid(unsafe_code)]

use std::{
    env,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use sitevisit_adapter::{
    AdapterError, AdapterRuntime, BulkAdapterRequest, IngestAdapterRequest,
    LocalityOverrideRequest, OpenSessionRequest, PermitAdapterRequest, PositionReportRequest,
    RecordCommandRequest, RecordListParams, RejectAdapterRequest, SessionActionRequest,
    VerifyAdapterRequest,
};
use sitevisit_kernel_contracts::geo::LocationPermission;
use sitevisit_os::session_tasks::spawn_session_ticker;
use sitevisit_os::sync_monitor::spawn_sync_poller;
use tracing_subscriber::EnvFilter;

type SharedRuntime = Arc<Mutex<AdapterRuntime>>;

#[derive(Debug, Serialize)]
struct ApiResponse<T> {
    status: &'static str,
    data: Option<T>,
    error: Option<AdapterError>,
}

#[derive(Debug, Deserialize)]
struct ConnectivityRequest {
    online: bool,
}

#[derive(Debug, Deserialize)]
struct PermissionRequest {
    permission: LocationPermission,
}

#[derive(Debug, Default, Deserialize)]
struct NowParams {
    now_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = env::var("SITEVISIT_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let addr: SocketAddr = bind.parse()?;

    let runtime = AdapterRuntime::default_from_env()?;
    let config = *runtime.config();
    let ticker = spawn_session_ticker(
        runtime.session_handle(),
        runtime.clock(),
        Duration::from_millis(config.tick_ms),
    );
    let poller = spawn_sync_poller(
        runtime.monitor_handle(),
        runtime.clock(),
        Duration::from_millis(config.sync_poll_ms),
    );
    let runtime: SharedRuntime = Arc::new(Mutex::new(runtime));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/records", get(list_records).post(ingest))
        .route("/v1/records/:record_id/history", get(record_history))
        .route("/v1/badges", get(badges))
        .route("/v1/commands/attach_permit", post(attach_permit))
        .route("/v1/commands/proceed_without_permit", post(proceed_without_permit))
        .route("/v1/commands/verify", post(verify))
        .route("/v1/commands/reject", post(reject))
        .route("/v1/commands/approve", post(approve))
        .route("/v1/commands/bulk", post(bulk))
        .route("/v1/permits", get(permit_demand).post(upload_permit))
        .route("/v1/permits/verify_state", post(verify_state_permit))
        .route("/v1/session", get(session_view).post(open_session))
        .route("/v1/session/action", post(session_action))
        .route("/v1/session/position", post(report_position))
        .route("/v1/session/permission", post(set_permission))
        .route("/v1/sync", get(sync_status).post(sync_now))
        .route("/v1/sync/connectivity", post(set_connectivity))
        .with_state(runtime);

    tracing::info!(%addr, tick_ms = config.tick_ms, sync_poll_ms = config.sync_poll_ms, "sitevisit_adapter_http listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "failed to listen for shutdown signal");
            }
        })
        .await?;
    ticker.abort();
    poller.abort();
    tracing::info!("sitevisit_adapter_http stopped");
    Ok(())
}

fn http_status(kind: &str) -> StatusCode {
    match kind {
        "BAD_REQUEST" | "VALIDATION_ERROR" | "EMPTY_SELECTION" => StatusCode::BAD_REQUEST,
        "INVALID_TRANSITION" | "PERMIT_REQUIRED" | "SESSION_ALREADY_OPEN" | "NO_OPEN_SESSION"
        | "COMPLETION_BLOCKED" => StatusCode::CONFLICT,
        "STORE_ERROR" => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn respond<T: Serialize>(result: Result<T, AdapterError>) -> (StatusCode, Json<ApiResponse<T>>) {
    match result {
        Ok(data) => (
            StatusCode::OK,
            Json(ApiResponse {
                status: "ok",
                data: Some(data),
                error: None,
            }),
        ),
        Err(err) => {
            let code = http_status(&err.kind);
            if code == StatusCode::INTERNAL_SERVER_ERROR {
                tracing::error!(kind = err.kind.as_str(), reason = err.reason.as_str(), "request failed");
            } else {
                tracing::debug!(kind = err.kind.as_str(), reason = err.reason.as_str(), "request refused");
            }
            (
                code,
                Json(ApiResponse {
                    status: "error",
                    data: None,
                    error: Some(err),
                }),
            )
        }
    }
}

fn with_runtime<T, F>(runtime: &SharedRuntime, f: F) -> (StatusCode, Json<ApiResponse<T>>)
where
    T: Serialize,
    F: FnOnce(&mut AdapterRuntime) -> Result<T, AdapterError>,
{
    let result = match runtime.lock() {
        Ok(mut runtime) => f(&mut runtime),
        Err(_) => Err(AdapterError {
            kind: "INTERNAL".to_string(),
            reason: "adapter runtime lock poisoned".to_string(),
        }),
    };
    respond(result)
}

async fn healthz(State(runtime): State<SharedRuntime>) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.health_report())
}

async fn list_records(
    State(runtime): State<SharedRuntime>,
    Query(params): Query<RecordListParams>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.list_records(params))
}

async fn ingest(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<IngestAdapterRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.ingest(req))
}

async fn record_history(
    State(runtime): State<SharedRuntime>,
    Path(record_id): Path<String>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.record_history(&record_id))
}

async fn badges(State(runtime): State<SharedRuntime>) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| Ok(rt.badges()))
}

async fn attach_permit(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<RecordCommandRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.attach_permit(req))
}

async fn proceed_without_permit(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<LocalityOverrideRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.proceed_without_permit(req))
}

async fn verify(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<VerifyAdapterRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.verify(req))
}

async fn reject(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<RejectAdapterRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.reject(req))
}

async fn approve(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<RecordCommandRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.approve(req))
}

async fn bulk(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<BulkAdapterRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.bulk(req))
}

async fn permit_demand(State(runtime): State<SharedRuntime>) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| Ok(rt.pending_permit_demand()))
}

async fn upload_permit(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<PermitAdapterRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.upload_permit(req))
}

async fn verify_state_permit(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<PermitAdapterRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.verify_state_permit(req))
}

async fn session_view(
    State(runtime): State<SharedRuntime>,
    Query(params): Query<NowParams>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.session_view(params.now_ms))
}

async fn open_session(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<OpenSessionRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.open_session(req))
}

async fn session_action(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<SessionActionRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.session_action(req))
}

async fn report_position(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<PositionReportRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.report_position(req))
}

async fn set_permission(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<PermissionRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| {
        rt.set_location_permission(req.permission);
        Ok(req.permission)
    })
}

async fn sync_status(State(runtime): State<SharedRuntime>) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.sync_status())
}

async fn sync_now(
    State(runtime): State<SharedRuntime>,
    Query(params): Query<NowParams>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.sync_now(params.now_ms))
}

async fn set_connectivity(
    State(runtime): State<SharedRuntime>,
    Json(req): Json<ConnectivityRequest>,
) -> impl axum::response::IntoResponse {
    with_runtime(&runtime, |rt| rt.set_connectivity(req.online))
}
