use std::sync::Arc;
use std::time::Instant;

use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, patch};
use axum::{Json, Router};
use serde::Serialize;
use tracing::{Instrument, Span};
use ulid::Ulid;
use urgent_contracts::{
    DeclareRequest, Incident, ListResponse, PlanBRequest, PlanBResponse, ResolveRequest,
    ResolveResponse, UrgentQuery,
};
use urgent_store::{IncidentRepository, Inventory, OperatorDirectory, PgStore};

use crate::config::{ServiceConfig, StartupError};
use crate::credentials::CredentialVerifier;
use crate::lifecycle::{LifecycleEngine, LifecycleError};
use crate::notifier::Notifier;

mod events;

#[derive(Clone)]
pub struct AppState {
    engine: LifecycleEngine,
    notifier: Notifier,
}

impl AppState {
    /// Must be called inside a tokio runtime; it spawns the notifier task.
    pub fn new(
        incidents: Arc<dyn IncidentRepository>,
        inventory: Arc<dyn Inventory>,
        directory: Arc<dyn OperatorDirectory>,
        event_buffer: usize,
    ) -> Self {
        let (publisher, notifier, _task) = Notifier::start(event_buffer);
        let engine = LifecycleEngine::new(
            incidents,
            inventory,
            CredentialVerifier::new(directory),
            publisher,
        );
        Self { engine, notifier }
    }

    pub fn from_store(store: PgStore, event_buffer: usize) -> Self {
        let store = Arc::new(store);
        Self::new(store.clone(), store.clone(), store, event_buffer)
    }

    pub fn engine(&self) -> &LifecycleEngine {
        &self.engine
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn connect_store(config: &ServiceConfig) -> Result<PgStore, StartupError> {
    let store = PgStore::connect(&config.db_url, config.store_options())
        .await
        .map_err(|err| StartupError {
            code: "ERR_DB_UNAVAILABLE",
            message: format!("failed to connect to database: {}", err),
        })?;

    if config.run_migrations {
        store.migrate().await.map_err(|err| StartupError {
            code: "ERR_DB_MIGRATION",
            message: format!("failed to apply migrations: {}", err),
        })?;
    }

    Ok(store)
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics))
        .route("/urgent", get(list_urgents).post(declare_urgents))
        .route("/urgent/machines", get(list_machines))
        .route("/urgent/planb", patch(set_plan_b))
        .route("/urgent/resolve", patch(resolve_urgents))
        .route("/urgent/events", get(events::stream_events))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn list_urgents(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<UrgentQuery>, QueryRejection>,
) -> Result<Json<ListResponse<Incident>>, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "urgent.list",
        request_id = %request_id,
        count = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let Query(query) = query.map_err(|_| invalid_query())?;
        let incidents = state
            .engine
            .list(&query)
            .await
            .map_err(lifecycle_error_response)?;
        Span::current().record("count", incidents.len());
        Ok(Json(ListResponse::new(incidents)))
    }
    .instrument(span.clone())
    .await;

    finish(&span, "/urgent", "GET", StatusCode::OK, started, result)
}

async fn list_machines(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<UrgentQuery>, QueryRejection>,
) -> Result<Json<ListResponse<String>>, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "urgent.machines",
        request_id = %request_id,
        count = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let Query(query) = query.map_err(|_| invalid_query())?;
        let machines = state
            .engine
            .machines(&query)
            .await
            .map_err(lifecycle_error_response)?;
        Span::current().record("count", machines.len());
        Ok(Json(ListResponse::new(machines)))
    }
    .instrument(span.clone())
    .await;

    finish(
        &span,
        "/urgent/machines",
        "GET",
        StatusCode::OK,
        started,
        result,
    )
}

async fn declare_urgents(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<DeclareRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ListResponse<Incident>>), ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "urgent.declare",
        request_id = %request_id,
        count = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let Json(req) = req.map_err(|_| invalid_body())?;
        let created = state
            .engine
            .declare(req)
            .await
            .map_err(lifecycle_error_response)?;
        Span::current().record("count", created.len());
        Ok((StatusCode::CREATED, Json(ListResponse::new(created))))
    }
    .instrument(span.clone())
    .await;

    finish(
        &span,
        "/urgent",
        "POST",
        StatusCode::CREATED,
        started,
        result,
    )
}

async fn set_plan_b(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<PlanBRequest>, JsonRejection>,
) -> Result<Json<PlanBResponse>, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "urgent.plan_b",
        request_id = %request_id,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let Json(req) = req.map_err(|_| invalid_body())?;
        let response = state
            .engine
            .set_plan_b(req)
            .await
            .map_err(lifecycle_error_response)?;
        Ok(Json(response))
    }
    .instrument(span.clone())
    .await;

    finish(
        &span,
        "/urgent/planb",
        "PATCH",
        StatusCode::OK,
        started,
        result,
    )
}

async fn resolve_urgents(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<ResolveRequest>, JsonRejection>,
) -> Result<Json<ResolveResponse>, ApiError> {
    let request_id = extract_request_id(&headers);
    let span = tracing::info_span!(
        "urgent.resolve",
        request_id = %request_id,
        count = tracing::field::Empty,
        skipped = tracing::field::Empty,
        latency_ms = tracing::field::Empty,
        outcome = tracing::field::Empty,
    );
    let started = Instant::now();

    let result = async move {
        let Json(req) = req.map_err(|_| invalid_body())?;
        let response = state
            .engine
            .resolve(req)
            .await
            .map_err(lifecycle_error_response)?;
        Span::current().record("count", response.count);
        Span::current().record("skipped", response.skipped.len());
        Ok(Json(response))
    }
    .instrument(span.clone())
    .await;

    finish(
        &span,
        "/urgent/resolve",
        "PATCH",
        StatusCode::OK,
        started,
        result,
    )
}

fn finish<T>(
    span: &Span,
    route: &'static str,
    method: &'static str,
    ok_status: StatusCode,
    started: Instant,
    result: Result<T, ApiError>,
) -> Result<T, ApiError> {
    let status = match &result {
        Ok(_) => ok_status,
        Err((status, _)) => *status,
    };

    span.record("latency_ms", started.elapsed().as_millis() as u64);
    span.record("outcome", if status.is_success() { "ok" } else { "error" });
    span.in_scope(|| tracing::info!(status = status.as_u16(), "request completed"));

    crate::metrics::observe_http_request(route, method, status.as_u16(), started.elapsed());
    result
}

fn lifecycle_error_response(err: LifecycleError) -> ApiError {
    match err {
        LifecycleError::BadRequest(message) => {
            json_error(StatusCode::BAD_REQUEST, "ERR_BAD_REQUEST", message)
        }
        LifecycleError::MissingUnicos(missing) => {
            let (status, Json(mut body)) = json_error(
                StatusCode::BAD_REQUEST,
                "ERR_BAD_REQUEST",
                "unknown unico reference(s)",
            );
            body.missing = Some(missing);
            (status, Json(body))
        }
        LifecycleError::Unauthorized => json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_UNAUTHORIZED",
            "invalid matricule or password",
        ),
        LifecycleError::NotFound(message) => {
            json_error(StatusCode::NOT_FOUND, "ERR_NOT_FOUND", message)
        }
        LifecycleError::Internal(err) => {
            tracing::error!(error = %err, "urgent store failure");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_INTERNAL",
                "internal server error",
            )
        }
    }
}

fn invalid_body() -> ApiError {
    json_error(StatusCode::BAD_REQUEST, "ERR_BAD_REQUEST", "invalid JSON body")
}

fn invalid_query() -> ApiError {
    json_error(
        StatusCode::BAD_REQUEST,
        "ERR_BAD_REQUEST",
        "invalid query string",
    )
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-urgent-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    missing: Option<Vec<String>>,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            missing: None,
        }),
    )
}
