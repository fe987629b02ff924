//! HTTP API of the credfix dashboard
//!
//! - `GET /health` is open; every other route needs the `x-api-key` header
//!   to match `CREDFIX_API_KEY`
//! - `POST /scans` starts a quick scan in the background and returns its id
//! - `GET /scans`, `GET /scans/{id}` read finished and running scans
//! - `GET /events` streams progress events as server-sent events

use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use credfix_engine::doctor::events::BroadcastSink;
use credfix_engine::doctor::session::{DiagnosticSession, Scanner};
use credfix_engine::model::SeverityCounts;
use credfix_engine::repair::{Analysis, CredentialRepairer};
use credfix_engine::ProbeContext;
use futures_util::StreamExt;
use serde::Serialize;
use std::convert::Infallible;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::state::{ScanRecord, ScanState, ScanStore, Shared};

#[derive(Clone)]
pub struct AppState {
    pub ctx: ProbeContext,
    pub scans: Shared<ScanStore>,
    pub events: BroadcastSink,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("scan '{0}' not found")]
    ScanNotFound(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::ScanNotFound(_) => StatusCode::NOT_FOUND,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct ScanSummary {
    id: String,
    state: ScanState,
    requested_at: String, // RFC3339
    age_seconds: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    counts: Option<SeverityCounts>,
}

#[derive(Serialize)]
struct ScanDetail {
    #[serde(flatten)]
    summary: ScanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    session: Option<DiagnosticSession>,
    #[serde(skip_serializing_if = "Option::is_none")]
    analysis: Option<Analysis>,
}

fn to_summary(record: &ScanRecord) -> ScanSummary {
    let age = OffsetDateTime::now_utc() - record.requested_at;
    ScanSummary {
        id: record.id.clone(),
        state: record.state,
        requested_at: record.requested_at.format(&Rfc3339).unwrap_or_default(),
        age_seconds: age.whole_seconds().max(0),
        counts: record.session.as_ref().map(|s| s.counts),
    }
}

pub fn api_key_matches(expected: &str, provided: Option<&str>) -> bool {
    !expected.is_empty() && provided == Some(expected)
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("CREDFIX_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("CREDFIX_API_KEY not set - API access denied");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let provided = req.headers().get("x-api-key").and_then(|v| v.to_str().ok());
    if !api_key_matches(&expected, provided) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/scans", post(start_scan).get(list_scans))
        .route("/scans/{id}", get(get_scan))
        .route("/events", get(stream_events))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

/// Run one real quick scan and record it under `id`
pub async fn run_scan(app: AppState, id: String) {
    let session = Scanner::new(app.ctx.clone()).quick_scan(&id, &app.events).await;
    let analysis = CredentialRepairer::new(app.ctx.clone()).analyze_and_repair(&session.results);
    info!("Scan {} finished with {} issues", id, session.issues.len());
    app.scans.lock().complete(&id, session, analysis);
}

// POST /scans
async fn start_scan(State(app): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let id = app.scans.lock().start();
    info!("Scan {} requested", id);
    tokio::spawn(run_scan(app, id.clone()));
    (StatusCode::ACCEPTED, Json(serde_json::json!({ "id": id, "state": ScanState::Scanning })))
}

// GET /scans
async fn list_scans(State(app): State<AppState>) -> Json<Vec<ScanSummary>> {
    let list: Vec<ScanSummary> = app.scans.lock().list().map(to_summary).collect();
    Json(list)
}

// GET /scans/{id}
async fn get_scan(State(app): State<AppState>, Path(id): Path<String>) -> Result<Json<ScanDetail>, ApiError> {
    let scans = app.scans.lock();
    let Some(record) = scans.get(&id) else { return Err(ApiError::ScanNotFound(id)); };
    Ok(Json(ScanDetail {
        summary: to_summary(record),
        session: record.session.clone(),
        analysis: record.analysis.clone(),
    }))
}

// GET /events
async fn stream_events(State(app): State<AppState>) -> Response {
    let (tx, rx) = mpsc::unbounded_channel::<Event>();
    let mut events = app.events.subscribe();

    tokio::spawn(async move {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("SSE subscriber lagged, {} events dropped", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let frame = match Event::default().json_data(&event) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Could not encode progress event: {}", e);
                    continue;
                }
            };
            if tx.send(frame).is_err() {
                break;
            }
        }
    });

    let stream = UnboundedReceiverStream::new(rx).map(Ok::<Event, Infallible>);
    Sse::new(stream).keep_alive(KeepAlive::default()).into_response()
}
