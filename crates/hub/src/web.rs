use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::env;
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;

use crate::controller::{PumpEvent, Reading};
use crate::crops::Crop;
use crate::history::TimeRange;
use crate::recommend::{self, ScoredCrop, UserProfile};
use crate::session::{ControlError, Monitor, ReadingsView};
use crate::state::{SharedState, StatusResponse};

const DEFAULT_PUMP_LOG_LIMIT: usize = 50;

#[derive(Clone)]
pub struct AppState {
    pub status: SharedState,
    pub monitor: Monitor,
    pub catalog: Arc<Vec<Crop>>,
    pub profile: Arc<UserProfile>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/events", get(api_events))
        .route("/api/readings", get(api_readings).post(api_ingest))
        .route("/api/pump-logs", get(api_pump_logs))
        .route("/api/crops", get(api_crops))
        .route("/api/crop", post(api_select_crop))
        .route("/api/recommendations", get(api_recommendations))
        .with_state(app)
}

#[derive(Deserialize)]
struct RangeQuery {
    range: Option<String>,
}

#[derive(Deserialize)]
struct LimitQuery {
    limit: Option<usize>,
}

#[derive(Deserialize)]
struct CropRequest {
    value: String,
}

#[derive(Deserialize)]
struct IngestRequest {
    value: f64,
}

async fn api_status(State(app): State<AppState>) -> Json<StatusResponse> {
    let controller = match app.monitor.current().await {
        Ok(session) => Some(session.snapshot().await),
        Err(_) => None,
    };
    let mut status = app.status.read().await.to_status();
    status.controller = controller;
    Json(status)
}

/// Server-sent stream of session events (readings, mode switches, pump
/// events) as JSON. Ends when the session does.
async fn api_events(
    State(app): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ControlError> {
    let session = app.monitor.current().await?;
    tracing::info!(user = %session.user_id(), "event stream opened");

    let events = stream::unfold(session.subscribe(), |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => match Event::default().json_data(&event) {
                    Ok(sse) => return Some((Ok(sse), rx)),
                    Err(e) => tracing::warn!(error = %e, "failed to encode session event"),
                },
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "event stream subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn api_readings(
    State(app): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> Result<Json<ReadingsView>, ControlError> {
    let range = q
        .range
        .as_deref()
        .map(TimeRange::from_str_lossy)
        .unwrap_or_default();
    let session = app.monitor.current().await?;
    Ok(Json(session.readings(range).await))
}

async fn api_ingest(
    State(app): State<AppState>,
    Json(req): Json<IngestRequest>,
) -> Result<Response, ControlError> {
    match app.monitor.ingest_sensor(req.value).await? {
        Some(reading) => Ok((StatusCode::CREATED, Json::<Reading>(reading)).into_response()),
        None => Ok((
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "error": "reading dropped" })),
        )
            .into_response()),
    }
}

async fn api_pump_logs(
    State(app): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Result<Json<Vec<PumpEvent>>, ControlError> {
    let session = app.monitor.current().await?;
    let logs = session
        .stored_pump_logs(q.limit.unwrap_or(DEFAULT_PUMP_LOG_LIMIT))
        .await?;
    Ok(Json(logs))
}

async fn api_crops(State(app): State<AppState>) -> Json<Vec<Crop>> {
    Json(app.catalog.as_ref().clone())
}

async fn api_select_crop(
    State(app): State<AppState>,
    Json(req): Json<CropRequest>,
) -> Result<Json<Crop>, ControlError> {
    Ok(Json(app.monitor.select_crop(&req.value).await?))
}

async fn api_recommendations(
    State(app): State<AppState>,
    Query(q): Query<LimitQuery>,
) -> Json<Vec<ScoredCrop>> {
    let month = OffsetDateTime::now_utc().month();
    let limit = q.limit.unwrap_or(recommend::DEFAULT_LIMIT);
    Json(recommend::recommend(&app.profile, &app.catalog, month, limit))
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::NoSession => StatusCode::SERVICE_UNAVAILABLE,
            ControlError::UnknownCrop(_) => StatusCode::NOT_FOUND,
            ControlError::Store(e) => {
                tracing::error!(error = %format!("{e:#}"), "store read failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "json api listening");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================
