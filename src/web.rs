//! HTTP control surface and the live event stream.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use futures::{Stream, StreamExt};
use gallery_model::{ActiveArt, ConnectionState, FilterId, ImageId, SlideshowConfig};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broadcast::EventBroadcaster;
use crate::cleanup::{CleanupReport, DeviceCleaner, DeviceFile};
use crate::device::DeviceLink;
use crate::error::{DeviceError, ErrorClass, SlideshowError};
use crate::scheduler::SlideshowHandle;
use crate::settings::SettingsStore;

#[derive(Clone)]
pub struct ApiState {
    pub link: DeviceLink,
    pub slideshow: SlideshowHandle,
    pub settings: Arc<dyn SettingsStore>,
    pub events: EventBroadcaster,
    pub cleaner: DeviceCleaner,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/events", get(event_stream))
        .route("/api/status", get(status))
        .route("/api/slideshow", get(get_slideshow).put(put_slideshow))
        .route("/api/slideshow/next", post(next_image))
        .route("/api/images/{id}/activate", post(activate_image))
        .route("/api/device/reconnect", post(reconnect_device))
        .route("/api/device/files", get(list_device_files))
        .route("/api/device/cleanup", post(cleanup_device))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ApiState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind API listener on {addr}"))?;
    info!(?addr, "API server listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .context("api server exited")?;
    Ok(())
}

/// Error body: `{"error": "...", "class": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
    class: Option<ErrorClass>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let class = self.class.map(|class| format!("{class:?}"));
        (
            self.status,
            Json(json!({ "error": self.message, "class": class })),
        )
            .into_response()
    }
}

fn status_for_class(class: ErrorClass) -> StatusCode {
    match class {
        ErrorClass::Connectivity => StatusCode::SERVICE_UNAVAILABLE,
        ErrorClass::Rejection => StatusCode::UNPROCESSABLE_ENTITY,
        ErrorClass::Capacity => StatusCode::INSUFFICIENT_STORAGE,
        ErrorClass::NoEligibleImages | ErrorClass::StaleContent => StatusCode::CONFLICT,
    }
}

impl From<SlideshowError> for ApiError {
    fn from(err: SlideshowError) -> Self {
        let class = err.class();
        let status = match &err {
            SlideshowError::UnknownImage(_) => StatusCode::NOT_FOUND,
            SlideshowError::Superseded => StatusCode::CONFLICT,
            SlideshowError::Stopped => StatusCode::SERVICE_UNAVAILABLE,
            SlideshowError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => class.map(status_for_class).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
        };
        Self {
            status,
            message: err.to_string(),
            class,
        }
    }
}

impl From<DeviceError> for ApiError {
    fn from(err: DeviceError) -> Self {
        let class = err.class();
        Self {
            status: status_for_class(class),
            message: err.to_string(),
            class: Some(class),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
            class: None,
        }
    }
}

async fn event_stream(
    State(state): State<ApiState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let subscription = state.events.subscribe();
    info!(subscriber = subscription.id(), "event stream opened");
    let stream = subscription.into_stream().map(|event| {
        let sse = Event::default()
            .event(event.name())
            .json_data(&event)
            .unwrap_or_else(|_| Event::default().event(event.name()));
        Ok(sse)
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)))
}

#[derive(Debug, Serialize)]
struct StatusBody {
    connection: ConnectionState,
    active: Option<ActiveArt>,
    slideshow: SlideshowConfig,
    /// Seconds until the timer fires; absent while the slideshow is off.
    next_tick_in: Option<u64>,
    subscribers: usize,
}

async fn status(State(state): State<ApiState>) -> Result<Json<StatusBody>, ApiError> {
    let slideshow = state.settings.slideshow()?;
    let next_tick_in = state
        .slideshow
        .next_tick()
        .map(|at| at.saturating_duration_since(Instant::now()).as_secs());
    Ok(Json(StatusBody {
        connection: state.link.current_state(),
        active: state.slideshow.active_art(),
        slideshow,
        next_tick_in,
        subscribers: state.events.subscriber_count(),
    }))
}

async fn get_slideshow(State(state): State<ApiState>) -> Result<Json<SlideshowConfig>, ApiError> {
    Ok(Json(state.settings.slideshow()?))
}

/// Partial update; omitted fields keep their stored value.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
struct SlideshowPatch {
    enabled: Option<bool>,
    #[serde(with = "humantime_serde")]
    interval: Option<Duration>,
    filter: Option<FilterId>,
    clear_filter: bool,
}

impl SlideshowPatch {
    fn apply(self, mut config: SlideshowConfig) -> SlideshowConfig {
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(interval) = self.interval {
            config.interval = interval;
        }
        if self.clear_filter {
            config.filter = None;
        } else if let Some(filter) = self.filter {
            config.filter = Some(filter);
        }
        config
    }
}

async fn put_slideshow(
    State(state): State<ApiState>,
    Json(patch): Json<SlideshowPatch>,
) -> Result<Json<SlideshowConfig>, ApiError> {
    if patch.interval.is_some_and(|interval| interval < Duration::from_secs(1)) {
        return Err(ApiError {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: "interval must be at least one second".into(),
            class: None,
        });
    }
    let config = patch.apply(state.settings.slideshow()?);
    state.slideshow.configure(config.clone()).await?;
    Ok(Json(config))
}

async fn next_image(State(state): State<ApiState>) -> Result<Json<ActiveArt>, ApiError> {
    Ok(Json(state.slideshow.advance().await?))
}

async fn activate_image(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<ActiveArt>, ApiError> {
    Ok(Json(state.slideshow.activate(ImageId::new(id)).await?))
}

async fn reconnect_device(State(state): State<ApiState>) -> impl IntoResponse {
    state.link.reconnect();
    (
        StatusCode::ACCEPTED,
        Json(json!({ "connection": state.link.current_state() })),
    )
}

#[derive(Debug, Default, Deserialize)]
struct FilesQuery {
    category: Option<String>,
}

async fn list_device_files(
    State(state): State<ApiState>,
    Query(query): Query<FilesQuery>,
) -> Result<Json<Vec<DeviceFile>>, ApiError> {
    let files = state
        .cleaner
        .list_files(query.category.as_deref())
        .await
        .inspect_err(|err| warn!(error = %err, "device file listing failed"))?;
    Ok(Json(files))
}

async fn cleanup_device(State(state): State<ApiState>) -> Result<Json<CleanupReport>, ApiError> {
    let report = state.cleaner.run_once().await.inspect_err(|err| {
        warn!(error = %err, "on-demand cleanup failed");
    })?;
    Ok(Json(report))
}
