//! HTTP dispatch layer.
//!
//! ```text
//! GET  /styles          - list style ids (always one)
//! GET  /styles/{id}     - read the style file
//! PUT  /styles/{id}     - replace the style file
//! GET  /ws              - websocket, one "changed" message per file change
//! GET  /static/*        - files from --static
//! GET  /*               - embedded web UI
//! ```
//!
//! Plain request/response routes only see the [`StyleFileAccessor`]; the
//! duplex `/ws` route only sees the [`ChangeWatcher`].

pub mod assets;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use thiserror::Error;
use tokio::task::JoinError;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;

use crate::accessor::{AccessError, StyleFileAccessor};
use crate::config::BridgeConfig;
use crate::watcher::ChangeWatcher;

/// Errors surfaced to HTTP clients.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error(transparent)]
    Access(#[from] AccessError),

    #[error("websocket upgrade failed: {0}")]
    Upgrade(String),

    #[error("live reload is unavailable")]
    WatcherUnavailable,

    #[error("background task failed: {0}")]
    Task(#[from] JoinError),
}

impl BridgeError {
    pub fn status(&self) -> StatusCode {
        match self {
            BridgeError::Access(AccessError::NotFound { .. }) => StatusCode::NOT_FOUND,
            BridgeError::Access(_) | BridgeError::Task(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Upgrade(_) => StatusCode::BAD_REQUEST,
            BridgeError::WatcherUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("[http] {self}");
        }
        (status, self.to_string()).into_response()
    }
}

/// The pieces the router is composed from. Routes for absent pieces are not
/// registered.
#[derive(Default)]
pub struct Bridge {
    pub accessor: Option<Arc<StyleFileAccessor>>,
    /// Only mounted together with an accessor.
    pub watcher: Option<ChangeWatcher>,
    pub static_dir: Option<PathBuf>,
}

/// Build the application router.
pub fn router(bridge: Bridge, config: &BridgeConfig) -> Router {
    let mut router = Router::new();

    if let Some(accessor) = bridge.accessor {
        router = router.merge(style_routes(accessor, config.server.max_body_bytes));
        if let Some(watcher) = bridge.watcher {
            router = router.merge(ws::routes(watcher, config.watch.ping_interval()));
        }
    }

    if let Some(dir) = bridge.static_dir {
        router = router.nest_service("/static", ServeDir::new(dir));
    }

    router
        .fallback(assets::embedded_ui)
        .layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn style_routes(accessor: Arc<StyleFileAccessor>, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/styles", get(list_styles))
        .route("/styles/{id}", get(read_style).put(save_style))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(accessor)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::PUT])
        .allow_headers([header::CONTENT_TYPE]);

    if origins.is_empty() {
        return layer.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("[http] ignoring invalid CORS origin '{origin}'");
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(origins))
}

async fn list_styles(State(accessor): State<Arc<StyleFileAccessor>>) -> Json<Vec<String>> {
    Json(accessor.list())
}

async fn read_style(
    State(accessor): State<Arc<StyleFileAccessor>>,
    Path(id): Path<String>,
) -> Result<Response, BridgeError> {
    let body = tokio::task::spawn_blocking(move || accessor.read(&id)).await??;
    Ok(([(header::CONTENT_TYPE, "application/json")], body).into_response())
}

async fn save_style(
    State(accessor): State<Arc<StyleFileAccessor>>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, BridgeError> {
    let len = body.len();
    let saved_id = tokio::task::spawn_blocking(move || accessor.save(&id, &body).map(|()| id))
        .await??;
    crate::log_event!("styles", "saved", "{saved_id} ({len} bytes)");
    Ok(StatusCode::OK)
}
