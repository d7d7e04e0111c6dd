//! `/stream` endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, Path, Query, RawQuery, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
};
use log::{info, warn};
use serde::Deserialize;
use tokio_stream::wrappers::ReceiverStream;

use crate::server::{AbortGuard, StreamTarget};
use crate::web::state::AppState;

/// Query of the legacy `/stream?url=` route.
#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    pub url: Option<String>,
}

/// `GET /stream/:key`
pub async fn stream_channel(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    // Unknown keys are rejected before any session resource is touched.
    let Some(channel) = state.lineup.get(&key).cloned() else {
        let valid: Vec<&str> = state.lineup.keys().collect();
        return (
            StatusCode::NOT_FOUND,
            format!("Unknown channel '{}'. Valid channels: {}", key, valid.join(", ")),
        )
            .into_response();
    };
    serve_stream(state, StreamTarget::Channel(channel), client_addr(connect)).await
}

/// `GET /stream?url=`: capture an arbitrary page without channel selection.
pub async fn stream_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StreamQuery>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let url = match query.url.as_deref().map(str::trim) {
        Some(url) if url.starts_with("http://") || url.starts_with("https://") => url.to_string(),
        Some(other) => {
            return (StatusCode::BAD_REQUEST, format!("Invalid url '{}'", other)).into_response()
        }
        None => return (StatusCode::BAD_REQUEST, "Missing url parameter").into_response(),
    };
    serve_stream(state, StreamTarget::Url(url), client_addr(connect)).await
}

fn client_addr(connect: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    connect.map(|ConnectInfo(addr)| addr.to_string())
}

async fn serve_stream(
    state: Arc<AppState>,
    target: StreamTarget,
    client: Option<String>,
) -> Response {
    let session = state.open_session(&target, client.clone()).await;
    info!(
        "[Session {}] Stream request for {} from {}",
        session.id(),
        target.label(),
        client.as_deref().unwrap_or("unknown")
    );
    // Dropped with this future if the client disconnects during setup.
    let guard = AbortGuard::new(Arc::clone(&session));

    let live = match state.pipeline.start(&session, &target).await {
        Ok(live) => live,
        Err(e) => {
            warn!("[Session {}] {}", session.id(), e);
            guard.disarm();
            return (e.status_code(), e.to_string()).into_response();
        }
    };

    let piped = match state.pipeline.pipe(&session, live).await {
        Ok(piped) => piped,
        Err(e) => {
            warn!("[Session {}] {}", session.id(), e);
            guard.disarm();
            return (e.status_code(), e.to_string()).into_response();
        }
    };
    guard.disarm();

    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, piped.content_type),
            (header::CACHE_CONTROL, "no-store".to_string()),
            (header::CONNECTION, "keep-alive".to_string()),
        ],
        Body::from_stream(ReceiverStream::new(piped.body)),
    )
        .into_response()
}

/// Secondary listener: send stream requests to the primary listener.
pub async fn redirect_channel(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    headers: HeaderMap,
) -> Redirect {
    Redirect::temporary(&format!("{}/stream/{}", state.base_url(&headers), key))
}

/// Secondary listener: legacy `/stream?url=` redirect, query passed through.
pub async fn redirect_url(
    State(state): State<Arc<AppState>>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Redirect {
    let base = state.base_url(&headers);
    match query {
        Some(query) => Redirect::temporary(&format!("{}/stream?{}", base, query)),
        None => Redirect::temporary(&format!("{}/stream", base)),
    }
}
