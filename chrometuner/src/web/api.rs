//! Tuner discovery and lineup endpoints.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderMap},
    response::IntoResponse,
    Json,
};
use log::debug;
use serde_json::json;

use chrometuner_protocol::{device_xml, lineup_entries, m3u_playlist, LineupStatus, StreamStatus};

use crate::web::state::AppState;

// ============================================================================
// HDHomeRun discovery
// ============================================================================

/// `/discover.json`
pub async fn discover(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    Json(state.identity.discover(&state.base_url(&headers)))
}

/// `/device.xml`
pub async fn device_description(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "application/xml")],
        device_xml(&state.identity, &state.base_url(&headers)),
    )
}

/// `/lineup.json`
pub async fn lineup(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    Json(lineup_entries(&state.lineup, &state.base_url(&headers)))
}

/// `/lineup_status.json`
pub async fn lineup_status() -> impl IntoResponse {
    Json(LineupStatus::default())
}

/// `POST /lineup.post`: channel scans are accepted and ignored.
pub async fn lineup_post() -> impl IntoResponse {
    debug!("Ignoring lineup scan request");
    ""
}

/// `/status.json`
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(StreamStatus {
        active_streams: state.admission.active(),
        max_streams: state.admission.capacity(),
    })
}

/// `/playlist.m3u`
pub async fn playlist(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "audio/x-mpegurl")],
        m3u_playlist(&state.lineup, &state.base_url(&headers)),
    )
}

// ============================================================================
// Diagnostics
// ============================================================================

/// `/api/sessions`: active sessions and their stages.
pub async fn sessions(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let sessions: Vec<serde_json::Value> = state
        .sessions
        .get_all()
        .await
        .iter()
        .map(|s| {
            json!({
                "session_id": s.id,
                "client": s.client,
                "target": s.target,
                "state": s.state,
                "connected_seconds": s.connected_seconds(),
            })
        })
        .collect();

    Json(json!({
        "success": true,
        "sessions": sessions,
        "pages_in_use": state.pages.in_use_count().await,
        "browser": state.browser.as_ref().map(|b| b.state_name()),
    }))
}
