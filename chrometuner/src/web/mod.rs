//! HTTP surface: HDHomeRun discovery, lineup and stream endpoints.
//!
//! Two listeners share one [`AppState`]. The primary serves everything.
//! The secondary (port 80 by default, for clients that assume it) serves
//! discovery and redirects stream requests to the primary.

pub mod api;
pub mod dashboard;
pub mod state;
pub mod stream;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use log::{info, warn};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use state::{AppState, SessionInfo, SessionRegistry};

/// Discovery and lineup routes served on both listeners.
fn discovery_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/", get(dashboard::index))
        .route("/discover.json", get(api::discover))
        .route("/device.xml", get(api::device_description))
        .route("/lineup.json", get(api::lineup))
        .route("/lineup_status.json", get(api::lineup_status))
        .route("/lineup.post", post(api::lineup_post))
        .route("/status.json", get(api::status))
        .route("/playlist.m3u", get(api::playlist))
        .route("/api/sessions", get(api::sessions))
}

/// Router for the primary listener.
pub fn primary_router(state: Arc<AppState>) -> Router {
    discovery_routes()
        .route("/stream/:key", get(stream::stream_channel))
        .route("/stream", get(stream::stream_url))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Router for the secondary discovery listener.
pub fn discovery_router(state: Arc<AppState>) -> Router {
    discovery_routes()
        .route("/stream/:key", get(stream::redirect_channel))
        .route("/stream", get(stream::redirect_url))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Serve the primary listener until the server fails.
pub async fn start_web_server(
    listen_addr: SocketAddr,
    state: Arc<AppState>,
) -> Result<(), Box<dyn std::error::Error>> {
    let app = primary_router(state);

    let listener = tokio::net::TcpListener::bind(listen_addr).await?;
    info!("Tuner listening on http://{}", listen_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Serve the secondary listener. Failing to bind is logged, not fatal.
pub async fn start_discovery_server(listen_addr: SocketAddr, state: Arc<AppState>) {
    let listener = match tokio::net::TcpListener::bind(listen_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            warn!(
                "Discovery listener unavailable on {}: {} (continuing without it)",
                listen_addr, e
            );
            return;
        }
    };
    info!("Discovery listening on http://{}", listen_addr);

    let app = discovery_router(state);
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        warn!("Discovery listener stopped: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use futures::StreamExt;
    use tower::ServiceExt;

    use chrometuner_protocol::{Channel, DeviceIdentity, Lineup};

    use crate::browser::dom::ElementBox;
    use crate::browser::testing::{link_tile, StubBackend, StubBehavior};
    use crate::browser::PagePool;
    use crate::server::{CapturePipeline, OutputFormat, PipelineConfig};
    use crate::tuner::{AdmissionController, SelectorConfig};

    fn test_lineup() -> Lineup {
        Lineup::new(vec![
            Channel::new("cnn", "CNN", "120", "https://example.com/guide", "cnn"),
            Channel::new("espn", "ESPN", "20", "https://example.com/guide", "espn"),
            Channel::new("nbc", "NBC", "100", "https://example.com/guide", "nbc"),
        ])
        .unwrap()
    }

    fn test_state(backend: Arc<StubBackend>, capacity: usize) -> Arc<AppState> {
        let pages = Arc::new(PagePool::new(backend));
        let admission = Arc::new(AdmissionController::new(capacity));
        let config = PipelineConfig {
            admission_wait: Duration::from_millis(50),
            playback_timeout: Duration::from_millis(200),
            playback_poll_interval: Duration::from_millis(10),
            selector: SelectorConfig {
                grid_wait: Duration::from_millis(20),
                poll_interval: Duration::from_millis(5),
                settle_delay: Duration::ZERO,
            },
            output: OutputFormat::Native,
            ..Default::default()
        };
        let pipeline = CapturePipeline::new(pages.clone(), admission.clone(), config);
        let identity = DeviceIdentity {
            friendly_name: "chrometuner".to_string(),
            device_id: "12345678".to_string(),
            tuner_count: capacity,
        };
        Arc::new(AppState::new(
            test_lineup(),
            identity,
            admission,
            pages,
            pipeline,
            None,
            None,
            5589,
        ))
    }

    fn tile_backend() -> Arc<StubBackend> {
        Arc::new(StubBackend::new(StubBehavior {
            tiles: vec![link_tile(ElementBox::new(40.0, 40.0, 200.0, 120.0))],
            ..Default::default()
        }))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder()
            .uri(uri)
            .header(header::HOST, "10.0.0.5:5589")
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn body_text(response: axum::response::Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    async fn wait_until(mut done: impl FnMut() -> bool) {
        for _ in 0..200 {
            if done() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_discover_uses_host_and_primary_port() {
        let state = test_state(tile_backend(), 2);
        let request = Request::builder()
            .uri("/discover.json")
            .header(header::HOST, "10.0.0.5")
            .body(Body::empty())
            .unwrap();

        let response = discovery_router(state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let json = body_json(response).await;
        assert_eq!(json["BaseURL"], "http://10.0.0.5:5589");
        assert_eq!(json["TunerCount"], 2);
    }

    #[tokio::test]
    async fn test_lineup_lists_every_channel() {
        let state = test_state(tile_backend(), 2);

        let response = primary_router(state).oneshot(get("/lineup.json")).await.unwrap();
        let json = body_json(response).await;
        let entries = json.as_array().unwrap();

        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1]["GuideName"], "ESPN");
        assert_eq!(entries[1]["URL"], "http://10.0.0.5:5589/stream/espn");
    }

    #[tokio::test]
    async fn test_playlist_sorted_by_number() {
        let state = test_state(tile_backend(), 2);

        let response = primary_router(state).oneshot(get("/playlist.m3u")).await.unwrap();
        let text = body_text(response).await;
        let urls: Vec<&str> = text.lines().filter(|l| l.starts_with("http")).collect();

        assert_eq!(
            urls,
            vec![
                "http://10.0.0.5:5589/stream/espn",
                "http://10.0.0.5:5589/stream/nbc",
                "http://10.0.0.5:5589/stream/cnn",
            ]
        );
    }

    #[tokio::test]
    async fn test_status_reflects_admission() {
        let state = test_state(tile_backend(), 2);
        let _slot = state.admission.try_admit(Duration::ZERO).await.unwrap();

        let response = primary_router(state).oneshot(get("/status.json")).await.unwrap();
        let json = body_json(response).await;

        assert_eq!(json["ActiveStreams"], 1);
        assert_eq!(json["MaxStreams"], 2);
    }

    #[tokio::test]
    async fn test_unknown_channel_is_404_without_side_effects() {
        let backend = tile_backend();
        let state = test_state(backend.clone(), 1);

        let response = primary_router(state.clone())
            .oneshot(get("/stream/nosuch"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let text = body_text(response).await;
        assert!(text.contains("cnn, espn, nbc"));
        assert_eq!(backend.opened(), 0);
        assert_eq!(state.admission.active(), 0);
        assert_eq!(state.sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_stream_url_requires_valid_url() {
        let state = test_state(tile_backend(), 1);

        let missing = primary_router(state.clone()).oneshot(get("/stream")).await.unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let bad = primary_router(state)
            .oneshot(get("/stream?url=ftp%3A%2F%2Fexample.com"))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_stream_when_full_is_429() {
        let backend = tile_backend();
        let state = test_state(backend.clone(), 1);
        let _held = state.admission.try_admit(Duration::ZERO).await.unwrap();

        let response = primary_router(state.clone())
            .oneshot(get("/stream/espn"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(state.pages.in_use_count().await, 0);
        assert_eq!(backend.last_page().unwrap().close_count(), 1);
        assert_eq!(state.sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_stream_channel_end_to_end() {
        let backend = tile_backend();
        let state = test_state(backend.clone(), 1);

        let response = primary_router(state.clone())
            .oneshot(get("/stream/espn"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "video/webm");
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(state.admission.active(), 1);

        let sessions = state.sessions.get_all().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].state, crate::server::SessionState::Piping);

        let page = backend.last_page().unwrap();
        assert_eq!(page.clicks().len(), 1);

        let mut body = response.into_body().into_data_stream();
        let first = body.next().await.unwrap().unwrap();
        assert_eq!(&first[..], b"\x1a\x45\xdf\xa3");

        // Client goes away.
        drop(body);
        wait_until(|| state.admission.active() == 0).await;

        assert_eq!(state.admission.active(), 0);
        assert_eq!(state.pages.in_use_count().await, 0);
        assert_eq!(page.close_count(), 1);
        assert_eq!(state.sessions.count().await, 0);
    }

    #[tokio::test]
    async fn test_capture_end_closes_stream() {
        let backend = tile_backend();
        let state = test_state(backend.clone(), 1);

        let response = primary_router(state.clone())
            .oneshot(get("/stream/espn"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        backend.last_page().unwrap().end_capture();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();

        assert_eq!(&bytes[..], b"\x1a\x45\xdf\xa3");
        wait_until(|| state.admission.active() == 0).await;
        assert_eq!(state.admission.active(), 0);
    }

    #[tokio::test]
    async fn test_secondary_redirects_streams() {
        let state = test_state(tile_backend(), 1);
        let request = Request::builder()
            .uri("/stream/espn")
            .header(header::HOST, "tuner.local")
            .body(Body::empty())
            .unwrap();

        let response = discovery_router(state).oneshot(request).await.unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[header::LOCATION],
            "http://tuner.local:5589/stream/espn"
        );
    }
}
