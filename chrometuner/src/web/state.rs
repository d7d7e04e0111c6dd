//! Web server shared state.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use axum::http::header::HOST;
use axum::http::HeaderMap;
use serde::Serialize;
use tokio::sync::RwLock;

use chrometuner_protocol::{DeviceIdentity, Lineup};

use crate::browser::{BrowserManager, PagePool};
use crate::server::{CapturePipeline, Session, SessionState, StreamTarget};
use crate::tuner::AdmissionController;

/// Information about an active session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Session ID.
    pub id: u64,
    /// Client address.
    pub client: Option<String>,
    /// Channel or URL being captured.
    pub target: String,
    pub state: SessionState,
    #[serde(skip)]
    pub connected_at: Instant,
}

impl SessionInfo {
    /// Get connection duration in seconds.
    pub fn connected_seconds(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }
}

/// Registry for tracking active sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<u64, SessionInfo>>,
}

impl SessionRegistry {
    pub async fn register(&self, id: u64, client: Option<String>, target: String) {
        let info = SessionInfo {
            id,
            client,
            target,
            state: SessionState::Init,
            connected_at: Instant::now(),
        };
        self.sessions.write().await.insert(id, info);
    }

    pub async fn unregister(&self, id: u64) {
        self.sessions.write().await.remove(&id);
    }

    pub async fn update_state(&self, id: u64, state: SessionState) {
        if let Some(info) = self.sessions.write().await.get_mut(&id) {
            info.state = state;
        }
    }

    pub async fn get(&self, id: u64) -> Option<SessionInfo> {
        self.sessions.read().await.get(&id).cloned()
    }

    /// All sessions, oldest first.
    pub async fn get_all(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().await.values().cloned().collect();
        sessions.sort_by_key(|s| s.id);
        sessions
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

/// State shared by every handler.
pub struct AppState {
    pub lineup: Lineup,
    pub identity: DeviceIdentity,
    pub admission: Arc<AdmissionController>,
    pub pages: Arc<PagePool>,
    pub pipeline: CapturePipeline,
    pub sessions: Arc<SessionRegistry>,
    /// Shared browser, when running against a real one.
    pub browser: Option<Arc<BrowserManager>>,
    /// Configured external base URL; overrides the Host header.
    pub base_url: Option<String>,
    /// Port of the primary listener, used when deriving base URLs.
    pub primary_port: u16,
    next_session_id: AtomicU64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        lineup: Lineup,
        identity: DeviceIdentity,
        admission: Arc<AdmissionController>,
        pages: Arc<PagePool>,
        pipeline: CapturePipeline,
        browser: Option<Arc<BrowserManager>>,
        base_url: Option<String>,
        primary_port: u16,
    ) -> Self {
        Self {
            lineup,
            identity,
            admission,
            pages,
            pipeline,
            sessions: Arc::new(SessionRegistry::default()),
            browser,
            base_url: base_url.map(|u| u.trim_end_matches('/').to_string()),
            primary_port,
            next_session_id: AtomicU64::new(0),
        }
    }

    /// Create and register a session for `target`.
    pub async fn open_session(&self, target: &StreamTarget, client: Option<String>) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst) + 1;
        Session::open(
            id,
            target.label(),
            client,
            Arc::clone(&self.pages),
            Arc::clone(&self.sessions),
        )
        .await
    }

    /// Base URL clients should use for the primary listener.
    ///
    /// The configured value wins; otherwise the request's Host name is
    /// combined with the primary port.
    pub fn base_url(&self, headers: &HeaderMap) -> String {
        if let Some(base) = &self.base_url {
            return base.clone();
        }
        let host = headers
            .get(HOST)
            .and_then(|value| value.to_str().ok())
            .map(host_without_port)
            .filter(|host| !host.is_empty())
            .unwrap_or("127.0.0.1");
        format!("http://{}:{}", host, self.primary_port)
    }
}

/// Strip the port from a Host header value, keeping IPv6 brackets.
pub fn host_without_port(host: &str) -> &str {
    let host = host.trim();
    if host.starts_with('[') {
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
