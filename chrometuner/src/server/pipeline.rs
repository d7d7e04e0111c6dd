//! Capture pipeline: the setup stages of a stream session.
//!
//! Stages run in order, each advancing the session state:
//! page acquired, navigated, capture started, slot acquired, channel
//! selected (channel targets only), playback verified. Capture starts
//! before admission so the browser's capture grant is in place while a
//! slot is awaited. Any failure cleans up the session before returning.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::StatusCode;
use log::{debug, info, warn};
use thiserror::Error;

use chrometuner_protocol::Channel;

use crate::browser::{BrowserError, CaptureConstraints, CaptureGeometry, CapturePage, PagePool};
use crate::server::pipe::{self, LiveCapture, OutputFormat, PipedBody};
use crate::server::session::{Session, SessionState, TerminationReason};
use crate::server::transcode::{TranscodeConfig, TranscodeError};
use crate::tuner::{AdmissionController, ChannelSelector, SelectError, SelectorConfig};

/// Pipeline errors, one per failing stage.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// No page could be opened.
    #[error("Failed to open page: {0}")]
    PageAcquire(#[source] BrowserError),

    /// Navigation failed or timed out.
    #[error("Navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    /// The page could not start capturing itself.
    #[error("Failed to start capture: {0}")]
    CaptureStart(#[source] BrowserError),

    /// No admission slot within the wait budget.
    #[error("All {capacity} tuners are busy")]
    AdmissionTimeout { capacity: usize },

    /// The channel tile could not be clicked.
    #[error("Channel selection failed: {0}")]
    ChannelSelection(#[source] SelectError),

    /// The video never started playing.
    #[error("Playback did not start within {0:?}")]
    PlaybackTimeout(Duration),

    /// The transcoder could not be started.
    #[error("Failed to start transcoder: {0}")]
    Transcode(#[source] TranscodeError),

    /// The session was cleaned up while setting up.
    #[error("Session closed during setup")]
    Aborted,
}

impl PipelineError {
    /// HTTP status for a request that failed with this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::AdmissionTimeout { .. } => StatusCode::TOO_MANY_REQUESTS,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// What a session streams.
#[derive(Debug, Clone)]
pub enum StreamTarget {
    /// A lineup channel: navigate to its page and click its tile.
    Channel(Channel),
    /// An arbitrary page, captured as-is.
    Url(String),
}

impl StreamTarget {
    pub fn url(&self) -> &str {
        match self {
            StreamTarget::Channel(channel) => &channel.url,
            StreamTarget::Url(url) => url,
        }
    }

    /// Tile slug to click, if any.
    pub fn slug(&self) -> Option<&str> {
        match self {
            StreamTarget::Channel(channel) if !channel.slug.is_empty() => Some(&channel.slug),
            _ => None,
        }
    }

    pub fn label(&self) -> String {
        match self {
            StreamTarget::Channel(channel) => format!("{} ({})", channel.key, channel.name),
            StreamTarget::Url(url) => url.clone(),
        }
    }
}

/// Pipeline timing and output settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub navigation_timeout: Duration,
    pub admission_wait: Duration,
    pub playback_timeout: Duration,
    pub playback_poll_interval: Duration,
    pub constraints: CaptureConstraints,
    pub geometry: CaptureGeometry,
    pub selector: SelectorConfig,
    pub output: OutputFormat,
    pub transcode: TranscodeConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            navigation_timeout: Duration::from_secs(30),
            admission_wait: Duration::from_secs(5),
            playback_timeout: Duration::from_secs(60),
            playback_poll_interval: Duration::from_millis(500),
            constraints: CaptureConstraints::default(),
            geometry: CaptureGeometry::for_resolution(1280, 720, 1920),
            selector: SelectorConfig::default(),
            output: OutputFormat::MpegTs,
            transcode: TranscodeConfig::default(),
        }
    }
}

/// Runs the setup stages for sessions.
pub struct CapturePipeline {
    pages: Arc<PagePool>,
    admission: Arc<AdmissionController>,
    selector: ChannelSelector,
    config: PipelineConfig,
}

impl CapturePipeline {
    pub fn new(
        pages: Arc<PagePool>,
        admission: Arc<AdmissionController>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            pages,
            admission,
            selector: ChannelSelector::new(config.selector),
            config,
        }
    }

    /// Run every setup stage. On failure the session is already cleaned up.
    pub async fn start(
        &self,
        session: &Arc<Session>,
        target: &StreamTarget,
    ) -> Result<LiveCapture, PipelineError> {
        match self.run_stages(session, target).await {
            Ok(live) => Ok(live),
            Err(e) => {
                session
                    .cleanup(TerminationReason::StageFailed(e.to_string()))
                    .await;
                Err(e)
            }
        }
    }

    /// Connect the live capture to a response body and enter `Piping`.
    pub async fn pipe(
        &self,
        session: &Arc<Session>,
        live: LiveCapture,
    ) -> Result<PipedBody, PipelineError> {
        let piped = match pipe::start_piping(
            Arc::clone(session),
            live,
            self.config.output,
            &self.config.transcode,
        ) {
            Ok(piped) => piped,
            Err(e) => {
                let e = PipelineError::Transcode(e);
                session
                    .cleanup(TerminationReason::StageFailed(e.to_string()))
                    .await;
                return Err(e);
            }
        };
        session.advance(SessionState::Piping).await;
        info!(
            "[Session {}] Streaming {} as {}",
            session.id(),
            session.target(),
            piped.content_type
        );
        Ok(piped)
    }

    async fn run_stages(
        &self,
        session: &Arc<Session>,
        target: &StreamTarget,
    ) -> Result<LiveCapture, PipelineError> {
        let id = session.id();

        let page = self
            .pages
            .acquire_page()
            .await
            .map_err(PipelineError::PageAcquire)?;
        if let Err(page) = session.attach_page(Arc::clone(&page)) {
            self.pages.release_page(&page).await;
            return Err(PipelineError::Aborted);
        }
        session.advance(SessionState::PageAcquired).await;

        let url = target.url();
        info!("[Session {}] Navigating to {}", id, url);
        let navigation_error = |reason: String| PipelineError::Navigation {
            url: url.to_string(),
            reason,
        };
        match tokio::time::timeout(self.config.navigation_timeout, page.navigate(url)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(navigation_error(e.to_string())),
            Err(_) => {
                return Err(navigation_error(format!(
                    "timed out after {:?}",
                    self.config.navigation_timeout
                )))
            }
        }
        page.apply_geometry(&self.config.geometry)
            .await
            .map_err(|e| navigation_error(e.to_string()))?;
        session.advance(SessionState::Navigated).await;

        let stream = page
            .start_capture(&self.config.constraints)
            .await
            .map_err(PipelineError::CaptureStart)?;
        let (mime_type, chunks, handle) = stream.into_parts();
        if let Err(handle) = session.attach_capture(handle) {
            handle.destroy();
            return Err(PipelineError::Aborted);
        }
        session.advance(SessionState::CaptureStarted).await;
        debug!("[Session {}] Capturing as {}", id, mime_type);

        let slot = self
            .admission
            .try_admit(self.config.admission_wait)
            .await
            .ok_or(PipelineError::AdmissionTimeout {
                capacity: self.admission.capacity(),
            })?;
        if let Err(slot) = session.attach_slot(slot) {
            slot.release();
            return Err(PipelineError::Aborted);
        }
        session.advance(SessionState::SlotAcquired).await;
        info!(
            "[Session {}] Admitted ({}/{} active)",
            id,
            self.admission.active(),
            self.admission.capacity()
        );

        if let Some(slug) = target.slug() {
            self.selector
                .select_channel(page.as_ref(), slug, id)
                .await
                .map_err(PipelineError::ChannelSelection)?;
            session.advance(SessionState::ChannelSelected).await;
        }

        self.verify_playback(id, page.as_ref()).await?;
        session.advance(SessionState::PlaybackVerified).await;

        Ok(LiveCapture { mime_type, chunks })
    }

    /// Wait for the video to play, then go fullscreen and minimize.
    async fn verify_playback(&self, id: u64, page: &dyn CapturePage) -> Result<(), PipelineError> {
        let deadline = Instant::now() + self.config.playback_timeout;
        loop {
            match page.video_state().await {
                Ok(Some(state)) if state.is_playing() => break,
                Ok(Some(state)) => debug!(
                    "[Session {}] Waiting for playback (readyState {}, t={:.1})",
                    id, state.ready_state, state.current_time
                ),
                Ok(None) => debug!("[Session {}] Waiting for a video element", id),
                Err(e) => debug!("[Session {}] Video probe failed: {}", id, e),
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::PlaybackTimeout(self.config.playback_timeout));
            }
            tokio::time::sleep(self.config.playback_poll_interval).await;
        }
        info!("[Session {}] Playback verified", id);

        if let Err(e) = page.enter_fullscreen().await {
            warn!("[Session {}] Fullscreen failed: {}", id, e);
        }
        if let Err(e) = page.minimize_window().await {
            warn!("[Session {}] Minimize failed: {}", id, e);
        }
        Ok(())
    }
}
