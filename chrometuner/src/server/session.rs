//! Stream session lifecycle.
//!
//! A session owns the resources acquired while setting up a stream: a page,
//! a capture, an admission slot and possibly a transcoder. Cleanup may be
//! triggered concurrently by the client disconnecting, the capture ending,
//! the transcoder exiting or a setup stage failing. Only the first trigger
//! releases anything.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use log::{debug, info, warn};
use serde::Serialize;

use crate::browser::{CaptureHandle, CapturePage, PagePool};
use crate::server::transcode::TranscodeHandle;
use crate::tuner::AdmissionSlot;
use crate::web::state::SessionRegistry;

/// Stream session state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Init,
    PageAcquired,
    Navigated,
    CaptureStarted,
    SlotAcquired,
    ChannelSelected,
    PlaybackVerified,
    Piping,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Init => "init",
            SessionState::PageAcquired => "page_acquired",
            SessionState::Navigated => "navigated",
            SessionState::CaptureStarted => "capture_started",
            SessionState::SlotAcquired => "slot_acquired",
            SessionState::ChannelSelected => "channel_selected",
            SessionState::PlaybackVerified => "playback_verified",
            SessionState::Piping => "piping",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The HTTP client went away.
    ClientClosed,
    /// The capture stream ended.
    CaptureEnded,
    /// The capture stream reported an error.
    CaptureError(String),
    /// The transcoder exited normally.
    TranscoderExited,
    /// The transcoder failed.
    TranscoderFailed(String),
    /// A setup stage failed.
    StageFailed(String),
}

impl TerminationReason {
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            TerminationReason::CaptureError(_)
                | TerminationReason::TranscoderFailed(_)
                | TerminationReason::StageFailed(_)
        )
    }
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationReason::ClientClosed => write!(f, "client closed"),
            TerminationReason::CaptureEnded => write!(f, "capture ended"),
            TerminationReason::CaptureError(e) => write!(f, "capture error: {}", e),
            TerminationReason::TranscoderExited => write!(f, "transcoder exited"),
            TerminationReason::TranscoderFailed(e) => write!(f, "transcoder failed: {}", e),
            TerminationReason::StageFailed(e) => write!(f, "setup failed: {}", e),
        }
    }
}

#[derive(Default)]
struct SessionResources {
    page: Option<Arc<dyn CapturePage>>,
    capture: Option<CaptureHandle>,
    transcoder: Option<TranscodeHandle>,
    slot: Option<AdmissionSlot>,
}

/// One `/stream` request and everything it holds.
pub struct Session {
    id: u64,
    target: String,
    started_at: Instant,
    state: Mutex<SessionState>,
    finished: AtomicBool,
    /// Set by the cleanup that won.
    reason: Mutex<Option<TerminationReason>>,
    resources: Mutex<SessionResources>,
    pages: Arc<PagePool>,
    registry: Arc<SessionRegistry>,
}

impl Session {
    /// Create a session in `Init` and register it.
    pub async fn open(
        id: u64,
        target: impl Into<String>,
        client: Option<String>,
        pages: Arc<PagePool>,
        registry: Arc<SessionRegistry>,
    ) -> Arc<Self> {
        let target = target.into();
        registry.register(id, client, target.clone()).await;
        Arc::new(Self {
            id,
            target,
            started_at: Instant::now(),
            state: Mutex::new(SessionState::Init),
            finished: AtomicBool::new(false),
            reason: Mutex::new(None),
            resources: Mutex::new(SessionResources::default()),
            pages,
            registry,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Why the session ended, once cleanup has started.
    pub fn termination_reason(&self) -> Option<TerminationReason> {
        self.reason
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Move to a later state. Returns false (and changes nothing) otherwise.
    pub async fn advance(&self, next: SessionState) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if next <= *state || *state == SessionState::Closed {
                warn!(
                    "[Session {}] Ignoring transition {} -> {}",
                    self.id, *state, next
                );
                return false;
            }
            debug!("[Session {}] {} -> {}", self.id, *state, next);
            *state = next;
        }
        self.registry.update_state(self.id, next).await;
        true
    }

    fn with_resources<T>(&self, f: impl FnOnce(&mut SessionResources) -> T) -> T {
        let mut resources = self.resources.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut resources)
    }

    /// Record the session's page. Gives it back if the session already ended.
    pub fn attach_page(&self, page: Arc<dyn CapturePage>) -> Result<(), Arc<dyn CapturePage>> {
        self.with_resources(|r| {
            if self.is_finished() {
                return Err(page);
            }
            r.page = Some(page);
            Ok(())
        })
    }

    pub fn attach_capture(&self, capture: CaptureHandle) -> Result<(), CaptureHandle> {
        self.with_resources(|r| {
            if self.is_finished() {
                return Err(capture);
            }
            r.capture = Some(capture);
            Ok(())
        })
    }

    pub fn attach_slot(&self, slot: AdmissionSlot) -> Result<(), AdmissionSlot> {
        self.with_resources(|r| {
            if self.is_finished() {
                return Err(slot);
            }
            r.slot = Some(slot);
            Ok(())
        })
    }

    pub fn attach_transcoder(&self, handle: TranscodeHandle) -> Result<(), TranscodeHandle> {
        self.with_resources(|r| {
            if self.is_finished() {
                return Err(handle);
            }
            r.transcoder = Some(handle);
            Ok(())
        })
    }

    /// Release everything the session holds.
    ///
    /// Runs at most once; later calls return false without side effects.
    /// Order: transcoder, capture, slot, page.
    pub async fn cleanup(&self, reason: TerminationReason) -> bool {
        if self.finished.swap(true, Ordering::SeqCst) {
            debug!(
                "[Session {}] Cleanup already done, ignoring '{}'",
                self.id, reason
            );
            return false;
        }

        if reason.is_error() {
            warn!("[Session {}] Closing: {}", self.id, reason);
        } else {
            info!("[Session {}] Closing: {}", self.id, reason);
        }
        *self.reason.lock().unwrap_or_else(PoisonError::into_inner) = Some(reason);

        let resources = self.with_resources(std::mem::take);

        if let Some(transcoder) = resources.transcoder {
            debug!(
                "[Session {}] Terminating transcoder (pid {:?})",
                self.id,
                transcoder.pid()
            );
            transcoder.terminate();
        }
        if let Some(capture) = resources.capture {
            capture.destroy();
        }
        if let Some(slot) = resources.slot {
            slot.release();
            debug!("[Session {}] Released admission slot", self.id);
        }
        if let Some(page) = resources.page {
            self.pages.release_page(&page).await;
        }

        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = SessionState::Closed;
        self.registry.unregister(self.id).await;

        info!(
            "[Session {}] Closed after {:.1}s ({})",
            self.id,
            self.started_at.elapsed().as_secs_f64(),
            self.target
        );
        true
    }
}

/// Cleans up the session if dropped while armed.
///
/// Held by the request handler during setup: when the client disconnects,
/// the handler future is dropped and so is this guard.
pub struct AbortGuard {
    session: Option<Arc<Session>>,
}

impl AbortGuard {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// Setup finished; the response body now owns termination.
    pub fn disarm(mut self) {
        self.session = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        if let Some(reason) = session.termination_reason() {
            debug!("[Session {}] Already closed: {}", session.id(), reason);
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    session.cleanup(TerminationReason::ClientClosed).await;
                });
            }
            Err(_) => warn!(
                "[Session {}] Dropped outside the runtime; resources not released",
                session.id()
            ),
        }
    }
}
