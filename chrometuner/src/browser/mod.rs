//! Browser access for capture sessions.
//!
//! This module provides:
//! - [`BrowserManager`]: the shared browser process with relaunch-on-disconnect
//! - [`PagePool`]: isolated pages handed out to sessions and tracked while in use
//! - [`CapturePage`]: the operations a session performs on its page
//! - [`capture`]: tab capture constraints and the media byte stream
//! - [`dom`]: geometry and element descriptions exchanged with page scripts

pub mod capture;
pub mod cdp;
pub mod dom;
pub mod manager;
pub mod pool;
#[cfg(test)]
pub mod testing;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub use capture::{CaptureConstraints, CaptureGeometry, CaptureHandle, CaptureStream};
pub use dom::{ElementBox, Point, TargetRef, TileCandidate, VideoState, VisibleBox};
pub use manager::{BrowserManager, BrowserOptions};
pub use pool::PagePool;

/// Errors reported by the browser layer.
#[derive(Debug, Error)]
pub enum BrowserError {
    /// The browser executable could not be located or failed to start.
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    /// The browser connection dropped.
    #[error("Browser disconnected")]
    Disconnected,

    /// A DevTools protocol command failed.
    #[error("CDP error: {0}")]
    Cdp(String),

    /// A page script threw or returned an unexpected value.
    #[error("Page script error: {0}")]
    Script(String),
}

/// Identifier of a page handed out by a [`BrowserBackend`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page-{}", self.0)
    }
}

/// A browser page owned by one session.
#[async_trait]
pub trait CapturePage: Send + Sync {
    fn id(&self) -> PageId;

    /// Disable CSP and inject the given stylesheet into every document.
    async fn harden(&self, stylesheet: &str) -> Result<(), BrowserError>;

    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Resize the window and zoom the page for capture.
    async fn apply_geometry(&self, geometry: &CaptureGeometry) -> Result<(), BrowserError>;

    /// Start an audio+video capture of this page.
    async fn start_capture(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<CaptureStream, BrowserError>;

    /// Whether any image on the page has a source containing `slug`.
    async fn slug_image_present(&self, slug: &str) -> Result<bool, BrowserError>;

    /// Ancestor chains of every image whose source contains `slug`, in document order.
    async fn tile_candidates(&self, slug: &str) -> Result<Vec<TileCandidate>, BrowserError>;

    /// Scroll the target into view and report its bounding box.
    ///
    /// Returns `None` when the element no longer exists.
    async fn reveal_target(
        &self,
        slug: &str,
        target: TargetRef,
    ) -> Result<Option<VisibleBox>, BrowserError>;

    /// Dispatch a left click at the given viewport coordinates.
    async fn click(&self, point: Point) -> Result<(), BrowserError>;

    /// State of the first video element, if any.
    async fn video_state(&self) -> Result<Option<VideoState>, BrowserError>;

    async fn enter_fullscreen(&self) -> Result<(), BrowserError>;

    async fn minimize_window(&self) -> Result<(), BrowserError>;

    async fn close(&self) -> Result<(), BrowserError>;
}

/// Source of fresh pages.
#[async_trait]
pub trait BrowserBackend: Send + Sync {
    /// Open a new, isolated page.
    async fn new_page(&self) -> Result<Arc<dyn CapturePage>, BrowserError>;
}
