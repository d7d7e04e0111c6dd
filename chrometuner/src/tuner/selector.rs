//! Channel target resolution on a channel-grid page.
//!
//! A channel is identified by a slug that appears in its tile image's
//! source URL. The resolver finds the tile, picks the element that should
//! receive the click, scrolls it into view and clicks its visible center.

use std::time::{Duration, Instant};

use log::{debug, info, warn};
use thiserror::Error;

use crate::browser::dom::{TargetKind, TargetRef, TileCandidate};
use crate::browser::{BrowserError, CapturePage, Point};

/// Smallest width and height (px) for a pointer-cursor fallback target.
pub const MIN_FALLBACK_SIZE: f64 = 20.0;

/// Channel selection errors.
#[derive(Debug, Error)]
pub enum SelectError {
    /// No matching image had a usable ancestor.
    #[error("tile not found")]
    TileNotFound,

    /// The target had no area inside the viewport after scrolling.
    #[error("tile for '{0}' is not visible")]
    NotVisible(String),

    /// Browser error while inspecting or clicking.
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
}

/// Timing of the resolver.
#[derive(Debug, Clone, Copy)]
pub struct SelectorConfig {
    /// How long to wait for a matching tile image to appear.
    pub grid_wait: Duration,
    pub poll_interval: Duration,
    /// Pause between scrolling and clicking.
    pub settle_delay: Duration,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            grid_wait: Duration::from_secs(10),
            poll_interval: Duration::from_millis(250),
            settle_delay: Duration::from_millis(500),
        }
    }
}

/// Pick the click target among matching tiles.
///
/// Tiles are tried in document order. Within a tile, the nearest semantic
/// ancestor wins; otherwise the nearest sufficiently large pointer-cursor
/// ancestor. The first tile yielding either is used.
pub fn choose_target(candidates: &[TileCandidate]) -> Option<TargetRef> {
    for (tile, candidate) in candidates.iter().enumerate() {
        let mut fallback = None;
        for (depth, ancestor) in candidate.ancestors.iter().enumerate() {
            if ancestor.is_semantic_clickable() {
                return Some(TargetRef {
                    tile,
                    depth,
                    kind: TargetKind::Semantic,
                });
            }
            if fallback.is_none() && ancestor.is_pointer_target(MIN_FALLBACK_SIZE) {
                fallback = Some(TargetRef {
                    tile,
                    depth,
                    kind: TargetKind::Fallback,
                });
            }
        }
        if fallback.is_some() {
            return fallback;
        }
    }
    None
}

/// Resolves and clicks channel tiles.
#[derive(Debug, Clone, Default)]
pub struct ChannelSelector {
    config: SelectorConfig,
}

impl ChannelSelector {
    pub fn new(config: SelectorConfig) -> Self {
        Self { config }
    }

    /// Find the tile for `slug` and click it.
    ///
    /// Returns the clicked point.
    pub async fn select_channel(
        &self,
        page: &dyn CapturePage,
        slug: &str,
        session_id: u64,
    ) -> Result<Point, SelectError> {
        self.wait_for_grid(page, slug, session_id).await;

        let candidates = page.tile_candidates(slug).await?;
        debug!(
            "[Session {}] {} tile(s) match '{}'",
            session_id,
            candidates.len(),
            slug
        );
        let target = choose_target(&candidates).ok_or(SelectError::TileNotFound)?;

        let visible = page
            .reveal_target(slug, target)
            .await?
            .ok_or(SelectError::TileNotFound)?;
        let point = visible
            .visible_center()
            .ok_or_else(|| SelectError::NotVisible(slug.to_string()))?;

        tokio::time::sleep(self.config.settle_delay).await;
        page.click(point).await?;

        info!(
            "[Session {}] Clicked '{}' ({:?} target, tile {}, depth {}) at ({:.0}, {:.0})",
            session_id, slug, target.kind, target.tile, target.depth, point.x, point.y
        );
        Ok(point)
    }

    /// Poll until an image matching the slug exists.
    ///
    /// Timing out is not an error: the search runs against whatever loaded.
    async fn wait_for_grid(&self, page: &dyn CapturePage, slug: &str, session_id: u64) {
        let started = Instant::now();
        loop {
            match page.slug_image_present(slug).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => debug!("[Session {}] Grid probe failed: {}", session_id, e),
            }
            if started.elapsed() >= self.config.grid_wait {
                warn!(
                    "[Session {}] No image matching '{}' after {:?}, searching anyway",
                    session_id, slug, self.config.grid_wait
                );
                return;
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
