//! In-memory browser used by tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use super::capture::{CaptureConstraints, CaptureGeometry, CaptureHandle, CaptureStream};
use super::dom::{ElementBox, Point, TargetRef, TileCandidate, VideoState, VisibleBox};
use super::{BrowserBackend, BrowserError, CapturePage, PageId};

/// Behaviour shared by every page a [`StubBackend`] opens.
#[derive(Debug, Clone)]
pub struct StubBehavior {
    pub tiles: Vec<TileCandidate>,
    pub video: Option<VideoState>,
    pub fail_capture: bool,
    /// `harden` fails.
    pub fail_harden: bool,
    /// `harden` never completes.
    pub stall_harden: bool,
    pub viewport: (f64, f64),
}

impl Default for StubBehavior {
    fn default() -> Self {
        Self {
            tiles: Vec::new(),
            video: Some(VideoState {
                ready_state: 4,
                current_time: 2.0,
            }),
            fail_capture: false,
            fail_harden: false,
            stall_harden: false,
            viewport: (1280.0, 720.0),
        }
    }
}

pub struct StubPage {
    id: PageId,
    behavior: StubBehavior,
    pub clicks: Mutex<Vec<Point>>,
    pub navigations: Mutex<Vec<String>>,
    pub hardened: AtomicBool,
    pub closes: AtomicUsize,
    chunk_tx: Mutex<Option<mpsc::Sender<io::Result<Bytes>>>>,
}

impl StubPage {
    pub fn new(id: PageId, behavior: StubBehavior) -> Self {
        Self {
            id,
            behavior,
            clicks: Mutex::new(Vec::new()),
            navigations: Mutex::new(Vec::new()),
            hardened: AtomicBool::new(false),
            closes: AtomicUsize::new(0),
            chunk_tx: Mutex::new(None),
        }
    }

    pub fn clicks(&self) -> Vec<Point> {
        self.clicks.lock().unwrap().clone()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Sender feeding the capture stream, once capture has started.
    pub fn chunk_sender(&self) -> Option<mpsc::Sender<io::Result<Bytes>>> {
        self.chunk_tx.lock().unwrap().clone()
    }

    /// End the capture stream as if the recorder stopped.
    pub fn end_capture(&self) {
        self.chunk_tx.lock().unwrap().take();
    }

    fn ancestor_box(&self, target: TargetRef) -> Option<ElementBox> {
        self.behavior
            .tiles
            .get(target.tile)
            .and_then(|tile| tile.ancestors.get(target.depth))
            .map(|a| a.rect)
    }
}

#[async_trait]
impl CapturePage for StubPage {
    fn id(&self) -> PageId {
        self.id
    }

    async fn harden(&self, _stylesheet: &str) -> Result<(), BrowserError> {
        if self.behavior.stall_harden {
            std::future::pending::<()>().await;
        }
        if self.behavior.fail_harden {
            return Err(BrowserError::Script("addScriptToEvaluateOnNewDocument failed".to_string()));
        }
        self.hardened.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        self.navigations.lock().unwrap().push(url.to_string());
        Ok(())
    }

    async fn apply_geometry(&self, _geometry: &CaptureGeometry) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn start_capture(
        &self,
        _constraints: &CaptureConstraints,
    ) -> Result<CaptureStream, BrowserError> {
        if self.behavior.fail_capture {
            return Err(BrowserError::Script("getDisplayMedia failed".to_string()));
        }
        let (tx, rx) = mpsc::channel(64);
        tx.send(Ok(Bytes::from_static(b"\x1a\x45\xdf\xa3")))
            .await
            .map_err(|_| BrowserError::Disconnected)?;
        *self.chunk_tx.lock().unwrap() = Some(tx);
        Ok(CaptureStream::new(
            "video/webm;codecs=h264,opus",
            rx,
            CaptureHandle::detached(),
        ))
    }

    async fn slug_image_present(&self, _slug: &str) -> Result<bool, BrowserError> {
        Ok(!self.behavior.tiles.is_empty())
    }

    async fn tile_candidates(&self, _slug: &str) -> Result<Vec<TileCandidate>, BrowserError> {
        Ok(self.behavior.tiles.clone())
    }

    async fn reveal_target(
        &self,
        _slug: &str,
        target: TargetRef,
    ) -> Result<Option<VisibleBox>, BrowserError> {
        let (viewport_width, viewport_height) = self.behavior.viewport;
        Ok(self.ancestor_box(target).map(|rect| VisibleBox {
            rect,
            viewport_width,
            viewport_height,
        }))
    }

    async fn click(&self, point: Point) -> Result<(), BrowserError> {
        self.clicks.lock().unwrap().push(point);
        Ok(())
    }

    async fn video_state(&self) -> Result<Option<VideoState>, BrowserError> {
        Ok(self.behavior.video)
    }

    async fn enter_fullscreen(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn minimize_window(&self) -> Result<(), BrowserError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), BrowserError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.end_capture();
        Ok(())
    }
}

/// Backend that hands out [`StubPage`]s and remembers them.
#[derive(Default)]
pub struct StubBackend {
    behavior: StubBehavior,
    next_id: AtomicU64,
    pages: Mutex<Vec<Arc<StubPage>>>,
}

impl StubBackend {
    pub fn new(behavior: StubBehavior) -> Self {
        Self {
            behavior,
            next_id: AtomicU64::new(0),
            pages: Mutex::new(Vec::new()),
        }
    }

    pub fn opened(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn last_page(&self) -> Option<Arc<StubPage>> {
        self.pages.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl BrowserBackend for StubBackend {
    async fn new_page(&self) -> Result<Arc<dyn CapturePage>, BrowserError> {
        let id = PageId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let page = Arc::new(StubPage::new(id, self.behavior.clone()));
        self.pages.lock().unwrap().push(Arc::clone(&page));
        Ok(page)
    }
}

/// A tile whose nearest ancestor is a link covering `rect`.
pub fn link_tile(rect: ElementBox) -> TileCandidate {
    use super::dom::AncestorInfo;

    TileCandidate {
        ancestors: vec![
            AncestorInfo {
                tag: "div".to_string(),
                role: None,
                has_click_handler: false,
                cursor: "auto".to_string(),
                rect: ElementBox::new(rect.x + 10.0, rect.y + 10.0, 10.0, 10.0),
            },
            AncestorInfo {
                tag: "a".to_string(),
                role: None,
                has_click_handler: false,
                cursor: "pointer".to_string(),
                rect,
            },
        ],
    }
}
