//! Page pool handing isolated pages to sessions.

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::RwLock;

use super::{BrowserBackend, BrowserError, CapturePage, PageId};

/// Stylesheet injected into every captured document: no motion, no delays.
pub const NO_ANIMATION_STYLESHEET: &str = "*, *::before, *::after { \
animation-duration: 0s !important; animation-delay: 0s !important; \
transition-duration: 0s !important; transition-delay: 0s !important; \
scroll-behavior: auto !important; }";

/// Pool of pages currently owned by sessions.
///
/// Pages are never shared: each acquisition opens a fresh page and each
/// release closes it.
pub struct PagePool {
    backend: Arc<dyn BrowserBackend>,
    /// Pages handed out and not yet released.
    in_use: RwLock<HashMap<PageId, Arc<dyn CapturePage>>>,
}

impl PagePool {
    pub fn new(backend: Arc<dyn BrowserBackend>) -> Self {
        Self {
            backend,
            in_use: RwLock::new(HashMap::new()),
        }
    }

    /// Open a fresh page with CSP bypassed and animations disabled.
    ///
    /// Cancel-safe: if the caller is dropped before the page is tracked, the
    /// page is closed in the background.
    pub async fn acquire_page(&self) -> Result<Arc<dyn CapturePage>, BrowserError> {
        let pending = PendingPage::new(self.backend.new_page().await?);

        if let Err(e) = pending.page.harden(NO_ANIMATION_STYLESHEET).await {
            warn!("Failed to prepare {}: {}", pending.page.id(), e);
            return Err(e);
        }

        let mut pages = self.in_use.write().await;
        let page = pending.hand_over();
        pages.insert(page.id(), Arc::clone(&page));
        info!("Acquired {} ({} in use)", page.id(), pages.len());
        Ok(page)
    }

    /// Remove the page from the in-use set and close it.
    ///
    /// Never fails: closing an already-closed or unknown page is ignored.
    pub async fn release_page(&self, page: &Arc<dyn CapturePage>) {
        let id = page.id();
        let removed = self.in_use.write().await.remove(&id).is_some();
        if !removed {
            debug!("Releasing {} which was not in use", id);
        }

        match page.close().await {
            Ok(()) => info!("Released {}", id),
            Err(e) => debug!("Ignoring close error for {}: {}", id, e),
        }
    }

    pub async fn in_use_count(&self) -> usize {
        self.in_use.read().await.len()
    }

    pub async fn is_in_use(&self, id: PageId) -> bool {
        self.in_use.read().await.contains_key(&id)
    }
}

/// A page opened but not yet tracked by the pool. Closed on drop unless
/// handed over.
struct PendingPage {
    page: Arc<dyn CapturePage>,
    armed: bool,
}

impl PendingPage {
    fn new(page: Arc<dyn CapturePage>) -> Self {
        Self { page, armed: true }
    }

    fn hand_over(mut self) -> Arc<dyn CapturePage> {
        self.armed = false;
        Arc::clone(&self.page)
    }
}

impl Drop for PendingPage {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let page = Arc::clone(&self.page);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    match page.close().await {
                        Ok(()) => debug!("Closed unclaimed {}", page.id()),
                        Err(e) => debug!("Ignoring close error for {}: {}", page.id(), e),
                    }
                });
            }
            Err(_) => warn!("{} dropped outside the runtime; not closed", page.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::testing::{StubBackend, StubBehavior};
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[tokio::test]
    async fn test_acquire_hardens_and_tracks() {
        let backend = Arc::new(StubBackend::new(StubBehavior::default()));
        let pool = PagePool::new(backend.clone());

        let a = pool.acquire_page().await.unwrap();
        let b = pool.acquire_page().await.unwrap();

        assert_ne!(a.id(), b.id());
        assert_eq!(pool.in_use_count().await, 2);
        assert!(backend.last_page().unwrap().hardened.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_release_closes_and_tolerates_repeat() {
        let backend = Arc::new(StubBackend::new(StubBehavior::default()));
        let pool = PagePool::new(backend.clone());

        let page = pool.acquire_page().await.unwrap();
        pool.release_page(&page).await;
        pool.release_page(&page).await;

        assert_eq!(pool.in_use_count().await, 0);
        assert!(!pool.is_in_use(page.id()).await);
        assert_eq!(backend.last_page().unwrap().close_count(), 2);
    }

    #[tokio::test]
    async fn test_cancelled_acquire_closes_page() {
        let backend = Arc::new(StubBackend::new(StubBehavior {
            stall_harden: true,
            ..Default::default()
        }));
        let pool = PagePool::new(backend.clone());

        let result = tokio::time::timeout(Duration::from_millis(50), pool.acquire_page()).await;
        assert!(result.is_err());

        let page = backend.last_page().unwrap();
        for _ in 0..50 {
            if page.close_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(page.close_count(), 1);
        assert_eq!(pool.in_use_count().await, 0);
    }

    #[tokio::test]
    async fn test_failed_harden_closes_page() {
        let backend = Arc::new(StubBackend::new(StubBehavior {
            fail_harden: true,
            ..Default::default()
        }));
        let pool = PagePool::new(backend.clone());

        assert!(pool.acquire_page().await.is_err());
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.last_page().unwrap().close_count(), 1);
        assert_eq!(pool.in_use_count().await, 0);
    }
}
