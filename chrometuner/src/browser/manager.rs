//! Shared browser process management.
//!
//! One browser serves every session. It is launched lazily on first use and
//! relaunched on the next request after it disconnects. Concurrent callers
//! during a launch wait for that launch instead of starting their own.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chromiumoxide::cdp::browser_protocol::target::{EventTargetCreated, EventTargetDestroyed};
use chromiumoxide::{Browser, BrowserConfig};
use futures::StreamExt;
use log::{debug, info, warn};

use super::cdp::CdpPage;
use super::{BrowserBackend, BrowserError, CapturePage, PageId};

/// Arguments that let a page capture itself without prompts.
const CAPTURE_ARGS: &[&str] = &[
    "--autoplay-policy=no-user-gesture-required",
    "--auto-accept-this-tab-capture",
    "--disable-blink-features=AutomationControlled",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--no-first-run",
    "--no-default-browser-check",
];

/// Browser launch settings.
#[derive(Debug, Clone)]
pub struct BrowserOptions {
    /// Persistent profile directory (keeps site logins).
    pub profile_dir: PathBuf,
    /// Browser executable; auto-detected when `None`.
    pub executable: Option<PathBuf>,
    pub headless: bool,
    pub window_width: u32,
    pub window_height: u32,
    pub extra_args: Vec<String>,
}

impl Default for BrowserOptions {
    fn default() -> Self {
        Self {
            profile_dir: PathBuf::from("chrometuner-profile"),
            executable: None,
            headless: false,
            window_width: 1280,
            window_height: 808,
            extra_args: Vec::new(),
        }
    }
}

impl BrowserOptions {
    /// Full argument list passed to the browser.
    pub fn args(&self) -> Vec<String> {
        CAPTURE_ARGS
            .iter()
            .map(|s| s.to_string())
            .chain(self.extra_args.iter().cloned())
            .collect()
    }
}

/// Lifecycle of the shared browser.
enum BrowserState<T> {
    /// Never launched.
    Absent,
    /// A launch is in progress.
    Launching { generation: u64 },
    Connected { browser: T, generation: u64 },
    /// The connection dropped; the next request relaunches.
    Disconnected,
}

impl<T> BrowserState<T> {
    fn name(&self) -> &'static str {
        match self {
            BrowserState::Absent => "absent",
            BrowserState::Launching { .. } => "launching",
            BrowserState::Connected { .. } => "connected",
            BrowserState::Disconnected => "disconnected",
        }
    }

    fn is_generation(&self, current: u64) -> bool {
        match self {
            BrowserState::Launching { generation } | BrowserState::Connected { generation, .. } => {
                *generation == current
            }
            _ => false,
        }
    }
}

/// Single-flight holder of one browser connection.
struct BrowserSlot<T> {
    state: Arc<Mutex<BrowserState<T>>>,
    /// Serializes launches so only one runs at a time.
    launch_lock: tokio::sync::Mutex<()>,
    generation: AtomicU64,
}

impl<T: Clone> BrowserSlot<T> {
    fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrowserState::Absent)),
            launch_lock: tokio::sync::Mutex::new(()),
            generation: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BrowserState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_name(&self) -> &'static str {
        self.lock().name()
    }

    fn connected(&self) -> Option<T> {
        match &*self.lock() {
            BrowserState::Connected { browser, .. } => Some(browser.clone()),
            _ => None,
        }
    }

    /// Return the connected browser, or run `launch` if there is none.
    ///
    /// `launch` gets the new generation number and a notice to fire when
    /// that connection drops.
    async fn get_or_launch<F, Fut>(&self, launch: F) -> Result<T, BrowserError>
    where
        F: FnOnce(u64, DisconnectNotice<T>) -> Fut,
        Fut: Future<Output = Result<T, BrowserError>>,
    {
        if let Some(browser) = self.connected() {
            return Ok(browser);
        }

        let _launch = self.launch_lock.lock().await;
        // Another caller may have finished a launch while we waited.
        if let Some(browser) = self.connected() {
            return Ok(browser);
        }

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.lock() = BrowserState::Launching { generation };
        let notice = DisconnectNotice {
            state: Arc::clone(&self.state),
            generation,
        };

        match launch(generation, notice).await {
            Ok(browser) => {
                let mut state = self.lock();
                if state.is_generation(generation) {
                    *state = BrowserState::Connected {
                        browser: browser.clone(),
                        generation,
                    };
                } else {
                    warn!("[Browser] Generation {} dropped while launching", generation);
                }
                Ok(browser)
            }
            Err(e) => {
                *self.lock() = BrowserState::Absent;
                Err(e)
            }
        }
    }
}

/// Marks one browser generation as disconnected.
struct DisconnectNotice<T> {
    state: Arc<Mutex<BrowserState<T>>>,
    generation: u64,
}

impl<T> DisconnectNotice<T> {
    /// Returns false if a newer generation has already replaced this one.
    fn disconnected(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !state.is_generation(self.generation) {
            debug!("[Browser] Ignoring stale disconnect (generation {})", self.generation);
            return false;
        }
        warn!("[Browser] Disconnected (generation {})", self.generation);
        *state = BrowserState::Disconnected;
        true
    }
}

/// Owner of the shared browser.
pub struct BrowserManager {
    options: BrowserOptions,
    slot: BrowserSlot<Arc<Browser>>,
    next_page_id: AtomicU64,
}

impl BrowserManager {
    pub fn new(options: BrowserOptions) -> Self {
        Self {
            options,
            slot: BrowserSlot::new(),
            next_page_id: AtomicU64::new(0),
        }
    }

    /// Current lifecycle state name, for status pages.
    pub fn state_name(&self) -> &'static str {
        self.slot.state_name()
    }

    /// Return the connected browser, launching it if needed.
    pub async fn acquire(&self) -> Result<Arc<Browser>, BrowserError> {
        self.slot
            .get_or_launch(|generation, notice| launch(&self.options, generation, notice))
            .await
    }
}

async fn launch(
    options: &BrowserOptions,
    generation: u64,
    notice: DisconnectNotice<Arc<Browser>>,
) -> Result<Arc<Browser>, BrowserError> {
    info!(
        "[Browser] Launching (generation {}, profile {})",
        generation,
        options.profile_dir.display()
    );

    let mut builder = BrowserConfig::builder()
        .user_data_dir(&options.profile_dir)
        .window_size(options.window_width, options.window_height)
        .viewport(None::<chromiumoxide::handler::viewport::Viewport>)
        .args(options.args());
    if !options.headless {
        builder = builder.with_head();
    }
    if let Some(executable) = &options.executable {
        builder = builder.chrome_executable(executable);
    }
    let config = builder.build().map_err(BrowserError::Launch)?;

    let (browser, mut handler) = Browser::launch(config)
        .await
        .map_err(|e| BrowserError::Launch(e.to_string()))?;

    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if let Err(e) = event {
                debug!("[Browser] Handler error: {}", e);
            }
        }
        notice.disconnected();
    });

    watch_targets(&browser).await;
    info!("[Browser] Connected (generation {})", generation);
    Ok(Arc::new(browser))
}

/// Log target creation and destruction for diagnostics.
async fn watch_targets(browser: &Browser) {
    match browser.event_listener::<EventTargetCreated>().await {
        Ok(mut created) => {
            tokio::spawn(async move {
                while let Some(event) = created.next().await {
                    debug!(
                        "[Browser] Target created: {} {}",
                        event.target_info.r#type, event.target_info.url
                    );
                }
            });
        }
        Err(e) => debug!("[Browser] Cannot watch target creation: {}", e),
    }
    match browser.event_listener::<EventTargetDestroyed>().await {
        Ok(mut destroyed) => {
            tokio::spawn(async move {
                while let Some(event) = destroyed.next().await {
                    debug!("[Browser] Target destroyed: {:?}", event.target_id);
                }
            });
        }
        Err(e) => debug!("[Browser] Cannot watch target destruction: {}", e),
    }
}

#[async_trait]
impl BrowserBackend for BrowserManager {
    async fn new_page(&self) -> Result<Arc<dyn CapturePage>, BrowserError> {
        let browser = self.acquire().await?;
        let page = browser.new_page("about:blank").await?;
        let id = PageId(self.next_page_id.fetch_add(1, Ordering::SeqCst) + 1);
        debug!("[Browser] Opened {}", id);
        Ok(Arc::new(CdpPage::new(id, page)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn test_args_include_capture_flags() {
        let options = BrowserOptions {
            extra_args: vec!["--lang=en-US".to_string()],
            ..Default::default()
        };
        let args = options.args();
        assert!(args.iter().any(|a| a == "--auto-accept-this-tab-capture"));
        assert_eq!(args.last().map(String::as_str), Some("--lang=en-US"));
    }

    #[test]
    fn test_initial_state_absent() {
        let manager = BrowserManager::new(BrowserOptions::default());
        assert_eq!(manager.state_name(), "absent");
    }

    async fn counted_launch(launches: &AtomicUsize, generation: u64) -> Result<u64, BrowserError> {
        launches.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(generation)
    }

    #[tokio::test]
    async fn test_concurrent_acquires_share_one_launch() {
        let slot = BrowserSlot::<u64>::new();
        let launches = AtomicUsize::new(0);

        let (a, b) = tokio::join!(
            slot.get_or_launch(|g, _| counted_launch(&launches, g)),
            slot.get_or_launch(|g, _| counted_launch(&launches, g)),
        );

        assert_eq!(a.unwrap(), 1);
        assert_eq!(b.unwrap(), 1);
        assert_eq!(launches.load(Ordering::SeqCst), 1);
        assert_eq!(slot.state_name(), "connected");
    }

    #[tokio::test]
    async fn test_disconnect_relaunches_next_generation() {
        let slot = BrowserSlot::<u64>::new();
        let launches = AtomicUsize::new(0);
        let notices = Mutex::new(Vec::new());

        let first = slot
            .get_or_launch(|g, notice| {
                notices.lock().unwrap().push(notice);
                counted_launch(&launches, g)
            })
            .await
            .unwrap();
        assert_eq!(first, 1);

        assert!(notices.lock().unwrap()[0].disconnected());
        assert_eq!(slot.state_name(), "disconnected");

        let second = slot
            .get_or_launch(|g, notice| {
                notices.lock().unwrap().push(notice);
                counted_launch(&launches, g)
            })
            .await
            .unwrap();
        assert_eq!(second, 2);
        assert_eq!(launches.load(Ordering::SeqCst), 2);

        // The first generation going away again must not affect the second.
        assert!(!notices.lock().unwrap()[0].disconnected());
        assert_eq!(slot.state_name(), "connected");
        assert_eq!(slot.connected(), Some(2));
    }

    #[tokio::test]
    async fn test_failed_launch_resets_to_absent() {
        let slot = BrowserSlot::<u64>::new();
        let launches = AtomicUsize::new(0);

        let err = slot
            .get_or_launch(|_, _| async { Err(BrowserError::Launch("no executable".to_string())) })
            .await
            .err()
            .unwrap();
        assert!(matches!(err, BrowserError::Launch(_)));
        assert_eq!(slot.state_name(), "absent");

        let browser = slot
            .get_or_launch(|g, _| counted_launch(&launches, g))
            .await
            .unwrap();
        assert_eq!(browser, 2);
    }

    #[tokio::test]
    async fn test_disconnect_during_launch_is_kept() {
        let slot = BrowserSlot::<u64>::new();
        let launches = AtomicUsize::new(0);

        slot.get_or_launch(|g, notice| {
            assert!(notice.disconnected());
            counted_launch(&launches, g)
        })
        .await
        .unwrap();

        assert_eq!(slot.state_name(), "disconnected");
        assert_eq!(slot.connected(), None);
    }
}
