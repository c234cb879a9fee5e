//! Browser fallback for bot-challenged pages
//!
//! The fetcher only sees the [`PageRenderer`] capability. Which implementation is
//! behind it is decided once, at construction:
//! - [`DisabledRenderer`] turns every challenge into a terminal `Blocked` failure
//! - [`BrowserPool`] renders the page in a bounded pool of reusable sessions
//!
//! Sessions come from a [`SessionLauncher`]. With the `browser` feature the
//! launcher drives headless Chromium over the DevTools protocol.

use crate::config::{BrowserConfig, Settings};
use crate::crawler::fetcher::{FetchRequest, RawPage};
use crate::FetchError;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Semaphore;

/// Renders a source page through something other than the primary HTTP client
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Renders the requested page and returns its HTML
    async fn render(&self, request: &FetchRequest) -> Result<RawPage, FetchError>;
}

/// Errors raised by browser sessions
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Failed to launch browser: {0}")]
    Launch(String),

    #[error("Browser session error: {0}")]
    Session(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// A live browser able to render pages one at a time
#[async_trait]
pub trait BrowserSession: Send {
    /// Navigates to `url` and waits until `wait_selector` matches or `timeout` expires
    async fn render(
        &mut self,
        url: &str,
        wait_selector: &str,
        timeout: Duration,
    ) -> Result<String, BrowserError>;

    /// Tears the session down
    async fn shutdown(&mut self);
}

/// Creates browser sessions for the pool
#[async_trait]
pub trait SessionLauncher: Send + Sync {
    type Session: BrowserSession + 'static;

    async fn launch(&self) -> Result<Self::Session, BrowserError>;
}

/// Renderer used when the browser fallback is turned off
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledRenderer;

#[async_trait]
impl PageRenderer for DisabledRenderer {
    async fn render(&self, request: &FetchRequest) -> Result<RawPage, FetchError> {
        Err(FetchError::Blocked {
            url: request.url.to_string(),
            reason: "bot challenge and browser fallback is disabled".to_string(),
        })
    }
}

/// Bounded pool of reusable browser sessions
///
/// At most `max_instances` sessions exist at once. Waiting for a free slot is
/// bounded by the page-load timeout. A session that errors is shut down and
/// never returned to the pool.
pub struct BrowserPool<L: SessionLauncher> {
    launcher: L,
    capacity: Semaphore,
    idle: Mutex<Vec<L::Session>>,
    page_load_timeout: Duration,
}

impl<L: SessionLauncher> BrowserPool<L> {
    /// Creates an empty pool; sessions are launched on first use
    ///
    /// # Arguments
    ///
    /// * `launcher` - Creates new sessions
    /// * `max_instances` - Hard cap on live sessions
    /// * `page_load_timeout` - Bound on slot acquisition and on each render
    pub fn new(launcher: L, max_instances: usize, page_load_timeout: Duration) -> Self {
        Self {
            launcher,
            capacity: Semaphore::new(max_instances.max(1)),
            idle: Mutex::new(Vec::new()),
            page_load_timeout,
        }
    }

    /// Number of sessions waiting for reuse
    pub fn idle_sessions(&self) -> usize {
        self.lock_idle().len()
    }

    fn take_idle(&self) -> Option<L::Session> {
        self.lock_idle().pop()
    }

    fn return_idle(&self, session: L::Session) {
        self.lock_idle().push(session);
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<L::Session>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<L: SessionLauncher> PageRenderer for BrowserPool<L> {
    async fn render(&self, request: &FetchRequest) -> Result<RawPage, FetchError> {
        let url = request.url.to_string();
        let browser_error = |message: String| FetchError::Browser {
            url: url.clone(),
            message,
        };
        let started = Instant::now();

        let _permit = tokio::time::timeout(self.page_load_timeout, self.capacity.acquire())
            .await
            .map_err(|_| browser_error("timed out waiting for a browser session".to_string()))?
            .map_err(|e| browser_error(e.to_string()))?;

        let mut session = match self.take_idle() {
            Some(session) => session,
            None => {
                tracing::debug!(source = %request.source_name, "Launching browser session");
                self.launcher
                    .launch()
                    .await
                    .map_err(|e| browser_error(e.to_string()))?
            }
        };

        let selector = format!("table#{}", request.table_id);
        match session
            .render(&url, &selector, self.page_load_timeout)
            .await
        {
            Ok(content) => {
                self.return_idle(session);
                tracing::info!(
                    source = %request.source_name,
                    elapsed = ?started.elapsed(),
                    "Page rendered via browser fallback"
                );
                Ok(RawPage {
                    content,
                    status: None,
                    final_url: url,
                    latency: started.elapsed(),
                })
            }
            Err(e) => {
                tracing::warn!(source = %request.source_name, error = %e, "Discarding failed browser session");
                session.shutdown().await;
                Err(browser_error(e.to_string()))
            }
        }
    }
}

/// Builds the renderer selected by configuration
pub fn build_renderer(settings: &Settings) -> Arc<dyn PageRenderer> {
    let config = &settings.advanced.selenium;
    if !config.enabled {
        return Arc::new(DisabledRenderer);
    }
    build_browser_pool(config)
}

#[cfg(feature = "browser")]
fn build_browser_pool(config: &BrowserConfig) -> Arc<dyn PageRenderer> {
    tracing::info!(
        max_instances = config.max_instances,
        "Browser fallback enabled"
    );
    Arc::new(BrowserPool::new(
        chrome::ChromeLauncher,
        config.max_instances as usize,
        Duration::from_secs(config.page_load_timeout),
    ))
}

#[cfg(not(feature = "browser"))]
fn build_browser_pool(_config: &BrowserConfig) -> Arc<dyn PageRenderer> {
    tracing::warn!("Browser fallback requested but built without the `browser` feature");
    Arc::new(DisabledRenderer)
}

#[cfg(feature = "browser")]
pub mod chrome {
    //! Headless Chromium sessions over the DevTools protocol

    use super::{BrowserError, BrowserSession, SessionLauncher};
    use async_trait::async_trait;
    use chromiumoxide::browser::{Browser, BrowserConfig};
    use chromiumoxide::Page;
    use futures::StreamExt;
    use std::time::Duration;
    use tokio::task::JoinHandle;

    /// Interval between checks for the target table
    const POLL_INTERVAL: Duration = Duration::from_millis(250);

    #[derive(Debug, Default, Clone, Copy)]
    pub struct ChromeLauncher;

    pub struct ChromeSession {
        browser: Browser,
        handler: JoinHandle<()>,
    }

    #[async_trait]
    impl SessionLauncher for ChromeLauncher {
        type Session = ChromeSession;

        async fn launch(&self) -> Result<ChromeSession, BrowserError> {
            let config = BrowserConfig::builder()
                .no_sandbox()
                .build()
                .map_err(BrowserError::Launch)?;
            let (browser, mut handler) = Browser::launch(config)
                .await
                .map_err(|e| BrowserError::Launch(e.to_string()))?;

            let handler = tokio::spawn(async move {
                while let Some(event) = handler.next().await {
                    if event.is_err() {
                        break;
                    }
                }
            });

            Ok(ChromeSession { browser, handler })
        }
    }

    #[async_trait]
    impl BrowserSession for ChromeSession {
        async fn render(
            &mut self,
            url: &str,
            wait_selector: &str,
            timeout: Duration,
        ) -> Result<String, BrowserError> {
            let page = self
                .browser
                .new_page("about:blank")
                .await
                .map_err(|e| BrowserError::Session(e.to_string()))?;

            let rendered = tokio::time::timeout(timeout, load(&page, url, wait_selector)).await;
            // The tab is closed whatever happened; the session itself stays usable
            let _ = page.close().await;

            match rendered {
                Ok(result) => result,
                Err(_) => Err(BrowserError::Timeout(timeout)),
            }
        }

        async fn shutdown(&mut self) {
            let _ = self.browser.close().await;
            self.handler.abort();
        }
    }

    async fn load(page: &Page, url: &str, wait_selector: &str) -> Result<String, BrowserError> {
        page.goto(url)
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))?;

        while page.find_element(wait_selector).await.is_err() {
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        page.content()
            .await
            .map_err(|e| BrowserError::Session(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Launcher whose sessions fail on a configurable render number
    struct FakeLauncher {
        launched: Arc<AtomicUsize>,
        shutdowns: Arc<AtomicUsize>,
        fail_on_render: Option<usize>,
        renders: Arc<AtomicUsize>,
        render_time: Duration,
    }

    struct FakeSession {
        shutdowns: Arc<AtomicUsize>,
        fail_on_render: Option<usize>,
        renders: Arc<AtomicUsize>,
        render_time: Duration,
    }

    impl FakeLauncher {
        fn new() -> Self {
            Self {
                launched: Arc::new(AtomicUsize::new(0)),
                shutdowns: Arc::new(AtomicUsize::new(0)),
                fail_on_render: None,
                renders: Arc::new(AtomicUsize::new(0)),
                render_time: Duration::ZERO,
            }
        }
    }

    #[async_trait]
    impl SessionLauncher for FakeLauncher {
        type Session = FakeSession;

        async fn launch(&self) -> Result<FakeSession, BrowserError> {
            self.launched.fetch_add(1, Ordering::SeqCst);
            Ok(FakeSession {
                shutdowns: self.shutdowns.clone(),
                fail_on_render: self.fail_on_render,
                renders: self.renders.clone(),
                render_time: self.render_time,
            })
        }
    }

    #[async_trait]
    impl BrowserSession for FakeSession {
        async fn render(
            &mut self,
            url: &str,
            wait_selector: &str,
            _timeout: Duration,
        ) -> Result<String, BrowserError> {
            let n = self.renders.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.render_time).await;
            if Some(n) == self.fail_on_render {
                return Err(BrowserError::Session("tab crashed".to_string()));
            }
            Ok(format!("<html><!-- {} {} --></html>", url, wait_selector))
        }

        async fn shutdown(&mut self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn create_test_request() -> FetchRequest {
        FetchRequest {
            source_name: "latest_filings".to_string(),
            url: Url::parse("http://openinsider.com/latest-insider-trading?maxrows=20").unwrap(),
            table_id: "insidertrades".to_string(),
        }
    }

    #[tokio::test]
    async fn test_disabled_renderer_reports_blocked() {
        let result = DisabledRenderer.render(&create_test_request()).await;
        assert!(matches!(result, Err(FetchError::Blocked { .. })));
    }

    #[tokio::test]
    async fn test_pool_reuses_sessions() {
        let launcher = FakeLauncher::new();
        let launched = launcher.launched.clone();
        let pool = BrowserPool::new(launcher, 2, Duration::from_secs(5));

        for _ in 0..3 {
            let page = pool.render(&create_test_request()).await.unwrap();
            assert!(page.status.is_none());
            assert!(page.content.contains("table#insidertrades"));
        }

        assert_eq!(launched.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_sessions(), 1);
    }

    #[tokio::test]
    async fn test_failed_session_is_discarded() {
        let mut launcher = FakeLauncher::new();
        launcher.fail_on_render = Some(1);
        let launched = launcher.launched.clone();
        let shutdowns = launcher.shutdowns.clone();
        let pool = BrowserPool::new(launcher, 1, Duration::from_secs(5));

        let first = pool.render(&create_test_request()).await;
        assert!(matches!(first, Err(FetchError::Browser { .. })));
        assert_eq!(shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_sessions(), 0);

        let second = pool.render(&create_test_request()).await;
        assert!(second.is_ok());
        assert_eq!(launched.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_pool_never_exceeds_capacity() {
        let mut launcher = FakeLauncher::new();
        launcher.render_time = Duration::from_millis(50);
        let launched = launcher.launched.clone();
        let pool = Arc::new(BrowserPool::new(launcher, 2, Duration::from_secs(5)));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let pool = pool.clone();
                tokio::spawn(async move { pool.render(&create_test_request()).await })
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }

        assert!(launched.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_exhausted_pool_times_out() {
        let mut launcher = FakeLauncher::new();
        launcher.render_time = Duration::from_millis(300);
        let pool = Arc::new(BrowserPool::new(launcher, 1, Duration::from_millis(50)));

        let busy = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.render(&create_test_request()).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiting = pool.render(&create_test_request()).await;
        assert!(matches!(waiting, Err(FetchError::Browser { .. })));
        let _ = busy.await;
    }

    #[test]
    fn test_build_renderer_disabled_by_default() {
        // Only checks construction; the disabled renderer needs no browser binary
        let _renderer = build_renderer(&Settings::default());
    }
}
