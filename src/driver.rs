//! Browser automation driver abstraction.
//!
//! The pool and executor only ever see the [`BrowserDriver`] trait; the
//! concrete engine behind a session is chosen by the pool via
//! [`DriverFactory`] and escalated along [`EngineType::fallback`] after
//! repeated warmup failures. Tests plug in a mock factory.

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptions, Tab};
use serde::Serialize;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;

/// Navigator patches applied to every fresh tab so basic automation probes
/// come back clean.
const NAVIGATOR_PATCHES: &str = r#"
    Object.defineProperty(navigator, 'webdriver', {
        get: () => undefined
    });
    Object.defineProperty(navigator, 'plugins', {
        get: () => [1, 2, 3, 4, 5]
    });
    Object.defineProperty(navigator, 'languages', {
        get: () => ['en-US', 'en']
    });
"#;

/// Extra fingerprint hardening for the stealth engine.
const STEALTH_PATCHES: &str = r#"
    window.chrome = { runtime: {} };
    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {
        if (parameter === 37445) { return 'Intel Inc.'; }
        if (parameter === 37446) { return 'Intel(R) Iris(TM) Plus Graphics 640'; }
        return getParameter.call(this, parameter);
    };
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
"#;

/// Automation engine behind a session. Ordered from cheapest to most
/// evasive; the pool escalates along `fallback()` after repeated failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EngineType {
    HeadlessChrome,
    HeadedChrome,
    HeadedChromeStealth,
}

impl EngineType {
    /// Next engine in the escalation chain. The terminal engine falls back
    /// to itself.
    pub fn fallback(self) -> EngineType {
        match self {
            EngineType::HeadlessChrome => EngineType::HeadedChrome,
            EngineType::HeadedChrome => EngineType::HeadedChromeStealth,
            EngineType::HeadedChromeStealth => EngineType::HeadedChromeStealth,
        }
    }

    /// Headed engines depend on a display server (see `watchdog`).
    pub fn is_headed(self) -> bool {
        !matches!(self, EngineType::HeadlessChrome)
    }

    pub fn name(self) -> &'static str {
        match self {
            EngineType::HeadlessChrome => "headless_chrome",
            EngineType::HeadedChrome => "headed_chrome",
            EngineType::HeadedChromeStealth => "headed_chrome_stealth",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    #[error("browser launch failed: {0}")]
    Launch(String),

    #[error("navigation failed: {0}")]
    Navigation(String),

    #[error("navigation timed out: {0}")]
    Timeout(String),

    #[error("script evaluation failed: {0}")]
    Evaluation(String),

    #[error("element not found: {0}")]
    ElementNotFound(String),

    #[error("browser task failed: {0}")]
    TaskFailed(String),
}

/// Minimal automation surface the warmup executor and lease holders need.
/// A driver instance backs exactly one session and is never shared across
/// concurrent callers (the pool's one-lease-per-session invariant).
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError>;
    async fn title(&self) -> Result<String, DriverError>;
    /// Visible text of the current page body.
    async fn visible_text(&self) -> Result<String, DriverError>;
    async fn has_selector(&self, selector: &str) -> Result<bool, DriverError>;
    async fn click(&self, selector: &str) -> Result<(), DriverError>;
    /// Same-origin link hrefs on the current page.
    async fn internal_links(&self) -> Result<Vec<String>, DriverError>;
    async fn go_back(&self) -> Result<(), DriverError>;
    async fn scroll_by(&self, pixels: i64) -> Result<(), DriverError>;
    async fn cookie_count(&self) -> Result<usize, DriverError>;
    async fn close(&self) -> Result<(), DriverError>;
}

/// Launches drivers for a given engine. The pool owns one factory and asks
/// it for a fresh driver whenever a session is created or escalated.
#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn launch(&self, engine: EngineType) -> Result<Arc<dyn BrowserDriver>, DriverError>;
}

/// Chrome/Chromium driver via `headless_chrome`. The underlying API is
/// blocking, so every call hops onto the blocking thread pool.
pub struct ChromeDriver {
    tab: Arc<Tab>,
    // Keeps the browser process alive for the lifetime of the driver.
    _browser: Arc<Browser>,
    engine: EngineType,
}

impl ChromeDriver {
    fn launch_blocking(engine: EngineType, window: (u32, u32)) -> Result<Self, DriverError> {
        let owned_args: Vec<String> = {
            let mut args = vec![
                "--disable-blink-features=AutomationControlled".to_string(),
                "--disable-dev-shm-usage".to_string(),
                "--no-sandbox".to_string(),
                "--disable-setuid-sandbox".to_string(),
                "--no-first-run".to_string(),
                "--no-default-browser-check".to_string(),
                "--disable-background-networking".to_string(),
            ];
            if engine == EngineType::HeadedChromeStealth {
                args.push("--disable-features=IsolateOrigins,site-per-process".to_string());
                args.push("--lang=en-US".to_string());
            }
            args
        };
        let args: Vec<&OsStr> = owned_args.iter().map(OsStr::new).collect();

        let options = LaunchOptions::default_builder()
            .headless(engine == EngineType::HeadlessChrome)
            .window_size(Some(window))
            .args(args)
            .build()
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        let browser = Browser::new(options).map_err(|e| DriverError::Launch(e.to_string()))?;
        let tab = browser
            .new_tab()
            .map_err(|e| DriverError::Launch(e.to_string()))?;

        tab.evaluate(NAVIGATOR_PATCHES, false)
            .map_err(|e| DriverError::Evaluation(e.to_string()))?;
        if engine == EngineType::HeadedChromeStealth {
            tab.evaluate(STEALTH_PATCHES, false)
                .map_err(|e| DriverError::Evaluation(e.to_string()))?;
        }

        log::info!("launched {} driver", engine.name());
        Ok(Self {
            tab,
            _browser: Arc::new(browser),
            engine,
        })
    }

    async fn blocking<T, F>(&self, op: F) -> Result<T, DriverError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<Tab>) -> Result<T, DriverError> + Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || op(tab))
            .await
            .map_err(|e| DriverError::TaskFailed(e.to_string()))?
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn navigate(&self, url: &str, timeout: Duration) -> Result<(), DriverError> {
        let url_owned = url.to_string();
        let nav = self.blocking(move |tab| {
            tab.navigate_to(&url_owned)
                .map_err(|e| DriverError::Navigation(e.to_string()))?;
            tab.wait_until_navigated()
                .map_err(|e| DriverError::Navigation(e.to_string()))?;
            Ok(())
        });

        match tokio::time::timeout(timeout, nav).await {
            Ok(result) => result,
            Err(_) => Err(DriverError::Timeout(format!(
                "{} after {:.1}s",
                url,
                timeout.as_secs_f64()
            ))),
        }
    }

    async fn title(&self) -> Result<String, DriverError> {
        self.blocking(|tab| {
            tab.get_title()
                .map_err(|e| DriverError::Evaluation(e.to_string()))
        })
        .await
    }

    async fn visible_text(&self) -> Result<String, DriverError> {
        self.blocking(|tab| {
            let body = tab
                .find_element("body")
                .map_err(|e| DriverError::ElementNotFound(e.to_string()))?;
            body.get_inner_text()
                .map_err(|e| DriverError::Evaluation(e.to_string()))
        })
        .await
    }

    async fn has_selector(&self, selector: &str) -> Result<bool, DriverError> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            Ok(tab
                .wait_for_element_with_custom_timeout(&selector, Duration::from_millis(300))
                .is_ok())
        })
        .await
    }

    async fn click(&self, selector: &str) -> Result<(), DriverError> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            let element = tab
                .find_element(&selector)
                .map_err(|e| DriverError::ElementNotFound(e.to_string()))?;
            element
                .click()
                .map_err(|e| DriverError::Evaluation(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn internal_links(&self) -> Result<Vec<String>, DriverError> {
        let script = r#"
            JSON.stringify(Array.from(document.querySelectorAll('a[href]'))
                .map(a => a.href)
                .filter(h => h.startsWith(window.location.origin))
                .slice(0, 30))
        "#;
        self.blocking(move |tab| {
            let result = tab
                .evaluate(script, true)
                .map_err(|e| DriverError::Evaluation(e.to_string()))?;
            let raw = result
                .value
                .and_then(|v| v.as_str().map(|s| s.to_string()))
                .unwrap_or_else(|| "[]".to_string());
            serde_json::from_str(&raw).map_err(|e| DriverError::Evaluation(e.to_string()))
        })
        .await
    }

    async fn go_back(&self) -> Result<(), DriverError> {
        self.blocking(|tab| {
            tab.evaluate("window.history.back()", false)
                .map_err(|e| DriverError::Evaluation(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn scroll_by(&self, pixels: i64) -> Result<(), DriverError> {
        let script = format!("window.scrollBy(0, {})", pixels);
        self.blocking(move |tab| {
            tab.evaluate(&script, false)
                .map_err(|e| DriverError::Evaluation(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn cookie_count(&self) -> Result<usize, DriverError> {
        self.blocking(|tab| {
            let cookies = tab
                .get_cookies()
                .map_err(|e| DriverError::Evaluation(e.to_string()))?;
            Ok(cookies.len())
        })
        .await
    }

    async fn close(&self) -> Result<(), DriverError> {
        let engine = self.engine;
        self.blocking(move |tab| {
            // Close failures are expected when the browser already died.
            if let Err(e) = tab.close(true) {
                log::debug!("{} tab close: {}", engine.name(), e);
            }
            Ok(())
        })
        .await
    }
}

/// Real factory launching Chrome/Chromium. Headed engines inherit the
/// process DISPLAY, which the watchdog keeps alive.
pub struct ChromeDriverFactory {
    window: (u32, u32),
}

impl ChromeDriverFactory {
    pub fn new() -> Self {
        Self {
            window: (1920, 1080),
        }
    }
}

impl Default for ChromeDriverFactory {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DriverFactory for ChromeDriverFactory {
    async fn launch(&self, engine: EngineType) -> Result<Arc<dyn BrowserDriver>, DriverError> {
        let window = self.window;
        let driver = tokio::task::spawn_blocking(move || {
            ChromeDriver::launch_blocking(engine, window)
        })
        .await
        .map_err(|e| DriverError::TaskFailed(e.to_string()))??;
        Ok(Arc::new(driver))
    }
}
