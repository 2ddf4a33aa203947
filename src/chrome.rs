use anyhow::{Result, anyhow};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::ffi::OsStr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::browser::{BrowserDriver, Challenge, ChallengeKind, PageSession};
use crate::config::Settings;
use crate::dom;

const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0 Safari/537.36",
];

const WINDOW_SIZE: (u32, u32) = (1366, 768);

fn random_user_agent() -> &'static str {
    let index = (rand::random::<f64>() * USER_AGENTS.len() as f64) as usize;
    USER_AGENTS[index.min(USER_AGENTS.len() - 1)]
}

/// Launches one Chrome process per session so each run gets its own proxy.
#[derive(Debug, Clone)]
pub struct ChromeDriver {
    headless: bool,
    page_timeout: Duration,
    chrome_path: Option<PathBuf>,
}

impl ChromeDriver {
    pub fn new(settings: &Settings) -> Self {
        Self {
            headless: settings.headless,
            page_timeout: settings.page_timeout,
            chrome_path: settings.chrome_path.clone(),
        }
    }
}

#[async_trait]
impl BrowserDriver for ChromeDriver {
    async fn open(&self, proxy: Option<&str>) -> Result<Box<dyn PageSession>> {
        let driver = self.clone();
        let proxy = proxy.map(String::from);
        // Launch blocks on process startup and the CDP handshake.
        let session = tokio::task::spawn_blocking(move || driver.launch(proxy.as_deref()))
            .await
            .map_err(|e| anyhow!("Browser launch panicked: {}", e))??;
        Ok(Box::new(session))
    }
}

impl ChromeDriver {
    fn launch(&self, proxy: Option<&str>) -> Result<ChromeSession> {
        let options = LaunchOptions {
            headless: self.headless,
            path: self.chrome_path.clone(),
            window_size: Some(WINDOW_SIZE),
            proxy_server: proxy,
            args: vec![
                OsStr::new("--no-first-run"),
                OsStr::new("--no-default-browser-check"),
            ],
            idle_browser_timeout: self.page_timeout.max(Duration::from_secs(60)) * 2,
            ..Default::default()
        };

        info!(proxy = proxy.unwrap_or("direct"), headless = self.headless, "launching chrome");
        let browser =
            Browser::new(options).map_err(|e| anyhow!("Browser launch failed: {}", e))?;

        let tab = browser.new_tab()?;
        tab.set_user_agent(random_user_agent(), None, None)?;
        tab.set_default_timeout(self.page_timeout);

        Ok(ChromeSession {
            _browser: browser,
            tab,
            page_timeout: self.page_timeout,
        })
    }
}

/// A live Chrome tab. The browser process dies when this is dropped.
pub struct ChromeSession {
    _browser: Browser,
    tab: Arc<Tab>,
    page_timeout: Duration,
}

impl ChromeSession {
    /// Run a CDP call on the blocking pool so the runtime keeps turning.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Arc<Tab>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || f(&tab))
            .await
            .map_err(|e| anyhow!("Browser task panicked: {}", e))?
    }

    async fn wait_navigated(&self, timeout: Duration) -> Result<()> {
        let restore = self.page_timeout;
        self.blocking(move |tab| {
            tab.set_default_timeout(timeout);
            let outcome = tab.wait_until_navigated().map(|_| ());
            tab.set_default_timeout(restore);
            outcome
        })
        .await
    }
}

fn type_into(tab: &Arc<Tab>, locator: &str, value: &str) -> Result<()> {
    let el = tab.find_element(locator)?;
    el.click()?;
    tab.evaluate(&dom::clear_value_script(locator), false)?;
    tab.type_str(value)?;
    Ok(())
}

#[async_trait]
impl PageSession for ChromeSession {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()> {
        let url = url.to_string();
        self.blocking(move |tab| {
            tab.navigate_to(&url)?;
            Ok(())
        })
        .await?;
        self.wait_navigated(timeout).await
    }

    async fn click(&mut self, locator: &str) -> Result<()> {
        let locator = locator.to_string();
        self.blocking(move |tab| {
            tab.find_element(&locator)?.click()?;
            Ok(())
        })
        .await
    }

    async fn fill(&mut self, locator: &str, value: &str) -> Result<()> {
        let locator = locator.to_string();
        let value = value.to_string();
        self.blocking(move |tab| type_into(tab, &locator, &value))
            .await
    }

    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<()> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            tab.wait_for_element_with_custom_timeout(&selector, timeout)?;
            Ok(())
        })
        .await
    }

    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<()> {
        self.wait_navigated(timeout).await
    }

    async fn select_all(&mut self, selector: &str, attribute: Option<&str>) -> Result<Vec<String>> {
        let selector = selector.to_string();
        let attribute = attribute.map(String::from);
        self.blocking(move |tab| dom::select_all(tab, &selector, attribute.as_deref()))
            .await
    }

    async fn scroll_by(&mut self, dy: i64) -> Result<()> {
        self.blocking(move |tab| {
            tab.evaluate(&dom::scroll_script(dy), false)?;
            Ok(())
        })
        .await
    }

    async fn current_url(&mut self) -> Result<String> {
        self.blocking(dom::get_current_url).await
    }

    async fn probe_challenge(&mut self) -> Result<Option<Challenge>> {
        self.blocking(dom::probe_challenge).await
    }

    async fn capture_base64(&mut self, selector: &str) -> Result<String> {
        let selector = selector.to_string();
        self.blocking(move |tab| {
            let png = tab
                .find_element(&selector)?
                .capture_screenshot(CaptureScreenshotFormatOption::Png)?;
            Ok(STANDARD.encode(png))
        })
        .await
    }

    async fn inject_answer(&mut self, challenge: &Challenge, answer: &str) -> Result<()> {
        let challenge = challenge.clone();
        let answer = answer.to_string();
        self.blocking(move |tab| match challenge.kind {
            ChallengeKind::Image => {
                let locator = challenge
                    .answer_selector
                    .as_deref()
                    .ok_or_else(|| anyhow!("image challenge has no answer input"))?;
                type_into(tab, locator, &answer)
            }
            kind => {
                tab.evaluate(&dom::token_injection_script(kind, &answer), false)?;
                Ok(())
            }
        })
        .await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let tab = Arc::clone(&self.tab);
        tokio::task::spawn_blocking(move || tab.close(true))
            .await
            .map_err(|e| anyhow!("Browser task panicked: {}", e))??;
        debug!("chrome session closed");
        // Dropping `self` takes the browser process down with it.
        Ok(())
    }
}
