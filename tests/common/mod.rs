#![allow(dead_code)]

use anyhow::{Result, bail};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harvest_rpa::browser::{BrowserDriver, Challenge, ChallengeKind, PageSession};
use harvest_rpa::captcha::CaptchaSolver;
use harvest_rpa::error::CaptchaError;
use harvest_rpa::plan::PlanDocument;

/// Selector -> values on one page of a listing.
pub type Listing = HashMap<String, Vec<String>>;

pub fn listing(columns: &[(&str, &[&str])]) -> Listing {
    columns
        .iter()
        .map(|(selector, values)| {
            (
                selector.to_string(),
                values.iter().map(|v| v.to_string()).collect(),
            )
        })
        .collect()
}

pub fn plan(raw: &str) -> PlanDocument {
    PlanDocument::from_json(raw).unwrap()
}

#[derive(Default)]
struct Shared {
    pages: Vec<Listing>,
    next_selector: Option<String>,
    fail_on: Option<&'static str>,
    hang_on: Option<&'static str>,
    challenge: Option<Challenge>,
    calls: Vec<String>,
    proxies: Vec<Option<String>>,
}

/// In-memory browser. Clicking the next-page selector or scrolling moves to
/// the following listing; the last listing repeats.
#[derive(Clone, Default)]
pub struct ScriptedDriver {
    shared: Arc<Mutex<Shared>>,
}

impl ScriptedDriver {
    pub fn new(pages: Vec<Listing>) -> Self {
        let driver = Self::default();
        driver.shared.lock().unwrap().pages = pages;
        driver
    }

    pub fn with_next_selector(self, selector: &str) -> Self {
        self.shared.lock().unwrap().next_selector = Some(selector.to_string());
        self
    }

    pub fn with_challenge(self, challenge: Challenge) -> Self {
        self.shared.lock().unwrap().challenge = Some(challenge);
        self
    }

    pub fn fail_on(&self, action: Option<&'static str>) {
        self.shared.lock().unwrap().fail_on = action;
    }

    pub fn hang_on(&self, action: Option<&'static str>) {
        self.shared.lock().unwrap().hang_on = action;
    }

    pub fn calls(&self) -> Vec<String> {
        self.shared.lock().unwrap().calls.clone()
    }

    pub fn count(&self, action: &str) -> usize {
        self.shared
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|c| c.split(':').next() == Some(action))
            .count()
    }

    pub fn proxies(&self) -> Vec<Option<String>> {
        self.shared.lock().unwrap().proxies.clone()
    }
}

#[async_trait]
impl BrowserDriver for ScriptedDriver {
    async fn open(&self, proxy: Option<&str>) -> Result<Box<dyn PageSession>> {
        let mut shared = self.shared.lock().unwrap();
        shared.calls.push("open".to_string());
        shared.proxies.push(proxy.map(String::from));
        if shared.fail_on == Some("open") {
            bail!("browser failed to launch");
        }
        Ok(Box::new(ScriptedSession {
            shared: self.shared.clone(),
            page: 0,
        }))
    }
}

struct ScriptedSession {
    shared: Arc<Mutex<Shared>>,
    page: usize,
}

impl ScriptedSession {
    /// Log the call, then apply fault injection.
    async fn record(&self, call: String) -> Result<()> {
        let action = call.split(':').next().unwrap_or_default().to_string();
        let (fail, hang) = {
            let mut shared = self.shared.lock().unwrap();
            shared.calls.push(call);
            (
                shared.fail_on == Some(action.as_str()),
                shared.hang_on == Some(action.as_str()),
            )
        };
        if hang {
            std::future::pending::<()>().await;
        }
        if fail {
            bail!("{action} failed");
        }
        Ok(())
    }
}

#[async_trait]
impl PageSession for ScriptedSession {
    async fn navigate(&mut self, url: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("navigate:{url}")).await
    }

    async fn click(&mut self, locator: &str) -> Result<()> {
        self.record(format!("click:{locator}")).await?;
        let next = self.shared.lock().unwrap().next_selector.clone();
        if next.as_deref() == Some(locator) {
            self.page += 1;
        }
        Ok(())
    }

    async fn fill(&mut self, locator: &str, value: &str) -> Result<()> {
        self.record(format!("fill:{locator}={value}")).await
    }

    async fn wait_for_selector(&mut self, selector: &str, _timeout: Duration) -> Result<()> {
        self.record(format!("wait_for_selector:{selector}")).await
    }

    async fn wait_for_idle(&mut self, _timeout: Duration) -> Result<()> {
        self.record("wait_for_idle".to_string()).await
    }

    async fn select_all(&mut self, selector: &str, _attribute: Option<&str>) -> Result<Vec<String>> {
        self.record(format!("select_all:{selector}")).await?;
        let shared = self.shared.lock().unwrap();
        let Some(last) = shared.pages.len().checked_sub(1) else {
            return Ok(Vec::new());
        };
        Ok(shared.pages[self.page.min(last)]
            .get(selector)
            .cloned()
            .unwrap_or_default())
    }

    async fn scroll_by(&mut self, dy: i64) -> Result<()> {
        self.record(format!("scroll_by:{dy}")).await?;
        self.page += 1;
        Ok(())
    }

    async fn current_url(&mut self) -> Result<String> {
        self.record("current_url".to_string()).await?;
        Ok("https://shop.example/".to_string())
    }

    async fn probe_challenge(&mut self) -> Result<Option<Challenge>> {
        self.record("probe_challenge".to_string()).await?;
        Ok(self.shared.lock().unwrap().challenge.take())
    }

    async fn capture_base64(&mut self, selector: &str) -> Result<String> {
        self.record(format!("capture_base64:{selector}")).await?;
        Ok("iVBORw0KGgo=".to_string())
    }

    async fn inject_answer(&mut self, _challenge: &Challenge, answer: &str) -> Result<()> {
        self.record(format!("inject_answer:{answer}")).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.record("close".to_string()).await
    }
}

/// Answers every challenge with a fixed string.
pub struct FixedSolver(pub &'static str);

#[async_trait]
impl CaptchaSolver for FixedSolver {
    fn name(&self) -> &'static str {
        "fixed"
    }

    async fn solve_image(&self, _image_base64: &str) -> Result<String, CaptchaError> {
        Ok(self.0.to_string())
    }

    async fn solve_site_key(
        &self,
        _site_key: &str,
        _page_url: &str,
        _kind: ChallengeKind,
    ) -> Result<String, CaptchaError> {
        Ok(self.0.to_string())
    }
}
