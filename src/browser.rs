//! Browser collaborator contract.
//!
//! The engine drives pages only through these traits. `chrome` provides the
//! real implementation; tests substitute scripted sessions.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Opens isolated page sessions, optionally routed through a proxy.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn open(&self, proxy: Option<&str>) -> Result<Box<dyn PageSession>>;
}

/// One live page the engine walks a plan against.
#[async_trait]
pub trait PageSession: Send {
    async fn navigate(&mut self, url: &str, timeout: Duration) -> Result<()>;
    async fn click(&mut self, locator: &str) -> Result<()>;
    async fn fill(&mut self, locator: &str, value: &str) -> Result<()>;
    async fn wait_for_selector(&mut self, selector: &str, timeout: Duration) -> Result<()>;
    async fn wait_for_idle(&mut self, timeout: Duration) -> Result<()>;
    /// Text content (or `attribute` when given) of every match, in document order.
    async fn select_all(&mut self, selector: &str, attribute: Option<&str>) -> Result<Vec<String>>;
    async fn scroll_by(&mut self, dy: i64) -> Result<()>;
    async fn current_url(&mut self) -> Result<String>;
    async fn probe_challenge(&mut self) -> Result<Option<Challenge>>;
    /// PNG of the element matched by `selector`, base64-encoded.
    async fn capture_base64(&mut self, selector: &str) -> Result<String>;
    async fn inject_answer(&mut self, challenge: &Challenge, answer: &str) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChallengeKind {
    RecaptchaV2,
    Hcaptcha,
    Image,
}

impl ChallengeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChallengeKind::RecaptchaV2 => "recaptcha_v2",
            ChallengeKind::Hcaptcha => "hcaptcha",
            ChallengeKind::Image => "image",
        }
    }
}

/// A verification obstacle found on the page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Challenge {
    pub kind: ChallengeKind,
    #[serde(default)]
    pub site_key: Option<String>,
    /// Locator of the challenge image, for `Image` challenges.
    #[serde(default)]
    pub image_selector: Option<String>,
    /// Locator of the input that receives a typed answer.
    #[serde(default)]
    pub answer_selector: Option<String>,
}
