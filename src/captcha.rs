//! Captcha solving collaborator.
//!
//! Providers are long-polling HTTP services: submit a task, then poll a
//! bounded number of times. The `Disabled` variant fails with a distinct
//! `NotConfigured` error so callers can tell "no provider" from "provider gave up".

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::browser::ChallengeKind;
use crate::config::Settings;
use crate::error::CaptchaError;

#[async_trait]
pub trait CaptchaSolver: Send + Sync {
    fn name(&self) -> &'static str;

    /// Solve an image challenge and return the text to type.
    async fn solve_image(&self, image_base64: &str) -> Result<String, CaptchaError>;

    /// Solve a site-key widget and return the response token.
    async fn solve_site_key(
        &self,
        site_key: &str,
        page_url: &str,
        kind: ChallengeKind,
    ) -> Result<String, CaptchaError>;
}

/// How long a provider is polled before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub attempts: u32,
    pub interval: Duration,
    pub initial_delay: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            attempts: 24,
            interval: Duration::from_secs(5),
            initial_delay: Duration::from_secs(5),
        }
    }
}

/// Pick the configured provider, falling back to `DisabledSolver`.
pub fn solver_from_settings(settings: &Settings) -> Arc<dyn CaptchaSolver> {
    match (settings.captcha_provider.as_str(), settings.captcha_api_key.clone()) {
        ("twocaptcha", Some(key)) => Arc::new(TwoCaptchaSolver::new(key)),
        ("capsolver", Some(key)) => Arc::new(CapSolver::new(key)),
        (provider, key) => {
            if key.is_some() {
                warn!(provider, "unknown captcha provider, captcha solving disabled");
            }
            Arc::new(DisabledSolver)
        }
    }
}

fn http_client() -> Client {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|_| Client::new())
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledSolver;

#[async_trait]
impl CaptchaSolver for DisabledSolver {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn solve_image(&self, _image_base64: &str) -> Result<String, CaptchaError> {
        Err(CaptchaError::NotConfigured)
    }

    async fn solve_site_key(
        &self,
        _site_key: &str,
        _page_url: &str,
        _kind: ChallengeKind,
    ) -> Result<String, CaptchaError> {
        Err(CaptchaError::NotConfigured)
    }
}

pub struct TwoCaptchaSolver {
    client: Client,
    api_key: String,
    base_url: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
struct TwoCaptchaReply {
    status: i64,
    #[serde(default)]
    request: Value,
}

impl TwoCaptchaReply {
    fn request_text(&self) -> String {
        match &self.request {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl TwoCaptchaSolver {
    pub const API_URL: &'static str = "https://2captcha.com";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            api_key: api_key.into(),
            base_url: Self::API_URL.to_string(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    async fn submit(&self, form: &[(&str, &str)]) -> Result<String, CaptchaError> {
        let mut params = vec![("key", self.api_key.as_str()), ("json", "1")];
        params.extend_from_slice(form);

        let reply: TwoCaptchaReply = self
            .client
            .post(format!("{}/in.php", self.base_url))
            .form(&params)
            .send()
            .await?
            .json()
            .await?;

        if reply.status != 1 {
            return Err(CaptchaError::Rejected(reply.request_text()));
        }
        Ok(reply.request_text())
    }

    async fn poll_result(&self, request_id: &str) -> Result<String, CaptchaError> {
        tokio::time::sleep(self.poll.initial_delay).await;
        for attempt in 1..=self.poll.attempts {
            let reply: TwoCaptchaReply = self
                .client
                .get(format!("{}/res.php", self.base_url))
                .query(&[
                    ("key", self.api_key.as_str()),
                    ("action", "get"),
                    ("id", request_id),
                    ("json", "1"),
                ])
                .send()
                .await?
                .json()
                .await?;

            if reply.status == 1 {
                info!(request_id, attempt, "2captcha solved");
                return Ok(reply.request_text());
            }
            let text = reply.request_text();
            if text != "CAPCHA_NOT_READY" {
                return Err(CaptchaError::Rejected(text));
            }
            debug!(request_id, attempt, "2captcha not ready");
            tokio::time::sleep(self.poll.interval).await;
        }
        Err(CaptchaError::Timeout {
            attempts: self.poll.attempts,
        })
    }
}

#[async_trait]
impl CaptchaSolver for TwoCaptchaSolver {
    fn name(&self) -> &'static str {
        "twocaptcha"
    }

    async fn solve_image(&self, image_base64: &str) -> Result<String, CaptchaError> {
        let id = self
            .submit(&[("method", "base64"), ("body", image_base64)])
            .await?;
        self.poll_result(&id).await
    }

    async fn solve_site_key(
        &self,
        site_key: &str,
        page_url: &str,
        kind: ChallengeKind,
    ) -> Result<String, CaptchaError> {
        let form: [(&str, &str); 3] = match kind {
            ChallengeKind::Hcaptcha => [
                ("method", "hcaptcha"),
                ("sitekey", site_key),
                ("pageurl", page_url),
            ],
            _ => [
                ("method", "userrecaptcha"),
                ("googlekey", site_key),
                ("pageurl", page_url),
            ],
        };
        let id = self.submit(&form).await?;
        self.poll_result(&id).await
    }
}

pub struct CapSolver {
    client: Client,
    api_key: String,
    base_url: String,
    poll: PollPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapSolverReply {
    #[serde(default)]
    error_id: i64,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    solution: Option<Value>,
}

impl CapSolverReply {
    fn error(&self) -> Option<CaptchaError> {
        (self.error_id != 0).then(|| {
            CaptchaError::Rejected(
                self.error_description
                    .clone()
                    .unwrap_or_else(|| format!("errorId {}", self.error_id)),
            )
        })
    }

    fn answer(&self) -> Option<String> {
        if self.status.as_deref() != Some("ready") {
            return None;
        }
        let solution = self.solution.as_ref()?;
        ["gRecaptchaResponse", "token", "text"]
            .iter()
            .find_map(|key| solution.get(key).and_then(Value::as_str))
            .map(String::from)
    }
}

impl CapSolver {
    pub const API_URL: &'static str = "https://api.capsolver.com";

    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: http_client(),
            api_key: api_key.into(),
            base_url: Self::API_URL.to_string(),
            poll: PollPolicy::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_poll_policy(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    async fn call(&self, endpoint: &str, body: Value) -> Result<CapSolverReply, CaptchaError> {
        Ok(self
            .client
            .post(format!("{}/{}", self.base_url, endpoint))
            .json(&body)
            .send()
            .await?
            .json()
            .await?)
    }

    async fn solve(&self, task: Value) -> Result<String, CaptchaError> {
        let created = self
            .call("createTask", json!({"clientKey": self.api_key, "task": task}))
            .await?;
        if let Some(err) = created.error() {
            return Err(err);
        }
        // Image tasks are often answered synchronously.
        if let Some(answer) = created.answer() {
            return Ok(answer);
        }
        let task_id = created
            .task_id
            .ok_or_else(|| CaptchaError::Rejected("no taskId in createTask reply".into()))?;

        tokio::time::sleep(self.poll.initial_delay).await;
        for attempt in 1..=self.poll.attempts {
            let reply = self
                .call(
                    "getTaskResult",
                    json!({"clientKey": self.api_key, "taskId": task_id}),
                )
                .await?;
            if let Some(err) = reply.error() {
                return Err(err);
            }
            if let Some(answer) = reply.answer() {
                info!(task_id = %task_id, attempt, "capsolver solved");
                return Ok(answer);
            }
            debug!(task_id = %task_id, attempt, "capsolver not ready");
            tokio::time::sleep(self.poll.interval).await;
        }
        Err(CaptchaError::Timeout {
            attempts: self.poll.attempts,
        })
    }
}

#[async_trait]
impl CaptchaSolver for CapSolver {
    fn name(&self) -> &'static str {
        "capsolver"
    }

    async fn solve_image(&self, image_base64: &str) -> Result<String, CaptchaError> {
        self.solve(json!({"type": "ImageToTextTask", "body": image_base64}))
            .await
    }

    async fn solve_site_key(
        &self,
        site_key: &str,
        page_url: &str,
        kind: ChallengeKind,
    ) -> Result<String, CaptchaError> {
        let task_type = match kind {
            ChallengeKind::Hcaptcha => "HCaptchaTaskProxyLess",
            _ => "ReCaptchaV2TaskProxyLess",
        };
        self.solve(json!({
            "type": task_type,
            "websiteURL": page_url,
            "websiteKey": site_key,
        }))
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fast(attempts: u32) -> PollPolicy {
        PollPolicy {
            attempts,
            interval: Duration::ZERO,
            initial_delay: Duration::ZERO,
        }
    }

    fn settings(provider: &str, key: Option<&str>) -> Settings {
        let provider = provider.to_string();
        let key = key.map(String::from);
        Settings::from_lookup(move |k| match k {
            "CAPTCHA_PROVIDER" => Some(provider.clone()),
            "CAPTCHA_API_KEY" => key.clone(),
            _ => None,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn disabled_solver_reports_not_configured() {
        let solver = DisabledSolver;
        assert!(matches!(
            solver.solve_image("aGk=").await,
            Err(CaptchaError::NotConfigured)
        ));
        assert!(matches!(
            solver
                .solve_site_key("k", "https://a.example", ChallengeKind::RecaptchaV2)
                .await,
            Err(CaptchaError::NotConfigured)
        ));
    }

    #[test]
    fn provider_selection() {
        assert_eq!(solver_from_settings(&settings("twocaptcha", Some("k"))).name(), "twocaptcha");
        assert_eq!(solver_from_settings(&settings("capsolver", Some("k"))).name(), "capsolver");
        assert_eq!(solver_from_settings(&settings("capsolver", None)).name(), "disabled");
        assert_eq!(solver_from_settings(&settings("other", Some("k"))).name(), "disabled");
    }

    #[tokio::test]
    async fn twocaptcha_polls_until_ready() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/in.php"))
            .and(body_string_contains("method=base64"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "42"})))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .and(query_param("id", "42"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
            )
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "x7kq"})))
            .mount(&server)
            .await;

        let solver = TwoCaptchaSolver::new("key")
            .with_base_url(server.uri())
            .with_poll_policy(fast(5));
        assert_eq!(solver.solve_image("aGk=").await.unwrap(), "x7kq");
    }

    #[tokio::test]
    async fn twocaptcha_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/in.php"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"status": 1, "request": "7"})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/res.php"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "CAPCHA_NOT_READY"})),
            )
            .expect(3)
            .mount(&server)
            .await;

        let solver = TwoCaptchaSolver::new("key")
            .with_base_url(server.uri())
            .with_poll_policy(fast(3));
        let err = solver
            .solve_site_key("site", "https://a.example", ChallengeKind::RecaptchaV2)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Timeout { attempts: 3 }));
    }

    #[tokio::test]
    async fn twocaptcha_submit_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/in.php"))
            .and(body_string_contains("method=hcaptcha"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(json!({"status": 0, "request": "ERROR_WRONG_USER_KEY"})),
            )
            .mount(&server)
            .await;

        let solver = TwoCaptchaSolver::new("bad")
            .with_base_url(server.uri())
            .with_poll_policy(fast(1));
        let err = solver
            .solve_site_key("site", "https://a.example", ChallengeKind::Hcaptcha)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptchaError::Rejected(msg) if msg == "ERROR_WRONG_USER_KEY"));
    }

    #[tokio::test]
    async fn capsolver_site_key_round_trip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .and(body_string_contains("ReCaptchaV2TaskProxyLess"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"errorId": 0, "taskId": "t-1"})))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/getTaskResult"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 0,
                "status": "ready",
                "solution": {"gRecaptchaResponse": "03AGdBq2"}
            })))
            .mount(&server)
            .await;

        let solver = CapSolver::new("key")
            .with_base_url(server.uri())
            .with_poll_policy(fast(2));
        let token = solver
            .solve_site_key("site", "https://a.example", ChallengeKind::RecaptchaV2)
            .await
            .unwrap();
        assert_eq!(token, "03AGdBq2");
    }

    #[tokio::test]
    async fn capsolver_error_is_rejection() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/createTask"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "errorId": 1,
                "errorDescription": "ERROR_KEY_DENIED_ACCESS"
            })))
            .mount(&server)
            .await;

        let solver = CapSolver::new("key")
            .with_base_url(server.uri())
            .with_poll_policy(fast(2));
        let err = solver.solve_image("aGk=").await.unwrap_err();
        assert!(matches!(err, CaptchaError::Rejected(msg) if msg == "ERROR_KEY_DENIED_ACCESS"));
    }
}
