//! Plan execution engine.
//!
//! Walks one plan against one browser session: strictly in order, one
//! outstanding browser call at a time, with the row limit checked between
//! steps. The session and the pooled proxy are released on every exit path.

use anyhow::{Context, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::browser::{BrowserDriver, ChallengeKind, PageSession};
use crate::captcha::CaptchaSolver;
use crate::error::EngineError;
use crate::events::RunEvent;
use crate::plan::{PaginationKind, PaginationPolicy, PlanDocument, PlanStep, StepAction, WaitKind};
use crate::pool::ResourcePool;
use crate::rows::{ExtractedField, Row, materialize};

pub const DEFAULT_NAVIGATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Slack on top of a step's own timeout before the engine abandons the call.
const SUSPENSION_GRACE: Duration = Duration::from_secs(5);

const SCROLL_STEP_PX: i64 = 2000;

/// What a finished run hands back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct RunOutcome {
    pub rows: Vec<Row>,
    pub pages_visited: u32,
    pub limit_reached: bool,
    pub pagination_completed: bool,
}

pub struct Engine {
    driver: Arc<dyn BrowserDriver>,
    solver: Arc<dyn CaptchaSolver>,
    pool: Option<Arc<ResourcePool>>,
    events: Option<broadcast::Sender<RunEvent>>,
    navigation_timeout: Duration,
    settle_scale: f64,
}

impl Engine {
    pub fn new(driver: Arc<dyn BrowserDriver>, solver: Arc<dyn CaptchaSolver>) -> Self {
        Self {
            driver,
            solver,
            pool: None,
            events: None,
            navigation_timeout: DEFAULT_NAVIGATION_TIMEOUT,
            settle_scale: 1.0,
        }
    }

    pub fn with_pool(mut self, pool: Arc<ResourcePool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn with_events(mut self, events: broadcast::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_navigation_timeout(mut self, timeout: Duration) -> Self {
        self.navigation_timeout = timeout;
        self
    }

    /// Scale applied to post-pagination pauses. `0.0` disables them.
    pub fn with_settle_scale(mut self, scale: f64) -> Self {
        self.settle_scale = scale.max(0.0);
        self
    }

    pub fn pool(&self) -> Option<&Arc<ResourcePool>> {
        self.pool.as_ref()
    }

    /// Run `plan` in a fresh session and return at most `limit` rows.
    pub async fn execute(&self, plan: &PlanDocument, limit: usize) -> Result<RunOutcome> {
        plan.validate()?;

        let proxy = self.pool.as_ref().and_then(|pool| pool.acquire());
        if self.pool.is_some() && proxy.is_none() {
            info!("no rested proxy available, using a direct connection");
        }
        self.emit(RunEvent::ProxyAcquired {
            address: proxy.clone(),
        });
        info!(url = %plan.target, limit, proxy = proxy.as_deref().unwrap_or("direct"), "run starting");

        let opened = bounded("open", self.navigation_timeout, self.driver.open(proxy.as_deref())).await;
        let mut session = match opened {
            Ok(session) => session,
            Err(e) => {
                self.settle_proxy(proxy.as_deref(), false);
                return Err(e.context("opening browser session"));
            }
        };

        let result = Walk::new(self, plan, limit).run(session.as_mut()).await;

        self.settle_proxy(proxy.as_deref(), result.is_ok());
        if let Err(e) = bounded("close", self.navigation_timeout, session.close()).await {
            warn!(error = %e, "closing browser session failed");
        }

        match &result {
            Ok(outcome) => info!(rows = outcome.rows.len(), pages = outcome.pages_visited, "run finished"),
            Err(e) => warn!(error = %format!("{:#}", e), "run failed"),
        }
        result
    }

    fn settle_proxy(&self, proxy: Option<&str>, ok: bool) {
        if let (Some(pool), Some(address)) = (&self.pool, proxy) {
            if ok {
                pool.report_success(address);
            } else {
                pool.report_failure(address);
            }
        }
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    async fn settle(&self, base_secs: f64, variance_secs: f64) {
        if self.settle_scale == 0.0 {
            return;
        }
        let pause = jitter(base_secs, variance_secs).mul_f64(self.settle_scale);
        tokio::time::sleep(pause).await;
    }
}

/// Mutable state of one plan walk.
struct Walk<'a> {
    engine: &'a Engine,
    plan: &'a PlanDocument,
    limit: usize,
    rows: Vec<Row>,
    /// Rows the most recent extraction saw on the current listing.
    listing_len: usize,
}

impl<'a> Walk<'a> {
    fn new(engine: &'a Engine, plan: &'a PlanDocument, limit: usize) -> Self {
        Self {
            engine,
            plan,
            limit,
            rows: Vec::new(),
            listing_len: 0,
        }
    }

    fn full(&self) -> bool {
        self.rows.len() >= self.limit
    }

    async fn run(mut self, session: &mut dyn PageSession) -> Result<RunOutcome> {
        let plan = self.plan;
        let mut stopped_early = false;
        for (index, step) in plan.steps.iter().enumerate() {
            let action = step.action.as_str();
            self.engine.emit(RunEvent::Step { index, action });
            debug!(step = index, action, "executing step");

            self.step(index, step, session)
                .await
                .with_context(|| format!("step {index} ({action}) failed"))?;

            if self.full() {
                info!(step = index, rows = self.rows.len(), "row limit reached");
                stopped_early = true;
                break;
            }
        }

        let policy = &plan.pagination;
        let mut pages_visited = 1;
        if !stopped_early && policy.kind != PaginationKind::None {
            while pages_visited < policy.max_pages && !self.full() {
                self.advance_page(session, policy)
                    .await
                    .with_context(|| format!("advancing to page {}", pages_visited + 1))?;
                pages_visited += 1;
                self.engine.emit(RunEvent::PageAdvanced {
                    page: pages_visited,
                });

                if plan.has_extract_step() {
                    let rows = self.extract(session).await?;
                    // A scrolled listing is re-read from the top.
                    let skip = match policy.kind {
                        PaginationKind::Scroll => self.listing_len,
                        _ => 0,
                    };
                    self.listing_len = rows.len();
                    self.absorb(rows, skip);
                }
            }
        }

        let pagination_completed =
            policy.kind == PaginationKind::None || pages_visited >= policy.max_pages;
        let limit_reached = self.full();
        let mut rows = self.rows;
        rows.truncate(self.limit);

        Ok(RunOutcome {
            rows,
            pages_visited,
            limit_reached,
            pagination_completed,
        })
    }

    async fn step(&mut self, index: usize, step: &PlanStep, session: &mut dyn PageSession) -> Result<()> {
        let nav_timeout = self.engine.navigation_timeout;
        match step.action {
            StepAction::Navigate => {
                let Some(url) = step.target.as_deref() else {
                    self.skip(index, step, "missing target");
                    return Ok(());
                };
                bounded("navigate", nav_timeout, session.navigate(url, nav_timeout)).await?;
                self.clear_challenge(session).await?;
            }
            StepAction::Click => {
                let Some(locator) = step.target.as_deref() else {
                    self.skip(index, step, "missing target");
                    return Ok(());
                };
                bounded("click", nav_timeout, session.click(locator)).await?;
            }
            StepAction::Fill => {
                let (Some(locator), Some(value)) = (step.target.as_deref(), step.value.as_deref())
                else {
                    self.skip(index, step, "missing target or value");
                    return Ok(());
                };
                bounded("fill", nav_timeout, session.fill(locator, value)).await?;
            }
            StepAction::Wait => {
                let Some(wait) = &step.wait else {
                    self.skip(index, step, "missing wait spec");
                    return Ok(());
                };
                let timeout = Duration::from_millis(wait.timeout_ms);
                match (wait.kind, wait.selector.as_deref()) {
                    (WaitKind::Selector, Some(selector)) => {
                        bounded("wait_for_selector", timeout, session.wait_for_selector(selector, timeout))
                            .await?;
                    }
                    (WaitKind::Delay, _) => tokio::time::sleep(timeout).await,
                    _ => bounded("wait_for_idle", timeout, session.wait_for_idle(timeout)).await?,
                }
                self.clear_challenge(session).await?;
            }
            StepAction::Extract => {
                let rows = self.extract(session).await?;
                self.listing_len = rows.len();
                self.absorb(rows, 0);
            }
        }
        Ok(())
    }

    fn skip(&self, index: usize, step: &PlanStep, reason: &'static str) {
        let action = step.action.as_str();
        warn!(step = index, action, reason, "skipping step");
        self.engine.emit(RunEvent::StepSkipped {
            index,
            action,
            reason,
        });
    }

    /// Read every plan field once and zip the results into rows.
    async fn extract(&self, session: &mut dyn PageSession) -> Result<Vec<Row>> {
        let nav_timeout = self.engine.navigation_timeout;
        let mut extracted = Vec::with_capacity(self.plan.fields.len());
        for field in &self.plan.fields {
            let values = bounded(
                "select_all",
                nav_timeout,
                session.select_all(&field.selector, field.attribute.as_deref()),
            )
            .await
            .with_context(|| format!("extracting field {}", field.name))?;
            extracted.push(ExtractedField::new(field.name.clone(), values));
        }
        Ok(materialize(&extracted))
    }

    /// Append rows until the limit, dropping rows whose required fields are empty.
    fn absorb(&mut self, rows: Vec<Row>, skip: usize) {
        let mut added = 0;
        for row in rows.into_iter().skip(skip) {
            if self.full() {
                break;
            }
            if let Some(field) = self.missing_required(&row) {
                debug!(field, "dropping row without required field");
                continue;
            }
            self.rows.push(row);
            added += 1;
        }
        self.engine.emit(RunEvent::RowsExtracted {
            added,
            total: self.rows.len(),
        });
    }

    fn missing_required(&self, row: &Row) -> Option<&'a str> {
        let plan: &'a PlanDocument = self.plan;
        plan.fields
            .iter()
            .filter(|f| f.required)
            .find(|f| row.get(&f.name).is_none_or(|v| v.trim().is_empty()))
            .map(|f| f.name.as_str())
    }

    async fn advance_page(&self, session: &mut dyn PageSession, policy: &PaginationPolicy) -> Result<()> {
        let nav_timeout = self.engine.navigation_timeout;
        match policy.kind {
            PaginationKind::Click => {
                let selector = policy.selector.as_deref().unwrap_or_default();
                bounded("paginate", nav_timeout, session.click(selector)).await?;
                self.engine.settle(2.0, 0.5).await;
                self.clear_challenge(session).await?;
            }
            PaginationKind::Scroll => {
                bounded("paginate", nav_timeout, session.scroll_by(SCROLL_STEP_PX)).await?;
                self.engine.settle(1.0, 0.3).await;
            }
            PaginationKind::None => {}
        }
        Ok(())
    }

    /// Probe for a challenge and, if one is up, solve it and feed the answer back.
    async fn clear_challenge(&self, session: &mut dyn PageSession) -> Result<()> {
        let nav_timeout = self.engine.navigation_timeout;
        let Some(challenge) = bounded("probe_challenge", nav_timeout, session.probe_challenge()).await?
        else {
            return Ok(());
        };
        warn!(kind = challenge.kind.as_str(), "challenge detected");

        let answer = match challenge.kind {
            ChallengeKind::Image => {
                let selector = challenge
                    .image_selector
                    .as_deref()
                    .ok_or(EngineError::IncompleteChallenge("image locator"))?;
                let payload =
                    bounded("capture_base64", nav_timeout, session.capture_base64(selector)).await?;
                self.engine.solver.solve_image(&payload).await?
            }
            kind => {
                let site_key = challenge
                    .site_key
                    .as_deref()
                    .ok_or(EngineError::IncompleteChallenge("site key"))?;
                let page_url = bounded("current_url", nav_timeout, session.current_url()).await?;
                self.engine
                    .solver
                    .solve_site_key(site_key, &page_url, kind)
                    .await?
            }
        };

        bounded("inject_answer", nav_timeout, session.inject_answer(&challenge, &answer)).await?;
        info!(kind = challenge.kind.as_str(), "challenge solved");
        self.engine.emit(RunEvent::CaptchaSolved {
            kind: challenge.kind.as_str(),
        });
        Ok(())
    }
}

/// Cap a browser call at its own timeout plus grace.
async fn bounded<T, F>(action: &'static str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout + SUSPENSION_GRACE, call).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::StepTimeout {
            action,
            timeout_ms: timeout.as_millis() as u64,
        }
        .into()),
    }
}

/// Uniform pause in `base ± variance` seconds, never negative.
fn jitter(base_secs: f64, variance_secs: f64) -> Duration {
    let offset = (rand::random::<f64>() * 2.0 - 1.0) * variance_secs;
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}
