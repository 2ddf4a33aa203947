use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::engine::Engine;
use crate::events::RunEvent;
use crate::export::{ExportFormat, export};
use crate::ledger::{Ledger, RunSummary};
use crate::plan::PlanDocument;

pub const DEFAULT_ROW_LIMIT: usize = 100;
pub const DEFAULT_REPORT_RUNS: usize = 5;

/// Result of one finished run as shown to the CLI and the server.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RunReport {
    pub run_id: u32,
    pub rows: usize,
    pub pages_visited: u32,
    pub limit_reached: bool,
    pub export_path: PathBuf,
}

/// Ties the engine to the ledger and the exporters.
pub struct RunService {
    engine: Engine,
    ledger: Arc<Ledger>,
    export_dir: PathBuf,
    events: Option<broadcast::Sender<RunEvent>>,
}

impl RunService {
    pub fn new(engine: Engine, ledger: Arc<Ledger>, export_dir: impl Into<PathBuf>) -> Self {
        Self {
            engine,
            ledger,
            export_dir: export_dir.into(),
            events: None,
        }
    }

    pub fn with_events(mut self, events: broadcast::Sender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    /// Record a new run of `plan` under `project`, execute it and export the rows.
    pub async fn parse(
        &self,
        project: &str,
        plan: &PlanDocument,
        limit: usize,
        format: ExportFormat,
    ) -> Result<RunReport> {
        plan.validate()?;
        let (ledger, owned_project, owned_plan) = (self.ledger.clone(), project.to_string(), plan.clone());
        let run_id = blocking(move || Ok(ledger.create_run(&owned_project, &owned_plan)?)).await?;
        info!(run_id, project, "run recorded");
        self.drive(run_id, project, plan, limit, format).await
    }

    /// Re-run the newest pending or failed run of `project` with its stored plan.
    pub async fn resume(&self, project: &str, limit: usize, format: ExportFormat) -> Result<RunReport> {
        let run = self
            .ledger
            .find_latest_incomplete(project)
            .ok_or_else(|| anyhow!("no incomplete run for project {project}"))?;
        info!(run_id = run.id, project, status = ?run.status, "resuming run");
        self.drive(run.id, project, &run.plan, limit, format).await
    }

    pub fn report(&self, project: &str, limit: usize) -> Vec<RunSummary> {
        self.ledger.recent_runs(project, limit)
    }

    async fn drive(
        &self,
        run_id: u32,
        project: &str,
        plan: &PlanDocument,
        limit: usize,
        format: ExportFormat,
    ) -> Result<RunReport> {
        self.emit(RunEvent::RunStarted {
            run_id,
            target: plan.target.clone(),
        });

        let outcome = match self.engine.execute(plan, limit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                let message = format!("{:#}", e);
                let (ledger, reason) = (self.ledger.clone(), message.clone());
                if let Err(le) = blocking(move || Ok(ledger.mark_failed(run_id, &reason)?)).await {
                    warn!(run_id, error = %format!("{:#}", le), "could not record run failure");
                }
                self.emit(RunEvent::RunFailed { run_id, message });
                return Err(e.context(format!("run {run_id} failed")));
            }
        };

        let rows = Arc::new(outcome.rows);
        let (ledger, stored) = (self.ledger.clone(), rows.clone());
        blocking(move || Ok(ledger.complete_run(run_id, &stored)?)).await?;

        let (written, dir, stem) = (rows.clone(), self.export_dir.clone(), project.to_string());
        let export_path = blocking(move || export(&written, format, &dir, &stem))
            .await
            .with_context(|| format!("exporting run {run_id}"))?;
        info!(run_id, rows = rows.len(), path = %export_path.display(), "rows exported");

        self.emit(RunEvent::RunFinished {
            run_id,
            rows: rows.len(),
        });
        Ok(RunReport {
            run_id,
            rows: rows.len(),
            pages_visited: outcome.pages_visited,
            limit_reached: outcome.limit_reached,
            export_path,
        })
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }
}

/// Ledger and export writes are plain file I/O; keep them off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| anyhow!("blocking task panicked: {}", e))?
}
