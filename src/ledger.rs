use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use crate::error::LedgerError;
use crate::plan::PlanDocument;
use crate::rows::Row;

#[derive(Debug, PartialEq, Eq, Serialize, Deserialize, Clone, Copy)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_resumable(&self) -> bool {
        matches!(self, RunStatus::Pending | RunStatus::Failed)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Project {
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RunRecord {
    pub id: u32,
    pub project: String,
    pub plan: PlanDocument,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// Lightweight view used by reports.
#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct RunSummary {
    pub id: u32,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub rows: usize,
    pub failure: Option<String>,
}

impl From<&RunRecord> for RunSummary {
    fn from(run: &RunRecord) -> Self {
        Self {
            id: run.id,
            status: run.status,
            created_at: run.created_at,
            rows: run.rows.len(),
            failure: run.failure.clone(),
        }
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LedgerData {
    #[serde(default)]
    projects: Vec<Project>,
    #[serde(default)]
    runs: Vec<RunRecord>,
}

impl LedgerData {
    fn run_mut(&mut self, id: u32) -> Result<&mut RunRecord, LedgerError> {
        self.runs
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or(LedgerError::RunNotFound(id))
    }

    fn runs_for<'a>(&'a self, project: &'a str) -> impl Iterator<Item = &'a RunRecord> + 'a {
        self.runs.iter().filter(move |r| r.project == project)
    }
}

/// Run history persisted as a single JSON document, rewritten on every change.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    data: Mutex<LedgerData>,
}

impl Ledger {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let data = load(&path)?;
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a new pending run, creating the project on first use.
    pub fn create_run(&self, project: &str, plan: &PlanDocument) -> Result<u32, LedgerError> {
        self.mutate(|data| {
            let now = Utc::now();
            if !data.projects.iter().any(|p| p.name == project) {
                data.projects.push(Project {
                    name: project.to_string(),
                    created_at: now,
                });
            }
            let id = data.runs.iter().map(|r| r.id).max().unwrap_or(0) + 1;
            data.runs.push(RunRecord {
                id,
                project: project.to_string(),
                plan: plan.clone(),
                status: RunStatus::Pending,
                created_at: now,
                updated_at: now,
                rows: Vec::new(),
                failure: None,
            });
            Ok(id)
        })
    }

    pub fn append_rows(&self, id: u32, rows: &[Row]) -> Result<(), LedgerError> {
        self.mutate(|data| {
            let run = data.run_mut(id)?;
            run.rows.extend_from_slice(rows);
            run.updated_at = Utc::now();
            Ok(())
        })
    }

    /// Store the run's final rows and mark it completed in one write.
    ///
    /// Rows replace whatever an earlier attempt left behind.
    pub fn complete_run(&self, id: u32, rows: &[Row]) -> Result<(), LedgerError> {
        self.mutate(|data| {
            let run = data.run_mut(id)?;
            run.rows = rows.to_vec();
            run.status = RunStatus::Completed;
            run.failure = None;
            run.updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn mark_completed(&self, id: u32) -> Result<(), LedgerError> {
        self.mutate(|data| {
            let run = data.run_mut(id)?;
            run.status = RunStatus::Completed;
            run.failure = None;
            run.updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn mark_failed(&self, id: u32, reason: &str) -> Result<(), LedgerError> {
        self.mutate(|data| {
            let run = data.run_mut(id)?;
            run.status = RunStatus::Failed;
            run.failure = Some(reason.to_string());
            run.updated_at = Utc::now();
            Ok(())
        })
    }

    pub fn get_run(&self, id: u32) -> Option<RunRecord> {
        self.lock().runs.iter().find(|r| r.id == id).cloned()
    }

    /// Newest run of `project` that never reached completion.
    pub fn find_latest_incomplete(&self, project: &str) -> Option<RunRecord> {
        self.lock()
            .runs_for(project)
            .filter(|r| r.status.is_resumable())
            .max_by_key(|r| (r.created_at, r.id))
            .cloned()
    }

    /// Most recent runs of `project`, newest first.
    pub fn recent_runs(&self, project: &str, limit: usize) -> Vec<RunSummary> {
        let data = self.lock();
        let mut runs: Vec<&RunRecord> = data.runs_for(project).collect();
        runs.sort_by_key(|r| std::cmp::Reverse((r.created_at, r.id)));
        runs.into_iter().take(limit).map(RunSummary::from).collect()
    }

    /// Apply `f` to a copy and keep it only once it is on disk.
    fn mutate<T, F>(&self, f: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut LedgerData) -> Result<T, LedgerError>,
    {
        let mut data = self.lock();
        let mut next = data.clone();
        let out = f(&mut next)?;
        save(&self.path, &next)?;
        *data = next;
        Ok(out)
    }

    fn lock(&self) -> MutexGuard<'_, LedgerData> {
        self.data.lock().expect("ledger mutex poisoned")
    }
}

fn load(path: &Path) -> Result<LedgerData, LedgerError> {
    if !path.exists() {
        return Ok(LedgerData::default());
    }
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}

fn save(path: &Path, data: &LedgerData) -> Result<(), LedgerError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&tmp)?;

    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, data)?;
    writer.flush()?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}
