use serde::Serialize;

/// Progress notifications broadcast while runs execute.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RunEvent {
    RunQueued { project: String },
    RunStarted { run_id: u32, target: String },
    ProxyAcquired { address: Option<String> },
    Step { index: usize, action: &'static str },
    StepSkipped { index: usize, action: &'static str, reason: &'static str },
    CaptchaSolved { kind: &'static str },
    RowsExtracted { added: usize, total: usize },
    PageAdvanced { page: u32 },
    RunFinished { run_id: u32, rows: usize },
    RunFailed { run_id: u32, message: String },
}

impl RunEvent {
    /// Event name used on the SSE stream.
    pub fn name(&self) -> &'static str {
        match self {
            RunEvent::RunQueued { .. } => "run_queued",
            RunEvent::RunStarted { .. } => "run_started",
            RunEvent::ProxyAcquired { .. } => "proxy_acquired",
            RunEvent::Step { .. } => "step",
            RunEvent::StepSkipped { .. } => "step_skipped",
            RunEvent::CaptchaSolved { .. } => "captcha_solved",
            RunEvent::RowsExtracted { .. } => "rows_extracted",
            RunEvent::PageAdvanced { .. } => "page_advanced",
            RunEvent::RunFinished { .. } => "run_finished",
            RunEvent::RunFailed { .. } => "run_failed",
        }
    }
}
