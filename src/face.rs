//! HTTP surface for `harvest serve`: run submission, run listing and a live
//! SSE feed of run events.

use anyhow::{Context, Result};
use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::events::RunEvent;
use crate::export::ExportFormat;
use crate::ledger::RunSummary;
use crate::plan::PlanDocument;
use crate::service::{DEFAULT_REPORT_RUNS, DEFAULT_ROW_LIMIT, RunService};

const QUEUE_DEPTH: usize = 64;

/// A run waiting for a dispatcher slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub project: String,
    pub plan: PlanDocument,
    pub limit: usize,
    pub export: ExportFormat,
}

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<RunService>,
    pub job_tx: mpsc::Sender<Job>,
    pub event_tx: broadcast::Sender<RunEvent>,
}

#[derive(Deserialize)]
struct RunRequest {
    project: String,
    plan: PlanDocument,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    export: Option<ExportFormat>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { Json(json!({"status": "ok"})) }))
        .route("/runs", post(submit_handler))
        .route("/runs/{project}", get(list_handler))
        .route("/events", get(sse_handler))
        .with_state(state)
}

/// Serve until Ctrl-C. Queued runs execute at most `max_concurrency` at a time.
pub async fn serve(
    service: Arc<RunService>,
    event_tx: broadcast::Sender<RunEvent>,
    port: u16,
    max_concurrency: usize,
) -> Result<()> {
    let (job_tx, job_rx) = mpsc::channel::<Job>(QUEUE_DEPTH);
    let dispatcher = spawn_dispatcher(service.clone(), job_rx, max_concurrency);

    let state = Arc::new(AppState {
        service,
        job_tx,
        event_tx,
    });
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", port))
        .await
        .with_context(|| format!("binding 127.0.0.1:{port}"))?;
    info!(port, "server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    dispatcher.abort();
    Ok(())
}

/// Drain the job queue, holding one semaphore permit per executing run.
pub fn spawn_dispatcher(
    service: Arc<RunService>,
    mut job_rx: mpsc::Receiver<Job>,
    max_concurrency: usize,
) -> JoinHandle<()> {
    let slots = Arc::new(Semaphore::new(max_concurrency.max(1)));
    tokio::spawn(async move {
        while let Some(job) = job_rx.recv().await {
            let Ok(permit) = slots.clone().acquire_owned().await else {
                break;
            };
            let service = service.clone();
            tokio::spawn(async move {
                let _permit = permit;
                match service.parse(&job.project, &job.plan, job.limit, job.export).await {
                    Ok(report) => info!(project = %job.project, run_id = report.run_id, rows = report.rows, "queued run finished"),
                    Err(e) => warn!(project = %job.project, error = %format!("{:#}", e), "queued run failed"),
                }
            });
        }
    })
}

async fn submit_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<RunRequest>,
) -> Response {
    if payload.project.trim().is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "project is empty".to_string());
    }
    if let Err(e) = payload.plan.validate() {
        return error_response(StatusCode::BAD_REQUEST, e.to_string());
    }

    let job = Job {
        project: payload.project.clone(),
        plan: payload.plan,
        limit: payload.limit.unwrap_or(DEFAULT_ROW_LIMIT),
        export: payload.export.unwrap_or_default(),
    };
    if state.job_tx.send(job).await.is_err() {
        return error_response(StatusCode::SERVICE_UNAVAILABLE, "run queue is closed".to_string());
    }

    info!(project = %payload.project, "run queued");
    let _ = state.event_tx.send(RunEvent::RunQueued {
        project: payload.project.clone(),
    });
    (
        StatusCode::ACCEPTED,
        Json(json!({"project": payload.project, "status": "queued"})),
    )
        .into_response()
}

async fn list_handler(
    State(state): State<Arc<AppState>>,
    Path(project): Path<String>,
) -> Json<Vec<RunSummary>> {
    Json(state.service.report(&project, DEFAULT_REPORT_RUNS))
}

async fn sse_handler(
    State(state): State<Arc<AppState>>,
) -> Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.event_tx.subscribe();
    let stream = BroadcastStream::new(rx).filter_map(|result: Result<RunEvent, _>| {
        let event = result.ok()?;
        Event::default()
            .event(event.name())
            .json_data(&event)
            .ok()
            .map(Ok::<_, Infallible>)
    });
    Sse::new(stream)
}

fn error_response(status: StatusCode, message: String) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
