use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;
use tracing_subscriber::EnvFilter;

use harvest_rpa::captcha::solver_from_settings;
use harvest_rpa::chrome::ChromeDriver;
use harvest_rpa::config::Settings;
use harvest_rpa::engine::Engine;
use harvest_rpa::events::RunEvent;
use harvest_rpa::export::ExportFormat;
use harvest_rpa::face;
use harvest_rpa::ledger::Ledger;
use harvest_rpa::plan::PlanDocument;
use harvest_rpa::planner::PlanSource;
use harvest_rpa::pool::ResourcePool;
use harvest_rpa::service::{DEFAULT_REPORT_RUNS, DEFAULT_ROW_LIMIT, RunService};

#[derive(Parser)]
#[command(name = "harvest", version, about = "Plan-driven browser extraction")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a plan document for a page.
    Plan {
        url: String,
        goal: String,
        /// Write the plan here instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Execute a plan and export the rows.
    Parse {
        #[arg(long)]
        plan: PathBuf,
        #[arg(long)]
        project: String,
        #[arg(long, default_value_t = DEFAULT_ROW_LIMIT)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        export: ExportFormat,
    },
    /// Re-run the newest unfinished run of a project.
    Resume {
        #[arg(long)]
        project: String,
        #[arg(long, default_value_t = DEFAULT_ROW_LIMIT)]
        limit: usize,
        #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
        export: ExportFormat,
    },
    /// Show recent runs of a project.
    Report {
        #[arg(long)]
        project: String,
    },
    /// Start the HTTP server.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let settings = Settings::from_env()?;
    init_tracing(&settings);

    let cli = Cli::parse();
    match cli.command {
        Command::Plan { url, goal, out } => {
            let plan = PlanSource::new(&settings).generate_plan(&url, &goal).await;
            let json = plan.to_json_pretty()?;
            match out {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("writing plan to {}", path.display()))?;
                    info!(path = %path.display(), "plan written");
                }
                None => println!("{}", json),
            }
        }
        Command::Parse {
            plan,
            project,
            limit,
            export,
        } => {
            let raw = std::fs::read_to_string(&plan)
                .with_context(|| format!("reading plan {}", plan.display()))?;
            let plan = PlanDocument::from_json(&raw)?;
            let (service, _) = build_service(&settings)?;
            let report = service.parse(&project, &plan, limit, export).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Resume {
            project,
            limit,
            export,
        } => {
            let (service, _) = build_service(&settings)?;
            let report = service.resume(&project, limit, export).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Report { project } => {
            let ledger = Ledger::open(&settings.ledger_path)?;
            let runs = ledger.recent_runs(&project, DEFAULT_REPORT_RUNS);
            if runs.is_empty() {
                println!("no runs recorded for {}", project);
            }
            for run in runs {
                println!(
                    "#{:<4} {:<9} {:>5} rows  {}{}",
                    run.id,
                    format!("{:?}", run.status).to_lowercase(),
                    run.rows,
                    run.created_at.format("%Y-%m-%d %H:%M:%S"),
                    run.failure.map(|f| format!("  ({})", f)).unwrap_or_default(),
                );
            }
        }
        Command::Serve { port } => {
            let (service, event_tx) = build_service(&settings)?;
            face::serve(
                Arc::new(service),
                event_tx,
                port.unwrap_or(settings.server_port),
                settings.max_concurrency,
            )
            .await?;
        }
    }
    Ok(())
}

/// Logs go to stderr; `RUST_LOG` wins over `LOG_LEVEL`.
fn init_tracing(settings: &Settings) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&settings.log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn build_service(settings: &Settings) -> Result<(RunService, broadcast::Sender<RunEvent>)> {
    let (event_tx, _) = broadcast::channel::<RunEvent>(256);

    let mut engine = Engine::new(Arc::new(ChromeDriver::new(settings)), solver_from_settings(settings))
        .with_navigation_timeout(settings.page_timeout)
        .with_events(event_tx.clone());

    let proxies = settings.proxy_list()?;
    if proxies.is_empty() {
        info!(path = %settings.proxy_list_path.display(), "no proxies configured, connecting directly");
    } else {
        info!(count = proxies.len(), "proxy pool loaded");
        engine = engine.with_pool(Arc::new(ResourcePool::new(proxies, settings.proxy_cooldown)));
    }

    let ledger = Arc::new(Ledger::open(&settings.ledger_path)?);
    let service = RunService::new(engine, ledger, &settings.export_dir).with_events(event_tx.clone());
    Ok((service, event_tx))
}
