use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};

use tether_core::ids::JobId;
use tether_core::protocol::ServerMessage;
use tether_engine::ScriptedPlanner;
use tether_executor::{
    ApprovalPrompt, AutoApprove, Command, ExecutorAdapter, ExecutorClient, LocalToolExecutor, StdinPrompt,
};
use tether_store::{Database, JobStore, SqliteJobRepo};
use tether_telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "tether", version, about = "Remote job orchestration over a persistent channel")]
struct Cli {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run the orchestration server.
    Serve {
        #[arg(long)]
        config: Option<PathBuf>,
        /// JSON plan replayed for every job.
        #[arg(long, env = "TETHER_PLAN")]
        plan: Option<PathBuf>,
    },
    /// Start a job and execute its tools in this directory.
    Run {
        instruction: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Approve file changes without asking.
        #[arg(long, short = 'y')]
        yes: bool,
        #[command(flatten)]
        connect: ConnectArgs,
    },
    /// Resume a paused job.
    Resume {
        job_id: String,
        #[arg(long)]
        resume_token: Option<String>,
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long, short = 'y')]
        yes: bool,
        #[command(flatten)]
        connect: ConnectArgs,
    },
    Status {
        job_id: String,
        #[command(flatten)]
        connect: ConnectArgs,
    },
    Cancel {
        job_id: String,
        #[command(flatten)]
        connect: ConnectArgs,
    },
}

#[derive(Args)]
struct ConnectArgs {
    #[arg(long, env = "TETHER_URL", default_value = "ws://127.0.0.1:9091/v2/ws/agent")]
    url: String,
    #[arg(long, env = "TETHER_TOKEN")]
    token: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Cmd::Serve { config, plan } => serve(config, plan).await,
        Cmd::Run {
            instruction,
            cwd,
            yes,
            connect,
        } => {
            let cwd = working_dir(cwd)?;
            let command = Command::Run {
                instruction,
                cwd: cwd.to_string_lossy().into_owned(),
                auto_approve: yes,
            };
            drive(connect, command, cwd, yes).await
        }
        Cmd::Resume {
            job_id,
            resume_token,
            cwd,
            yes,
            connect,
        } => {
            let command = Command::Resume {
                job_id: JobId::from_raw(job_id),
                resume_token,
            };
            drive(connect, command, working_dir(cwd)?, yes).await
        }
        Cmd::Status { job_id, connect } => {
            let command = Command::Status {
                job_id: JobId::from_raw(job_id),
            };
            drive(connect, command, working_dir(None)?, false).await
        }
        Cmd::Cancel { job_id, connect } => {
            let command = Command::Cancel {
                job_id: JobId::from_raw(job_id),
            };
            drive(connect, command, working_dir(None)?, false).await
        }
    }
}

async fn serve(config_path: Option<PathBuf>, plan: Option<PathBuf>) -> Result<()> {
    let config = tether_server::load_config(config_path.as_deref()).context("loading config")?;
    let _telemetry = init_telemetry(&config.telemetry);

    let plan = plan.unwrap_or_else(|| tether_telemetry::data_dir().join("plan.json"));
    let planner = ScriptedPlanner::from_file(&plan).with_context(|| format!("loading plan {}", plan.display()))?;

    if let Some(parent) = config.store.db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Database::open(&config.store.db_path).context("opening job database")?;
    tracing::info!(path = %config.store.db_path.display(), "database opened");
    let store = Arc::new(JobStore::new(Arc::new(SqliteJobRepo::new(db))));

    let handle = tether_server::start(&config, store, Arc::new(planner)).await?;
    tracing::info!(port = handle.port, "tether ready");

    tokio::signal::ctrl_c().await.context("listening for ctrl+c")?;
    tracing::info!("shutting down");
    handle.shutdown().await;
    Ok(())
}

async fn drive(connect: ConnectArgs, command: Command, root: PathBuf, yes: bool) -> Result<()> {
    let _telemetry = init_telemetry(&TelemetryConfig {
        log_level: "warn".into(),
        json: false,
        ..TelemetryConfig::default()
    });

    let prompt: Arc<dyn ApprovalPrompt> = if yes { Arc::new(AutoApprove) } else { Arc::new(StdinPrompt) };
    let adapter = Arc::new(ExecutorAdapter::new(Arc::new(LocalToolExecutor::new(root)), prompt));
    let client = ExecutorClient::new(connect.url, connect.token);

    let outcome = client.run(command, adapter, render).await?;
    match outcome.last {
        ServerMessage::Error { message, .. } => bail!(message),
        _ => Ok(()),
    }
}

fn working_dir(cwd: Option<PathBuf>) -> Result<PathBuf> {
    match cwd {
        Some(dir) => Ok(dir),
        None => std::env::current_dir().context("reading current directory"),
    }
}

fn render(message: &ServerMessage) {
    match message {
        ServerMessage::JobStarted { job_id } => println!("job {job_id} started"),
        ServerMessage::PhaseStart {
            phase,
            total_phases,
            name,
            milestones,
        } => {
            println!("== phase {phase}/{total_phases}: {name}");
            for milestone in milestones {
                println!("   - {milestone}");
            }
        }
        ServerMessage::MilestoneUpdate {
            milestone, status, ..
        } => println!("   {milestone}: {status:?}"),
        ServerMessage::Progress { percent, message, .. } => println!("[{percent:>3}%] {message}"),
        ServerMessage::ToolRequest { tool, .. } => println!("   > {tool}"),
        ServerMessage::Complete {
            summary,
            files_changed,
            ..
        } => {
            println!("done: {summary}");
            for file in files_changed {
                println!("   {file}");
            }
        }
        ServerMessage::Error {
            message,
            recoverable: true,
            ..
        } => eprintln!("warning: {message}"),
        ServerMessage::Paused {
            job_id,
            resume_token,
            ..
        } => println!("paused; resume with: tether resume {job_id} --resume-token {resume_token}"),
        ServerMessage::Resumed { phase, milestone, .. } => {
            println!("resumed at phase {phase} ({})", milestone.as_deref().unwrap_or("-"))
        }
        ServerMessage::JobStatus(summary) => println!(
            "{}: {:?} phase {}/{} {}% {}",
            summary.job_id,
            summary.status,
            summary.phase,
            summary.total_phases,
            summary.progress_percent,
            summary.current_milestone.as_deref().unwrap_or("")
        ),
        ServerMessage::Cancelled { job_id } => println!("job {job_id} cancelled"),
        _ => {}
    }
}
