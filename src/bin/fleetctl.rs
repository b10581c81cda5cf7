//! fleetctl CLI
//!
//! Command-line control surface for the fleet scheduling engine: submit and
//! cancel tasks, pause/resume admission, adjust the throttle, inspect
//! metrics and the dead-letter queue, or run the HTTP/SSE/WebSocket server.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fleetctl::config::ConfigLoader;
use fleetctl::model::{Priority, Task, TaskId, TaskType};
use fleetctl::Engine;

#[derive(Parser)]
#[command(name = "fleetctl")]
#[command(about = "Task scheduling and event distribution engine for a fleet of AI inference workers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Embedded state store path
    #[arg(long, default_value = "./fleetctl_db", env = "FLEETCTL_STORE_PATH")]
    store: PathBuf,

    /// Path to a JSON config file; falls back to env-derived defaults when absent
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit a new task
    Submit {
        /// Task title
        title: String,
        /// Task type
        #[arg(long, value_enum)]
        task_type: CliTaskType,
        /// Priority (defaults to normal)
        #[arg(long, value_enum)]
        priority: Option<CliPriority>,
        /// Relative task complexity, 1-10
        #[arg(long, default_value_t = 1)]
        complexity: u32,
        /// Task input payload as a JSON string
        #[arg(long)]
        input: Option<String>,
    },

    /// Cancel a task
    Cancel {
        /// Task id
        task_id: String,
    },

    /// Pause all admission and in-flight dispatch
    PauseAll,

    /// Resume the scheduler after a pause
    Run,

    /// Adjust the global throttle rate (0.1-2.0)
    Throttle {
        /// New throttle rate
        rate: f64,
    },

    /// Print current engine metrics
    Metrics,

    /// List entries currently parked in the dead-letter queue
    ListDlq,

    /// Start the HTTP/SSE/WebSocket server
    Serve {
        /// Host to bind to
        #[arg(long, default_value = "0.0.0.0")]
        host: String,
        /// Port to listen on
        #[arg(long, default_value_t = 8080)]
        port: u16,
    },
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliTaskType {
    TextProcessing,
    CodeGeneration,
    DataAnalysis,
    WebScraping,
    ApiCall,
    FileProcessing,
    Computation,
}

impl From<CliTaskType> for TaskType {
    fn from(value: CliTaskType) -> Self {
        match value {
            CliTaskType::TextProcessing => TaskType::TextProcessing,
            CliTaskType::CodeGeneration => TaskType::CodeGeneration,
            CliTaskType::DataAnalysis => TaskType::DataAnalysis,
            CliTaskType::WebScraping => TaskType::WebScraping,
            CliTaskType::ApiCall => TaskType::ApiCall,
            CliTaskType::FileProcessing => TaskType::FileProcessing,
            CliTaskType::Computation => TaskType::Computation,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliPriority {
    Low,
    Normal,
    High,
    Critical,
}

impl From<CliPriority> for Priority {
    fn from(value: CliPriority) -> Self {
        match value {
            CliPriority::Low => Priority::Low,
            CliPriority::Normal => Priority::Normal,
            CliPriority::High => Priority::High,
            CliPriority::Critical => Priority::Critical,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load_from_env()?,
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .init();

    let engine = Engine::open(&cli.store, config).await.map_err(|e| format!("opening state store: {e}"))?;

    match cli.command {
        Commands::Submit { title, task_type, priority, complexity, input } => {
            let data = match input {
                Some(raw) => serde_json::from_str(&raw).map_err(|e| format!("invalid input JSON: {e}"))?,
                None => serde_json::Value::Null,
            };
            let mut task = Task::new(title, task_type.into(), data);
            task.priority = priority.map(Priority::from).unwrap_or(Priority::Normal);
            task.complexity = complexity;
            let submitted = engine.scheduler.submit(task).await.map_err(|e| format!("submitting task: {e}"))?;
            println!("{}", serde_json::to_string_pretty(&submitted)?);
        }

        Commands::Cancel { task_id } => {
            let task_id = TaskId::parse_str(&task_id).map_err(|e| format!("invalid task id: {e}"))?;
            engine.scheduler.cancel(task_id).await.map_err(|e| format!("cancelling task: {e}"))?;
            println!("task {task_id} cancelled");
        }

        Commands::PauseAll => {
            engine.flags.pause().await.map_err(|e| format!("pausing: {e}"))?;
            println!("paused (active tasks affected: {})", engine.scheduler.active_task_count());
        }

        Commands::Run => {
            engine.flags.resume().await.map_err(|e| format!("resuming: {e}"))?;
            println!("running");
        }

        Commands::Throttle { rate } => {
            engine.flags.set_throttle(rate).await.map_err(|e| format!("setting throttle: {e}"))?;
            println!("throttle rate set to {rate}");
        }

        Commands::Metrics => {
            let (events_in, events_out) = engine.aggregator.stats();
            let metrics = serde_json::json!({
                "throttle_rate": engine.flags.throttle_rate().await,
                "paused": engine.flags.is_paused().await,
                "pending_tasks": engine.scheduler.active_task_count(),
                "active_agents": engine.fanout.active_count().await,
                "events_ingested": events_in,
                "events_published": events_out,
            });
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }

        Commands::ListDlq => {
            let entries = engine.scheduler.list_dlq().await.map_err(|e| format!("listing dlq: {e}"))?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }

        Commands::Serve { host, port } => {
            let app = fleetctl::http::router(engine.clone());
            let addr: SocketAddr = format!("{host}:{port}").parse().map_err(|e| format!("invalid address {host}:{port}: {e}"))?;
            let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| format!("binding to {addr}: {e}"))?;
            tracing::info!(%addr, "fleetctl listening");
            axum::serve(listener, app).await.map_err(|e| format!("server error: {e}"))?;
            engine.shutdown().await;
        }
    }

    Ok(())
}
