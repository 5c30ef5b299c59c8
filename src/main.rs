use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use endpoint_interchange::config::{HeartbeatConfig, InterchangeConfig, RegInfo, ShellEngineConfig};
use endpoint_interchange::engine::ShellEngine;
use endpoint_interchange::interchange::{Interchange, ShutdownReason};
use endpoint_interchange::shutdown::install_shutdown_handler;
use endpoint_interchange::transport::{Connector, MemoryBroker};

#[derive(Parser, Debug)]
#[command(name = "endpoint-interchange")]
#[command(version)]
#[command(about = "Bridges a task broker and a local execution engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the interchange until idle, quiesced, or orphaned
    Run(RunArgs),
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// JSON file with task_queue_info and result_queue_info
    #[arg(long)]
    reg_info: PathBuf,

    /// Endpoint identifier (random if omitted)
    #[arg(long)]
    endpoint_id: Option<Uuid>,

    /// Seconds between heartbeats and status reports
    #[arg(long, default_value = "30")]
    heartbeat_period: f64,

    /// Idle heartbeats before a graceful shutdown (0 disables)
    #[arg(long, default_value = "0")]
    idle_heartbeats_soft: u32,

    /// Idle heartbeats before a forced shutdown; must exceed the soft limit
    #[arg(long)]
    idle_heartbeats_hard: Option<u32>,

    /// Shut down if this process stops being our parent
    #[arg(long)]
    parent_pid: Option<u32>,

    /// Concurrent shell tasks
    #[arg(long, default_value = "4")]
    max_workers: usize,

    /// Per-task time limit in seconds
    #[arg(long)]
    task_timeout: Option<u64>,

    /// Port for the status dashboard (optional)
    #[arg(long)]
    dashboard_port: Option<u16>,

    /// Use an in-process broker instead of AMQP (for local trials)
    #[arg(long)]
    memory_broker: bool,
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let heartbeat_period = Duration::try_from_secs_f64(args.heartbeat_period)
        .map_err(|e| format!("invalid --heartbeat-period {}: {}", args.heartbeat_period, e))?;

    let reg_info = RegInfo::from_file(&args.reg_info)?;

    let mut heartbeat = HeartbeatConfig::new(heartbeat_period)
        .with_soft_limit(args.idle_heartbeats_soft);
    if let Some(hard) = args.idle_heartbeats_hard {
        heartbeat = heartbeat.with_hard_limit(hard);
    }

    let mut config =
        InterchangeConfig::new(args.endpoint_id.unwrap_or_else(Uuid::new_v4)).with_heartbeat(heartbeat);
    if let Some(pid) = args.parent_pid {
        config = config.with_parent_pid(pid);
    }
    config.dashboard_addr = args
        .dashboard_port
        .map(|port| SocketAddr::from(([0, 0, 0, 0], port)));

    let engine = ShellEngine::new(ShellEngineConfig {
        max_workers: args.max_workers,
        task_timeout: args.task_timeout.map(Duration::from_secs),
        ..ShellEngineConfig::default()
    });

    let connector = connector(args.memory_broker)?;
    let quiesce = install_shutdown_handler();

    let interchange = Interchange::new(config, reg_info, connector, Box::new(engine))?
        .with_quiesce(quiesce);

    let reason = interchange.start().await?;
    tracing::info!(reason = %reason, "Interchange exited");
    if reason == ShutdownReason::ParentMismatch {
        eprintln!("Refused to start: parent process mismatch");
    }
    Ok(())
}

#[cfg(feature = "amqp")]
fn connector(memory: bool) -> Result<Arc<dyn Connector>, Box<dyn std::error::Error>> {
    use endpoint_interchange::transport::AmqpConnector;

    if memory {
        return Ok(Arc::new(MemoryBroker::new()));
    }
    Ok(Arc::new(AmqpConnector::new()))
}

#[cfg(not(feature = "amqp"))]
fn connector(memory: bool) -> Result<Arc<dyn Connector>, Box<dyn std::error::Error>> {
    if memory {
        return Ok(Arc::new(MemoryBroker::new()));
    }
    Err("built without the `amqp` feature; pass --memory-broker".into())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Run(run_args) => run(run_args).await,
    }
}
