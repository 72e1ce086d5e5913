//! vulnd - isolated-worker vulnerability scan daemon.
//!
//! `vulnd serve` runs the orchestrator: control plane on a Unix socket,
//! bounded registry and queue, one supervised worker process per scan.
//! The hidden `worker` subcommand is how the orchestrator re-executes this
//! binary for each job; it is not meant to be invoked by hand.

use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::net::UnixListener;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vulnd_core::config::Config;
use vulnd_core::queue::{JobQueue, Processor, QueueConfig};
use vulnd_core::registry::{RegistryConfig, ScanRegistry};

use vulnd_daemon::manager::{WorkerConfig, WorkerManager};
use vulnd_daemon::server::ControlPlane;
use vulnd_daemon::worker;

/// vulnd - scan github repositories for CRITICAL vulnerabilities.
#[derive(Parser, Debug)]
#[command(name = "vulnd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the daemon (default).
    Serve,

    /// Engine worker mode; spawned by the daemon, one scan per process.
    #[command(hide = true)]
    Worker,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = Config::from_env();

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Worker => worker::run(&config).await,
    }
}

/// Compose registry, queue, manager and control plane, then run until a
/// shutdown signal arrives.
async fn serve(config: Config) -> Result<()> {
    info!(
        socket = %config.socket_path.display(),
        max_queued = config.queue_max_size,
        max_concurrent = config.queue_max_concurrent,
        worker_timeout = %humantime::format_duration(config.worker_timeout),
        "starting vulnd"
    );

    let registry = Arc::new(Mutex::new(ScanRegistry::new(RegistryConfig {
        max_entries: config.registry_max_entries,
        max_vulns_per_scan: config.registry_max_vulns_per_scan,
    })));

    let queue = Arc::new(Mutex::new(JobQueue::new(QueueConfig {
        max_queued: config.queue_max_size,
        max_concurrent: config.queue_max_concurrent,
    })));

    let worker_cmd = worker_command().context("failed to resolve the worker command")?;
    let manager = WorkerManager::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        WorkerConfig {
            worker_cmd,
            heap_limit_bytes: config.worker_heap_limit_bytes,
            timeout: config.worker_timeout,
        },
    );

    // The queue's processor: hand the job to the manager, fire-and-forget.
    // run_job itself guarantees the slot release on every path, so this
    // closure never fails synchronously in production.
    let processor: Processor = {
        let manager = Arc::clone(&manager);
        Arc::new(move |job| {
            manager.run_job(job);
            Ok(())
        })
    };
    queue.lock().unwrap().set_processor(processor);

    // A stale socket from an unclean shutdown would fail the bind.
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)
            .with_context(|| format!("failed to remove stale socket {:?}", config.socket_path))?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {parent:?}"))?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .with_context(|| format!("failed to bind control socket {:?}", config.socket_path))?;

    let control = ControlPlane::new(
        Arc::clone(&registry),
        Arc::clone(&queue),
        config.retry_after_seconds,
    );
    let control_task = tokio::spawn(Arc::clone(&control).run(listener));

    info!(pid = std::process::id(), "vulnd started");

    // Only a shutdown signal brings the orchestrator down; worker crashes
    // never do.
    let mut sigterm = signal(SignalKind::terminate()).context("failed to register SIGTERM")?;
    let mut sigint = signal(SignalKind::interrupt()).context("failed to register SIGINT")?;
    tokio::select! {
        _ = sigterm.recv() => info!("received SIGTERM"),
        _ = sigint.recv() => info!("received SIGINT"),
    }

    info!("shutting down");
    control.request_shutdown();
    if let Err(error) = control_task.await {
        warn!(%error, "control plane task failed");
    }

    manager.shutdown_workers(config.worker_shutdown_grace).await;

    if let Err(error) = std::fs::remove_file(&config.socket_path) {
        warn!(%error, "failed to remove control socket");
    }

    info!("shutdown complete");
    Ok(())
}

/// The command line used to spawn workers: this binary, `worker` mode.
fn worker_command() -> Result<Vec<String>> {
    let exe = std::env::current_exe().context("failed to resolve current executable")?;
    Ok(vec![exe.to_string_lossy().into_owned(), "worker".to_string()])
}
