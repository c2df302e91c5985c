//! stemd - local audio stem-separation job daemon
//!
//! Accepts WAV uploads over HTTP, dispatches them onto the worker
//! pool, and serves job status and packaged results. SIGINT/SIGTERM
//! drain the pool before exit.

mod registry;
mod routes;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use stemd_core::config::JobTemplate;
use stemd_core::service::{CacheConfig, RuntimeConfig, Service};

use registry::JobRegistry;
use routes::AppState;

/// Local audio stem-separation job server.
#[derive(Parser, Debug)]
#[command(name = "stemd", version, about)]
struct Args {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    bind_address: String,

    /// Port to listen on
    #[arg(long, default_value_t = 8345)]
    port: u16,

    /// Directory for cached model weights
    /// [default: $STEMD_HOME/cache or ~/.stemd/cache]
    #[arg(long)]
    cache_root: Option<PathBuf>,

    /// Directory for job outputs and uploads
    /// [default: $STEMD_HOME/output or ~/.stemd/output]
    #[arg(long)]
    output_root: Option<PathBuf>,

    /// Worker thread count [default: number of CPUs]
    #[arg(long)]
    workers: Option<usize>,
}

fn default_root() -> PathBuf {
    if let Ok(home) = std::env::var("STEMD_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".stemd")
}

fn main() -> ExitCode {
    // Set RUST_LOG=debug for verbose output.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("stemd: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

#[tokio::main]
async fn run(args: Args) -> Result<()> {
    let root = default_root();
    let cache_root = args.cache_root.unwrap_or_else(|| root.join("cache"));
    let output_root = args.output_root.unwrap_or_else(|| root.join("output"));

    let runtime = RuntimeConfig {
        cache: CacheConfig {
            root: cache_root.clone(),
            ..CacheConfig::default()
        },
        output_root: output_root.clone(),
        worker_count: args.workers,
        ..RuntimeConfig::default()
    };

    let service =
        Arc::new(Service::create(runtime, JobTemplate::default()).context("service startup failed")?);

    let state = AppState {
        service: Some(Arc::clone(&service)),
        registry: Arc::new(JobRegistry::new()),
        output_root: output_root.clone(),
    };

    let addr: SocketAddr = format!("{}:{}", args.bind_address, args.port)
        .parse()
        .with_context(|| format!("invalid bind address {}:{}", args.bind_address, args.port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;

    log::info!("stemd listening on {}", addr);
    log::info!("cache_root={:?}", cache_root);
    log::info!("output_root={:?}", output_root);

    axum::serve(listener, routes::router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    // Drain the pool so running jobs observe their stop flags and
    // queued ones resolve as cancelled before the process exits.
    service.shutdown();
    log::info!("stemd stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => log::error!("failed to install SIGTERM handler: {}", e),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    log::info!("shutdown signal received, draining workers");
}
