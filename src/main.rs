//! wgpipe service binary
//!
//! Serves tunnel commands from the desktop controller until stopped with
//! Ctrl+C or SIGTERM.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::{fmt, EnvFilter};

use wgpipe::handlers::{build_registry, StagedInterface, TunnelManager};
use wgpipe::ipc::{platform_endpoint, CommandDispatcher, ListenerLoop};
use wgpipe::service::{StopSignal, TracingStatusReporter};
use wgpipe::{ServiceConfig, ServiceError, ServiceLifecycle};

/// wgpipe - WireGuard interface control service
#[derive(Parser, Debug)]
#[command(name = "wgpipe-service")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Pipe name (Windows) or socket path to listen on
    #[arg(long)]
    address: Option<String>,

    /// Seconds to wait before recreating a failed endpoint
    #[arg(long)]
    retry_delay: Option<u64>,

    /// Give up after this many consecutive endpoint failures
    #[arg(long)]
    max_retries: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Set up logging
    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e.user_message());
            ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(u8::MAX))
        }
    }
}

async fn run(args: Args) -> Result<(), ServiceError> {
    let config = load_config(&args)?;
    tracing::info!("wgpipe service starting on {}", config.address);

    let manager = Arc::new(TunnelManager::new(Arc::new(StagedInterface::new())));
    let dispatcher = CommandDispatcher::new(build_registry(manager));
    let listener = ListenerLoop::new(platform_endpoint(&config.address), dispatcher)
        .with_retry_policy(config.retry_policy())
        .with_limits(config.session_limits());

    let mut service = ServiceLifecycle::new(TracingStatusReporter, config.shutdown_timeout());
    service.start(listener)?;

    tokio::spawn(stop_on_signal(service.stop_signal()));

    service.run_until_stopped().await
}

/// Settings file (if any) with command line overrides applied
fn load_config(args: &Args) -> Result<ServiceConfig, ServiceError> {
    let mut config = match &args.config {
        Some(path) => {
            tracing::info!("Loading settings from: {}", path.display());
            ServiceConfig::from_file(path)?
        }
        None => ServiceConfig::default(),
    };

    if let Some(address) = &args.address {
        config.address = address.clone();
    }
    if let Some(delay) = args.retry_delay {
        config.retry_delay_secs = delay;
    }
    if args.max_retries.is_some() {
        config.max_retries = args.max_retries;
    }

    config.validate()?;
    Ok(config)
}

/// Trigger stop on Ctrl+C or SIGTERM
async fn stop_on_signal(stop: StopSignal) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received Ctrl+C, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
    stop.stop();
}
