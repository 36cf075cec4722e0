//! jrpcd entry point.
//!
//! Loads the config file, applies command line overrides, sets up logging and
//! serves JSON-RPC until interrupted.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use jrpc_server::{ServerConfig, run};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// jrpcd - JSON-RPC command server over HTTP and WebSocket
#[derive(Parser, Debug)]
#[command(name = "jrpcd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (defaults to `<config dir>/jrpc/config.json`)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the config file
    #[arg(long, value_name = "ADDR")]
    listen: Option<String>,

    /// Answer id-less requests that carry no `jsonrpc` member
    #[arg(long)]
    rpcquirks: bool,

    /// Also write logs to a timestamped file in this directory
    #[arg(long, value_name = "DIR")]
    logdir: Option<PathBuf>,
}

/// Set up stderr logging, plus a file layer when `log_dir` is given.
/// Debug builds default to debug level, release builds to info.
fn setup_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let default_level = if cfg!(debug_assertions) {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("jrpc={default_level}")));

    let Some(log_dir) = log_dir else {
        let stderr_layer = fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(true)
            .with_line_number(true);

        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        return None;
    };

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_filename = format!("jrpcd-{timestamp}.log");
    let file_appender = tracing_appender::rolling::never(log_dir, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .with(filter)
        .init();

    eprintln!(
        "Logging to: {} (and stderr)",
        log_dir.join(&log_filename).display()
    );
    Some(guard)
}

fn load_config(args: &Args) -> anyhow::Result<ServerConfig> {
    let path = args.config.clone().or_else(ServerConfig::default_path);

    // Load before logging is installed, but still surface unknown-key warnings.
    let subscriber = fmt().with_writer(std::io::stderr).finish();
    let mut config = tracing::subscriber::with_default(subscriber, || match &path {
        Some(path) => ServerConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(ServerConfig::default()),
    })?;

    if let Some(listen) = &args.listen {
        config.listen.clone_from(listen);
    }
    if args.rpcquirks {
        config.rpc_quirks = true;
    }
    if let Some(log_dir) = &args.logdir {
        config.log_dir = Some(log_dir.clone());
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;

    let _guard = setup_logging(config.log_dir.as_deref());

    info!("Starting jrpcd on {}", config.listen);
    run(config).await.context("RPC server failed")?;

    info!("jrpcd stopped");
    Ok(())
}
