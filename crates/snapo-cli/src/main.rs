//! Snap-O CLI
//!
//! Command-line front end for the Snap-O network inspector. It tracks
//! devices through adb, connects to every instrumented app it finds, and
//! prints the reconstructed HTTP and WebSocket traffic.

use clap::Parser;
use snapo_core::{AdbBridge, DeviceBridge, InspectorConfig, InspectorService, StdoutEventSink};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod watch;

/// Snap-O - watch network traffic of instrumented Android apps
#[derive(Parser, Debug)]
#[command(name = "snapo")]
#[command(version, about, long_about = None)]
struct Args {
    /// Output format: text or json
    #[arg(short, long, default_value = "text")]
    format: OutputFormat,

    /// Configuration file (defaults to <config dir>/snapo/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to the adb executable
    #[arg(long, env = "SNAPO_ADB")]
    adb: Option<PathBuf>,

    /// Socket poll interval in milliseconds
    #[arg(long)]
    poll_interval_ms: Option<u64>,

    /// Keep disconnected apps and their traffic until exit
    #[arg(long)]
    retain: bool,

    /// Fetch request and response bodies of completed requests
    #[arg(long)]
    fetch_bodies: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

/// Load the configuration file and apply command-line overrides
fn resolve_config(args: &Args) -> snapo_core::Result<InspectorConfig> {
    let mut config = match &args.config {
        Some(path) => InspectorConfig::load(path)?,
        None => InspectorConfig::load_or_default()?,
    };
    if let Some(adb) = &args.adb {
        config = config.with_adb_path(adb.clone());
    }
    if let Some(interval) = args.poll_interval_ms {
        config = config.with_poll_interval_ms(interval);
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr so stdout only carries traffic
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let config = match resolve_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let bridge: Arc<dyn DeviceBridge> = Arc::new(AdbBridge::new(config.adb_path.clone()));
    let options = watch::WatchOptions {
        device_poll_interval: config.poll_interval(),
        bridge_timeout: config.bridge_timeout(),
        retain_servers: args.retain,
        fetch_bodies: args.fetch_bodies,
    };

    tracing::info!("Watching devices with {}", config.adb_path.display());

    let service = match InspectorService::start(config, bridge.clone()) {
        Ok(service) => Arc::new(service),
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let json_output = matches!(args.format, OutputFormat::Json);
    let event_sink = StdoutEventSink::new(json_output);

    match watch::run_watch(service, bridge, options, event_sink).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}
