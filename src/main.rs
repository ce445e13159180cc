//! deej - serial sliders to live audio volume
//!
//! Reads slider positions from an Arduino-style board over serial and maps
//! them onto application, device and master volumes.

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deej::config::{ConfigHandle, ConfigPaths, ConfigWatcher};
use deej::router::EventRouter;
use deej::serial::{available_ports, SerialConnection};
use deej::session::{new_session_finder, Backend, CooldownForeground, SessionRegistry};

const LOG_DIRECTORY: &str = "logs";
const LOG_FILE_NAME: &str = "deej-latest-run.log";

/// deej - control audio volumes with physical sliders
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "DEEJ_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Path to the internal preferences file (optional)
    #[arg(long, default_value = "logs/preferences.yaml")]
    preferences: PathBuf,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Shorthand for --log-level debug
    #[arg(short, long)]
    verbose: bool,

    /// Audio backend
    #[arg(short, long, value_enum, default_value_t = Backend::Auto)]
    backend: Backend,

    /// List available serial ports
    #[arg(long)]
    list_ports: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let level = if args.verbose { "debug" } else { args.log_level.as_str() };
    let _log_guard = init_logging(level)?;

    if args.list_ports {
        return list_ports();
    }

    info!("🎚️  Starting deej v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config.display());

    if let Err(e) = run(args).await {
        error!("deej stopped: {:#}", e);
        return Err(e);
    }

    info!("deej shutdown complete");
    Ok(())
}

/// Build the pipeline, run it until ctrl-c, then release audio resources
async fn run(args: Args) -> Result<()> {
    let paths = ConfigPaths {
        user: args.config,
        internal: args.preferences,
    };

    let (mut config_watcher, initial_config) = ConfigWatcher::new(paths).await?;
    info!("Configuration loaded successfully with hot-reload enabled");

    let config = ConfigHandle::new(initial_config);
    let registry = Arc::new(SessionRegistry::new(
        new_session_finder(args.backend),
        config.clone(),
        Arc::new(CooldownForeground::for_platform()),
    ));

    let result = run_pipeline(&registry, &config, &mut config_watcher).await;

    if let Err(e) = registry.release().await {
        warn!("Failed to release session registry: {}", e);
        if result.is_ok() {
            return Err(e).context("Failed to release session registry");
        }
    }

    result
}

async fn run_pipeline(
    registry: &Arc<SessionRegistry>,
    config: &ConfigHandle,
    config_watcher: &mut ConfigWatcher,
) -> Result<()> {
    registry
        .initialize()
        .await
        .context("Failed to initialize session registry")?;

    let serial = Arc::new(SerialConnection::new(config.clone()));
    let router = EventRouter::start(
        Arc::clone(registry),
        serial.subscribe_slider_moves(),
        config.subscribe_to_changes(),
    );
    let serial_listener = serial.spawn_reload_listener(router.shutdown_signal());

    if let Err(e) = serial.start().await {
        if let Some(hint) = e.hint() {
            warn!("{}", hint);
        }
        router.shutdown().await;
        let _ = serial_listener.await;
        return Err(e).context("Failed to start first-time serial connection");
    }

    info!("✅ deej is running, move a slider!");

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            Some(new_config) = config_watcher.next_config() => {
                info!("📝 Configuration file changed, applying...");
                config.apply(new_config).await;
            }

            _ = &mut shutdown => {
                info!("Shutting down deej");
                break;
            }
        }
    }

    router.shutdown().await;
    let _ = serial_listener.await;
    serial.stop().await;

    Ok(())
}

/// Console plus a fresh per-run log file
fn init_logging(level: &str) -> Result<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    std::fs::create_dir_all(LOG_DIRECTORY)
        .with_context(|| format!("Failed to create log directory: {}", LOG_DIRECTORY))?;
    let log_path = Path::new(LOG_DIRECTORY).join(LOG_FILE_NAME);
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file: {}", log_path.display()))?;
    let (file_writer, guard) = tracing_appender::non_blocking(log_file);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}

fn list_ports() -> Result<()> {
    let ports = available_ports()?;

    println!("\n{}", "=== Serial Ports ===".bold().cyan());

    if ports.is_empty() {
        println!("  {}", "No serial ports found".yellow());
        return Ok(());
    }

    for (name, description) in ports {
        println!("  {}  {}", name.green(), description.dimmed());
    }
    println!();

    Ok(())
}
