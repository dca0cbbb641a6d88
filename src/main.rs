use clap::Parser;
use mrmd_monitor::monitor::{Monitor, MonitorConfig};
use mrmd_monitor::notebook::Notebook;
use mrmd_monitor::telemetry::logging::{self as logctl, LogConfig, LogFormat, LogLevel};
use mrmd_monitor::transport::AwarenessUser;
use std::time::Duration;
use thiserror::Error;
use tokio::signal;
use tracing::{debug, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "monitor",
    about = "Headless execution monitor for collaborative notebooks",
    author,
    version
)]
struct Cli {
    /// Sync server url; ws:// is assumed when no scheme is given
    #[arg(value_name = "SYNC_URL")]
    sync_url: String,

    /// Room / document name on the sync server
    #[arg(long = "doc", env = "MRMD_MONITOR_DOC", default_value = "default")]
    doc: String,

    /// Awareness display name announced to other peers
    #[arg(long, env = "MRMD_MONITOR_NAME", default_value = "mrmd-monitor")]
    name: String,

    /// Awareness display color announced to other peers
    #[arg(long, env = "MRMD_MONITOR_COLOR", default_value = "#10b981")]
    color: String,

    #[arg(
        long = "log-level",
        value_enum,
        env = "MRMD_MONITOR_LOG_LEVEL",
        default_value_t = LogLevel::Info
    )]
    log_level: LogLevel,

    #[arg(
        long = "log-format",
        value_enum,
        env = "MRMD_MONITOR_LOG_FORMAT",
        default_value_t = LogFormat::Pretty
    )]
    log_format: LogFormat,
}

#[derive(Error, Debug)]
enum CliError {
    #[error("logging initialization failed: {0}")]
    Logging(String),
    #[error("{0}")]
    Monitor(#[from] mrmd_monitor::monitor::MonitorError),
}

async fn run() -> Result<(), CliError> {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        // --help and --version print to stdout and exit clean; anything
        // else is an argument error.
        Err(err) if !err.use_stderr() => {
            let _ = err.print();
            return Ok(());
        }
        Err(err) => {
            let _ = err.print();
            std::process::exit(1);
        }
    };
    let log_config = LogConfig {
        level: cli.log_level,
        format: cli.log_format,
    };
    logctl::init(&log_config).map_err(|err| CliError::Logging(err.to_string()))?;

    let config = MonitorConfig {
        sync_url: normalize_sync_url(&cli.sync_url),
        doc_name: cli.doc,
        user: AwarenessUser {
            name: cli.name,
            color: cli.color,
        },
    };
    info!(
        sync_url = %config.sync_url,
        doc = %config.doc_name,
        name = %config.user.name,
        "starting monitor"
    );

    let notebook = Notebook::new();
    debug!(client_id = notebook.client_id(), "notebook doc created");
    let mut monitor = Monitor::connect(notebook, &config).await?;
    info!("monitor connected; observing executions");

    tokio::select! {
        result = monitor.run() => result?,
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    monitor.disconnect().await;
    // Brief drain so queued sync frames and cancellations flush out.
    tokio::time::sleep(Duration::from_millis(200)).await;
    info!("monitor stopped");
    Ok(())
}

fn normalize_sync_url(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal as unix_signal, SignalKind};
    match unix_signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
