//! # mlip-broker — broker entry point
//!
//! Runs the LRU routing broker, optionally with autostart.
//!
//! ## Usage
//!
//! ```bash
//! # Plain broker on the default endpoints
//! mlip-broker
//!
//! # Autostart broker over a model registry
//! mlip-broker --autostart --models models.toml --worker-timeout 300
//!
//! # Query a running broker
//! mlip-broker --status
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter

use mlip_serve::broker::{AutoStartBroker, AutoStartConfig, Broker, BrokerConfig};
use mlip_serve::client::broker_status;
use mlip_serve::registry::ModelRegistry;
use mlip_serve::{init_tracing, protocol};
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

/// Parsed CLI arguments.
struct Args {
    /// Client-facing endpoint override.
    frontend: Option<String>,
    /// Worker-facing endpoint override.
    backend: Option<String>,
    /// Heartbeat staleness window in seconds.
    stale_after_secs: u64,
    /// Enable autostart (requires `--models`).
    autostart: bool,
    /// Path to the model registry TOML.
    models_file: Option<PathBuf>,
    /// Idle timeout passed to auto-started workers.
    worker_timeout_secs: u64,
    /// Bounded wait for auto-started worker registration.
    start_timeout_secs: u64,
    /// Query a running broker and exit.
    status_only: bool,
}

const USAGE: &str = "usage: mlip-broker [--frontend <addr>] [--backend <addr>] \
[--stale-after <secs>] [--autostart --models <file>] [--worker-timeout <secs>] \
[--start-timeout <secs>] [--status]";

/// Parse command-line arguments manually (no external arg parser
/// dependency).
fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = std::env::args().collect();
    let mut args = Args {
        frontend: None,
        backend: None,
        stale_after_secs: protocol::DEFAULT_STALE_AFTER_SECS,
        autostart: false,
        models_file: None,
        worker_timeout_secs: protocol::DEFAULT_IDLE_TIMEOUT_SECS,
        start_timeout_secs: 30,
        status_only: false,
    };

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--frontend" => {
                i += 1;
                args.frontend = Some(value(&argv, i, "--frontend")?);
            }
            "--backend" => {
                i += 1;
                args.backend = Some(value(&argv, i, "--backend")?);
            }
            "--stale-after" => {
                i += 1;
                args.stale_after_secs = number(&argv, i, "--stale-after")?;
            }
            "--autostart" => args.autostart = true,
            "--models" => {
                i += 1;
                args.models_file = Some(PathBuf::from(value(&argv, i, "--models")?));
            }
            "--worker-timeout" => {
                i += 1;
                args.worker_timeout_secs = number(&argv, i, "--worker-timeout")?;
            }
            "--start-timeout" => {
                i += 1;
                args.start_timeout_secs = number(&argv, i, "--start-timeout")?;
            }
            "--status" => args.status_only = true,
            "--help" | "-h" => return Err(USAGE.to_string()),
            other => return Err(format!("unknown argument '{other}'\n{USAGE}")),
        }
        i += 1;
    }

    if args.autostart && args.models_file.is_none() {
        return Err(format!("--autostart requires --models <file>\n{USAGE}"));
    }
    Ok(args)
}

fn value(argv: &[String], i: usize, flag: &str) -> Result<String, String> {
    argv.get(i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value\n{USAGE}"))
}

fn number(argv: &[String], i: usize, flag: &str) -> Result<u64, String> {
    value(argv, i, flag)?
        .parse()
        .map_err(|e| format!("{flag}: {e}\n{USAGE}"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = init_tracing();

    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let broker_config = BrokerConfig {
        frontend: args
            .frontend
            .unwrap_or_else(protocol::default_frontend_endpoint),
        backend: args
            .backend
            .unwrap_or_else(protocol::default_backend_endpoint),
        stale_after_secs: args.stale_after_secs,
    };

    if args.status_only {
        let status = broker_status(&broker_config.frontend).await;
        if status.running {
            println!("broker running at {}", status.broker);
            println!("models: {:?}", status.models);
        } else {
            println!(
                "broker not reachable at {}: {}",
                status.broker,
                status.error.unwrap_or_default()
            );
            std::process::exit(1);
        }
        return Ok(());
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    if args.autostart {
        let models_file = args.models_file.unwrap_or_default();
        let registry = ModelRegistry::load(&models_file)?;
        let config = AutoStartConfig {
            broker: broker_config,
            worker_timeout_secs: args.worker_timeout_secs,
            start_timeout_secs: args.start_timeout_secs,
        };
        AutoStartBroker::new(config, registry)?.run(shutdown_rx).await?;
    } else {
        Broker::new(broker_config)?.run(shutdown_rx).await?;
    }

    Ok(())
}
