//! # mlip-worker — worker entry point
//!
//! Serves calculations for one named model until the idle timeout.
//!
//! ## Usage
//!
//! ```bash
//! # Serve the built-in Lennard-Jones model on the default backend
//! mlip-worker lj
//!
//! # Explicit backend and idle timeout (as passed by the autostart broker)
//! mlip-worker lj --backend ipc:///run/user/1000/mlip-serve/workers.ipc --timeout 300
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json` — structured JSON output (production)
//! - `RUST_LOG=info` — log level filter

use mlip_serve::calculator::CalculatorRegistry;
use mlip_serve::worker::{Worker, WorkerConfig};
use mlip_serve::{init_tracing, protocol};
use tokio::sync::watch;
use tracing::{error, info};

/// Parsed CLI arguments.
struct Args {
    /// Model name to serve (positional).
    model: String,
    /// Broker backend endpoint override.
    backend: Option<String>,
    /// Idle timeout in seconds.
    timeout_secs: u64,
}

const USAGE: &str = "usage: mlip-worker <model> [--backend <addr>] [--timeout <secs>]";

/// Parse command-line arguments manually (no external arg parser
/// dependency).
fn parse_args() -> Result<Args, String> {
    let argv: Vec<String> = std::env::args().collect();
    let mut model = None;
    let mut backend = None;
    let mut timeout_secs = protocol::DEFAULT_IDLE_TIMEOUT_SECS;

    let mut i = 1;
    while i < argv.len() {
        match argv[i].as_str() {
            "--backend" => {
                i += 1;
                backend = Some(
                    argv.get(i)
                        .cloned()
                        .ok_or_else(|| format!("--backend requires a value\n{USAGE}"))?,
                );
            }
            "--timeout" => {
                i += 1;
                timeout_secs = argv
                    .get(i)
                    .ok_or_else(|| format!("--timeout requires a value\n{USAGE}"))?
                    .parse()
                    .map_err(|e| format!("--timeout: {e}\n{USAGE}"))?;
            }
            "--help" | "-h" => return Err(USAGE.to_string()),
            positional if !positional.starts_with('-') && model.is_none() => {
                model = Some(positional.to_string());
            }
            other => return Err(format!("unknown argument '{other}'\n{USAGE}")),
        }
        i += 1;
    }

    let model = model.ok_or_else(|| format!("missing model name\n{USAGE}"))?;
    Ok(Args {
        model,
        backend,
        timeout_secs,
    })
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

    // Resolve and load the calculator first; this is the expensive
    // one-time step, and failure here aborts startup.
    let registry = CalculatorRegistry::with_builtins();
    let calculator = match registry.create(&args.model) {
        Ok(calculator) => calculator,
        Err(e) => {
            error!(model = %args.model, error = %e, "cannot load calculator");
            error!(available = ?registry.names(), "available models");
            std::process::exit(1);
        }
    };
    info!(model = %args.model, "calculator loaded");

    let config = WorkerConfig {
        backend: args
            .backend
            .unwrap_or_else(protocol::default_backend_endpoint),
        idle_timeout_secs: args.timeout_secs,
        ..WorkerConfig::default()
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            let _ = shutdown_tx.send(true);
        }
    });

    Worker::new(args.model, calculator, config)?.run(shutdown_rx).await?;
    Ok(())
}
