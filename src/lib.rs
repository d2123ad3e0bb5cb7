//! # mlip-serve
//!
//! Broker/worker serving of machine-learned interatomic potential (MLIP)
//! calculations over local inter-process messaging.
//!
//! ## Architecture
//!
//! Many client processes route property-evaluation requests through one
//! broker to a pool of long-running, model-specific worker processes:
//!
//! ```text
//! RemoteCalculator ──► Broker frontend (ROUTER)
//!                          │  per-model LRU pick
//!                      Broker backend (ROUTER)
//!                          │
//!                      Worker (DEALER) ──► Calculator ──► response
//! ```
//!
//! Workers register with `READY`, signal liveness with periodic
//! `HEARTBEAT` messages, and self-terminate after a configurable idle
//! period. The [`broker::AutoStartBroker`] additionally spawns worker
//! processes on demand from a static model registry.

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod broker;
pub mod calculator;
pub mod client;
pub mod protocol;
pub mod registry;
pub mod worker;

// Re-exports for convenience
pub use broker::{AutoStartBroker, AutoStartConfig, Broker, BrokerConfig};
pub use calculator::{Calculator, CalculatorError, CalculatorRegistry};
pub use client::{broker_status, Models, RemoteCalculator};
pub use protocol::{CalculationResponse, Property, Structure};
pub use registry::{ModelRecipe, ModelRegistry};
pub use worker::{Worker, WorkerConfig};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for production log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`ServeError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
pub fn init_tracing() -> Result<(), ServeError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| ServeError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors for the serving stack.
///
/// Every error surface — wire protocol, transport, calculator loading,
/// registry parsing, client round trips — is mapped to a variant here.
#[derive(Error, Debug)]
pub enum ServeError {
    /// A message could not be encoded or decoded, or failed validation.
    #[error("protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    /// The underlying messaging transport failed.
    #[error("transport error: {0}")]
    Transport(#[from] tmq::TmqError),

    /// Filesystem I/O error (socket directories, registry file).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A calculator could not be loaded or a calculation failed locally.
    #[error(transparent)]
    Calculator(#[from] calculator::CalculatorError),

    /// A worker (or the broker itself) reported a failed calculation.
    #[error("calculation failed: {0}")]
    Calculation(String),

    /// No response arrived from the broker within the client's timeout.
    ///
    /// The stale request/response channel has been discarded; the next
    /// call reconnects.
    #[error(
        "no response from broker for model '{model}' after {timeout_secs}s — \
         is the broker running, and are there workers for this model?"
    )]
    NoResponse {
        /// Model the request targeted.
        model: String,
        /// The client timeout that elapsed.
        timeout_secs: u64,
    },

    /// The broker's socket file does not exist at the expected path.
    #[error("broker socket not found at {endpoint} — is the broker running?")]
    SocketMissing {
        /// The endpoint that was checked.
        endpoint: String,
    },

    /// The broker did not answer a discovery round trip.
    #[error("no response from broker at {endpoint} — is it running?")]
    Unreachable {
        /// The endpoint that was queried.
        endpoint: String,
    },

    /// A model name was not found among the broker's known models.
    #[error("model '{model}' not available; known models: {available:?}")]
    ModelNotFound {
        /// The requested model name.
        model: String,
        /// Models the broker reported at query time.
        available: Vec<String>,
    },

    /// The model registry file is missing, unparsable, or invalid.
    #[error("registry error: {0}")]
    Registry(String),

    /// A worker process could not be spawned.
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// Configuration validation failed.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_response_display_names_model_and_timeout() {
        let err = ServeError::NoResponse {
            model: "mace-mpa-0".to_string(),
            timeout_secs: 30,
        };
        let msg = err.to_string();
        assert!(msg.contains("mace-mpa-0"));
        assert!(msg.contains("30"));
        assert!(msg.contains("is the broker running"));
    }

    #[test]
    fn test_model_not_found_display_lists_available() {
        let err = ServeError::ModelNotFound {
            model: "nonesuch".to_string(),
            available: vec!["lj".to_string(), "constant".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("nonesuch"));
        assert!(msg.contains("lj"));
    }

    #[test]
    fn test_socket_missing_display_names_endpoint() {
        let err = ServeError::SocketMissing {
            endpoint: "ipc:///tmp/mlip-serve/workers.ipc".to_string(),
        };
        assert!(err.to_string().contains("/tmp/mlip-serve/workers.ipc"));
    }

    #[test]
    fn test_calculation_display_carries_message() {
        let err = ServeError::Calculation("matrix not positive definite".to_string());
        assert!(err.to_string().contains("matrix not positive definite"));
    }

    #[test]
    fn test_from_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ServeError = io.into();
        assert!(matches!(err, ServeError::Io(_)));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
