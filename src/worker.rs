//! # Worker — serves calculations for exactly one named model
//!
//! ## State machine
//!
//! ```text
//! Loading → Connecting → Ready ⇄ Busy → (idle timeout) → ShuttingDown
//! ```
//!
//! The calculator is loaded once before connecting (fatal on failure).
//! The worker then connects to the broker backend with a DEALER socket
//! whose identity encodes model, hostname, pid, and a random component,
//! announces itself with `READY`, and loops: idle-timeout check,
//! heartbeat if due, then a bounded poll for one request. Exactly one
//! request is in flight at any time — the broker's LRU queue relies on
//! this.
//!
//! The idle clock resets the moment a request is *received*, not when it
//! completes. Calculator errors become failure responses; they never
//! escape the loop. Voluntary shutdown is silent: the broker notices the
//! missing heartbeats.

use crate::broker::{frames_of, multipart};
use crate::calculator::{Calculator, CalculatorError};
use crate::protocol::{
    self, pack_failure, pack_success, unpack_request, Property, Structure,
    DEFAULT_HEARTBEAT_INTERVAL_SECS, DEFAULT_IDLE_TIMEOUT_SECS, HEARTBEAT, READY,
};
use crate::ServeError;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tmq::dealer::Dealer;
use tmq::{dealer, Context};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Bounded poll so heartbeats and the idle check stay timely.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Configuration for a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Broker backend endpoint to connect to.
    #[serde(default = "protocol::default_backend_endpoint")]
    pub backend: String,

    /// Seconds of inactivity after which the worker shuts down.
    /// Resets on every received request.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Seconds between heartbeats to the broker.
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            backend: protocol::default_backend_endpoint(),
            idle_timeout_secs: default_idle_timeout_secs(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
        }
    }
}

impl WorkerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// [`ServeError::InvalidConfig`] with concatenated messages.
    pub fn validate(&self) -> Result<(), ServeError> {
        let mut errors = Vec::new();
        if self.backend.is_empty() {
            errors.push("backend endpoint must not be empty".to_string());
        }
        if self.idle_timeout_secs == 0 {
            errors.push("idle_timeout_secs must be > 0".to_string());
        }
        if self.heartbeat_interval_secs == 0 {
            errors.push("heartbeat_interval_secs must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServeError::InvalidConfig(errors.join("; ")))
        }
    }

    /// The idle timeout as a [`Duration`].
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// The heartbeat interval as a [`Duration`].
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn default_idle_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_heartbeat_interval_secs() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_SECS
}

/// What the event loop should do next, given the two clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tick {
    /// Idle longer than the timeout: shut down.
    Shutdown,
    /// A heartbeat is due before anything else.
    Heartbeat,
    /// Poll for a request.
    Wait,
}

/// Decide the next loop action. Factored out so the timing rules are
/// testable without sockets: shutdown wins once the idle timeout has
/// fully elapsed, then a due heartbeat, then waiting for work.
pub(crate) fn next_tick(
    now: Instant,
    last_request: Instant,
    idle_timeout: Duration,
    last_heartbeat: Instant,
    heartbeat_interval: Duration,
) -> Tick {
    if now.duration_since(last_request) >= idle_timeout {
        Tick::Shutdown
    } else if now.duration_since(last_heartbeat) >= heartbeat_interval {
        Tick::Heartbeat
    } else {
        Tick::Wait
    }
}

/// A worker process serving one model through one calculator.
///
/// # Example
///
/// ```rust,no_run
/// use mlip_serve::calculator::CalculatorRegistry;
/// use mlip_serve::worker::{Worker, WorkerConfig};
/// use tokio::sync::watch;
///
/// # async fn example() -> Result<(), mlip_serve::ServeError> {
/// let calculator = CalculatorRegistry::with_builtins().create("lj")?;
/// let worker = Worker::new("lj", calculator, WorkerConfig::default())?;
/// let (_shutdown_tx, shutdown_rx) = watch::channel(false);
/// worker.run(shutdown_rx).await?;
/// # Ok(())
/// # }
/// ```
pub struct Worker {
    model_name: String,
    calculator: Arc<dyn Calculator>,
    config: WorkerConfig,
    identity: Vec<u8>,
}

impl Worker {
    /// Create a worker for `model_name` over an already-loaded
    /// calculator.
    ///
    /// # Errors
    ///
    /// [`ServeError::InvalidConfig`] if validation fails.
    pub fn new(
        model_name: impl Into<String>,
        calculator: Arc<dyn Calculator>,
        config: WorkerConfig,
    ) -> Result<Self, ServeError> {
        config.validate()?;
        let model_name = model_name.into();
        let identity = worker_identity(&model_name);
        Ok(Self {
            model_name,
            calculator,
            config,
            identity,
        })
    }

    /// This worker's unique identity bytes.
    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Connect to the broker and serve requests until the idle timeout,
    /// an external shutdown signal, or loss of the broker connection.
    ///
    /// # Errors
    ///
    /// [`ServeError::SocketMissing`] when the broker's backend socket
    /// does not exist, or transport errors while connecting. Calculation
    /// failures never abort the loop.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServeError> {
        if !protocol::broker_socket_exists(&self.config.backend) {
            error!(
                endpoint = %self.config.backend,
                "broker socket not found — is the broker running?"
            );
            return Err(ServeError::SocketMissing {
                endpoint: self.config.backend.clone(),
            });
        }

        let context = Context::new();
        let mut socket = dealer::dealer(&context)
            .set_identity(&self.identity)
            .set_linger(0)
            .connect(&self.config.backend)?;
        info!(
            worker = %String::from_utf8_lossy(&self.identity),
            endpoint = %self.config.backend,
            "connected to broker"
        );

        self.send_ready(&mut socket).await?;
        let mut last_heartbeat = Instant::now();
        let mut last_request = Instant::now();
        info!(
            model = %self.model_name,
            timeout_secs = self.config.idle_timeout_secs,
            "worker ready to serve"
        );

        loop {
            match next_tick(
                Instant::now(),
                last_request,
                self.config.idle_timeout(),
                last_heartbeat,
                self.config.heartbeat_interval(),
            ) {
                Tick::Shutdown => {
                    info!(
                        timeout_secs = self.config.idle_timeout_secs,
                        "idle timeout reached, shutting down"
                    );
                    break;
                }
                Tick::Heartbeat => {
                    self.send_heartbeat(&mut socket).await?;
                    last_heartbeat = Instant::now();
                    continue;
                }
                Tick::Wait => {}
            }

            tokio::select! {
                _ = shutdown.changed() => {
                    info!("worker shutdown signal received");
                    break;
                }
                message = tokio::time::timeout(POLL_INTERVAL, socket.next()) => match message {
                    Err(_) => {} // poll bound elapsed; loop for the timers
                    Ok(None) => {
                        info!("broker connection closed, exiting");
                        break;
                    }
                    Ok(Some(Err(e))) => {
                        error!(error = %e, "receive error, exiting");
                        break;
                    }
                    Ok(Some(Ok(msg))) => {
                        // The idle clock resets at receipt, not completion.
                        last_request = Instant::now();
                        let frames = frames_of(&msg);
                        if let Err(e) = self.handle_request(&mut socket, &frames).await {
                            error!(error = %e, "failed to handle request");
                        }
                    }
                }
            }
        }

        info!("worker stopped");
        Ok(())
    }

    /// Process one calculation request and answer through the same
    /// envelope identity, then re-announce availability.
    async fn handle_request(
        &self,
        socket: &mut Dealer,
        frames: &[Vec<u8>],
    ) -> Result<(), ServeError> {
        // Request envelope as seen by the DEALER:
        // [empty, client_id, empty, model_name, payload].
        if frames.len() < 5 {
            warn!(frames = frames.len(), "invalid request format");
            self.send_ready(socket).await?;
            return Ok(());
        }
        let client_id = frames[1].clone();
        let payload = &frames[4];

        let response = match unpack_request(payload) {
            Ok((structure, properties)) => {
                let calculator = Arc::clone(&self.calculator);
                let outcome = tokio::task::spawn_blocking(move || {
                    evaluate(calculator.as_ref(), &structure, &properties)
                })
                .await;
                match outcome {
                    Ok(Ok((energy, forces, stress))) => {
                        debug!(model = %self.model_name, "completed calculation");
                        pack_success(energy, forces.as_deref(), stress.as_ref())?
                    }
                    Ok(Err(e)) => {
                        error!(error = %e, "calculation failed");
                        pack_failure(&e.to_string())?
                    }
                    Err(e) => {
                        error!(error = %e, "calculation task aborted");
                        pack_failure("calculation task aborted")?
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "undecodable request");
                pack_failure(&format!("invalid request: {e}"))?
            }
        };

        socket
            .send(multipart(vec![Vec::new(), client_id, Vec::new(), response]))
            .await?;

        // Signal availability for the next request.
        self.send_ready(socket).await?;
        Ok(())
    }

    async fn send_ready(&self, socket: &mut Dealer) -> Result<(), ServeError> {
        socket
            .send(multipart(vec![
                Vec::new(),
                READY.to_vec(),
                self.model_name.as_bytes().to_vec(),
            ]))
            .await?;
        Ok(())
    }

    async fn send_heartbeat(&self, socket: &mut Dealer) -> Result<(), ServeError> {
        socket
            .send(multipart(vec![
                Vec::new(),
                HEARTBEAT.to_vec(),
                self.model_name.as_bytes().to_vec(),
            ]))
            .await?;
        debug!(model = %self.model_name, "sent heartbeat");
        Ok(())
    }
}

/// Evaluate exactly the requested property subset.
fn evaluate(
    calculator: &dyn Calculator,
    structure: &Structure,
    properties: &[Property],
) -> Result<(Option<f64>, Option<Vec<[f64; 3]>>, Option<[f64; 6]>), CalculatorError> {
    let mut energy = None;
    let mut forces = None;
    let mut stress = None;
    for property in properties {
        match property {
            Property::Energy => energy = Some(calculator.potential_energy(structure)?),
            Property::Forces => forces = Some(calculator.forces(structure)?),
            Property::Stress => stress = Some(calculator.stress(structure)?),
        }
    }
    Ok((energy, forces, stress))
}

/// Build a unique worker identity: model, hostname, pid, and a random
/// suffix, so identities never collide across machines or PID reuse.
fn worker_identity(model: &str) -> Vec<u8> {
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown-host".to_string());
    let pid = std::process::id();
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!("worker-{model}-{host}-{pid}-{}", &nonce[..8]).into_bytes()
}
