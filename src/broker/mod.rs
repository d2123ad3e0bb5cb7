//! # Broker — LRU router between clients and model workers
//!
//! ## Responsibility
//! Bind the two ROUTER endpoints (client-facing frontend, worker-facing
//! backend), route each calculation request to the least-recently-used
//! available worker for its model, forward responses back, and evict
//! workers that stop sending heartbeats.
//!
//! ## Architecture
//!
//! ```text
//! clients ──► frontend (ROUTER) ──┐
//!                                 │ single select! loop, 1 s sweep tick
//! workers ──► backend (ROUTER) ───┘
//! ```
//!
//! One task owns all state ([`state::BrokerState`]); there is no locking
//! anywhere in the routing path. Malformed messages are dropped with a
//! logged warning, never a crash.
//!
//! ## Modules
//!
//! - [`state`] — per-model LRU queues and the heartbeat table
//! - [`autostart`] — [`AutoStartBroker`], which additionally spawns
//!   workers on demand from a static model registry

pub mod autostart;
pub(crate) mod state;

pub use autostart::{AutoStartBroker, AutoStartConfig};

use crate::protocol::{
    self, StatusDetail, DEFAULT_STALE_AFTER_SECS, HEARTBEAT, LIST_MODELS, READY, STATUS_DETAIL,
};
use crate::ServeError;
use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use state::{BrokerState, Registration};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tmq::router::Router;
use tmq::{router, Context, Message, Multipart, TmqError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// Poll bound and liveness-sweep cadence for the routing loop.
pub(crate) const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// Configuration for the base broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Client-facing endpoint (frontend).
    #[serde(default = "protocol::default_frontend_endpoint")]
    pub frontend: String,

    /// Worker-facing endpoint (backend).
    #[serde(default = "protocol::default_backend_endpoint")]
    pub backend: String,

    /// Seconds without a heartbeat after which a worker is evicted.
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend: protocol::default_frontend_endpoint(),
            backend: protocol::default_backend_endpoint(),
            stale_after_secs: default_stale_after_secs(),
        }
    }
}

impl BrokerConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// [`ServeError::InvalidConfig`] with concatenated messages.
    pub fn validate(&self) -> Result<(), ServeError> {
        let mut errors = Vec::new();
        if self.frontend.is_empty() {
            errors.push("frontend endpoint must not be empty".to_string());
        }
        if self.backend.is_empty() {
            errors.push("backend endpoint must not be empty".to_string());
        }
        if self.frontend == self.backend {
            errors.push("frontend and backend endpoints must differ".to_string());
        }
        if self.stale_after_secs == 0 {
            errors.push("stale_after_secs must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServeError::InvalidConfig(errors.join("; ")))
        }
    }

    /// The staleness window as a [`Duration`].
    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

fn default_stale_after_secs() -> u64 {
    DEFAULT_STALE_AFTER_SECS
}

/// The LRU routing broker.
///
/// # Example
///
/// ```rust,no_run
/// use mlip_serve::broker::{Broker, BrokerConfig};
/// use tokio::sync::watch;
///
/// # async fn example() -> Result<(), mlip_serve::ServeError> {
/// let (_shutdown_tx, shutdown_rx) = watch::channel(false);
/// let broker = Broker::new(BrokerConfig::default())?;
/// broker.run(shutdown_rx).await?;
/// # Ok(())
/// # }
/// ```
pub struct Broker {
    config: BrokerConfig,
    state: BrokerState,
}

impl Broker {
    /// Create a broker with the given configuration.
    ///
    /// # Errors
    ///
    /// [`ServeError::InvalidConfig`] if validation fails.
    pub fn new(config: BrokerConfig) -> Result<Self, ServeError> {
        config.validate()?;
        Ok(Self {
            config,
            state: BrokerState::default(),
        })
    }

    /// Run the routing loop until `shutdown` fires or a socket closes.
    ///
    /// Binds both endpoints (removing stale socket files first), then
    /// alternates between worker messages, client messages, and the
    /// periodic liveness sweep. On exit the endpoints are released and
    /// their socket files removed so a restart does not fail on stale
    /// artifacts.
    ///
    /// # Errors
    ///
    /// Endpoint preparation or bind failures. Runtime routing errors are
    /// logged and never abort the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServeError> {
        prepare_endpoints(&[&self.config.frontend, &self.config.backend])?;

        let context = Context::new();
        let mut frontend = router::router(&context)
            .set_linger(0)
            .bind(&self.config.frontend)?;
        let mut backend = router::router(&context)
            .set_linger(0)
            .bind(&self.config.backend)?;
        info!(endpoint = %self.config.frontend, "broker frontend listening");
        info!(endpoint = %self.config.backend, "broker backend listening");

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("broker started, ready to route messages");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("broker shutdown signal received");
                    break;
                }
                message = backend.next() => match message {
                    Some(Ok(msg)) => {
                        let frames = frames_of(&msg);
                        handle_backend(&mut self.state, &mut frontend, &frames).await;
                    }
                    Some(Err(e)) => error!(error = %e, "backend receive error"),
                    None => {
                        warn!("backend socket closed");
                        break;
                    }
                },
                message = frontend.next() => match message {
                    Some(Ok(msg)) => {
                        let frames = frames_of(&msg);
                        self.handle_frontend(&mut frontend, &mut backend, &frames).await;
                    }
                    Some(Err(e)) => error!(error = %e, "frontend receive error"),
                    None => {
                        warn!("frontend socket closed");
                        break;
                    }
                },
                _ = sweep.tick() => {
                    self.state.sweep(Instant::now(), self.config.stale_after());
                }
            }
        }

        drop(frontend);
        drop(backend);
        cleanup_endpoints(&[&self.config.frontend, &self.config.backend]);
        info!("broker stopped");
        Ok(())
    }

    /// Handle one client message: discovery tags or a calculation
    /// request to dispatch.
    async fn handle_frontend(
        &mut self,
        frontend: &mut Router,
        backend: &mut Router,
        frames: &[Vec<u8>],
    ) {
        if frames.len() < 3 {
            warn!(frames = frames.len(), "invalid message from client");
            return;
        }
        let client_id = &frames[0];
        let tag = frames[2].as_slice();

        if tag == LIST_MODELS {
            reply_models(frontend, client_id, &self.state.available_models()).await;
        } else if tag == STATUS_DETAIL {
            let detail = StatusDetail {
                models: self.state.worker_counts(),
                registry: Vec::new(),
                autostart: false,
            };
            reply_status(frontend, client_id, &detail).await;
        } else {
            if frames.len() < 4 {
                warn!(frames = frames.len(), "invalid calculation request from client");
                return;
            }
            let model = String::from_utf8_lossy(tag).into_owned();
            dispatch(&mut self.state, backend, frontend, client_id, &model, &frames[3..]).await;
        }
    }
}

// ── Shared envelope plumbing (used by both broker variants) ───────────────

/// Copy the frames of a multipart message out of the socket buffer.
pub(crate) fn frames_of(message: &Multipart) -> Vec<Vec<u8>> {
    message.iter().map(|frame| frame.to_vec()).collect()
}

/// Build a multipart message from raw frames.
pub(crate) fn multipart(parts: Vec<Vec<u8>>) -> Multipart {
    let frames: VecDeque<Message> = parts.into_iter().map(Message::from).collect();
    Multipart(frames)
}

/// Send raw frames on a socket, surfacing the transport error.
pub(crate) async fn send_parts<S>(socket: &mut S, parts: Vec<Vec<u8>>) -> Result<(), TmqError>
where
    S: Sink<Multipart, Error = TmqError> + Unpin,
{
    socket.send(multipart(parts)).await
}

/// Handle one worker message: READY, HEARTBEAT, or a forwarded response.
///
/// Shared by [`Broker`] and [`AutoStartBroker`] so autostart's bounded
/// registration wait runs new workers through the exact same path.
pub(crate) async fn handle_backend<S>(
    state: &mut BrokerState,
    frontend: &mut S,
    frames: &[Vec<u8>],
) where
    S: Sink<Multipart, Error = TmqError> + Unpin,
{
    if frames.len() < 3 {
        warn!(frames = frames.len(), "invalid message from worker");
        return;
    }
    let worker_id = &frames[0];
    let tag = frames[2].as_slice();

    if tag == READY {
        if frames.len() < 4 {
            warn!(
                worker = %String::from_utf8_lossy(worker_id),
                "invalid READY message from worker"
            );
            return;
        }
        let model = String::from_utf8_lossy(&frames[3]).into_owned();
        match state.register_ready(worker_id, &model, Instant::now()) {
            Registration::New => info!(
                worker = %String::from_utf8_lossy(worker_id),
                model = %model,
                "new worker registered"
            ),
            Registration::Requeued => debug!(
                worker = %String::from_utf8_lossy(worker_id),
                model = %model,
                "worker ready"
            ),
            Registration::AlreadyQueued => debug!(
                worker = %String::from_utf8_lossy(worker_id),
                "duplicate READY ignored"
            ),
        }
    } else if tag == HEARTBEAT {
        if frames.len() < 4 {
            warn!(
                worker = %String::from_utf8_lossy(worker_id),
                "invalid HEARTBEAT message from worker"
            );
            return;
        }
        if state.heartbeat(worker_id, Instant::now()) {
            debug!(worker = %String::from_utf8_lossy(worker_id), "heartbeat");
        } else {
            debug!(
                worker = %String::from_utf8_lossy(worker_id),
                "heartbeat from unregistered worker ignored"
            );
        }
    } else {
        // Response envelope: [worker_id, _, client_id, _, payload...].
        // The payload is forwarded untouched.
        if frames.len() < 5 {
            warn!(
                worker = %String::from_utf8_lossy(worker_id),
                frames = frames.len(),
                "invalid response from worker"
            );
            return;
        }
        let client_id = frames[2].clone();
        let mut parts = vec![client_id, Vec::new()];
        parts.extend(frames[4..].iter().cloned());
        if let Err(e) = send_parts(frontend, parts).await {
            error!(error = %e, "failed to forward response to client");
        } else {
            debug!(
                worker = %String::from_utf8_lossy(worker_id),
                client = %String::from_utf8_lossy(&frames[2]),
                "routed response"
            );
        }
    }
}

/// Pop the LRU worker for `model` and forward the request, or reply
/// immediately with a failure when no worker is available.
pub(crate) async fn dispatch<SB, SF>(
    state: &mut BrokerState,
    backend: &mut SB,
    frontend: &mut SF,
    client_id: &[u8],
    model: &str,
    payload: &[Vec<u8>],
) where
    SB: Sink<Multipart, Error = TmqError> + Unpin,
    SF: Sink<Multipart, Error = TmqError> + Unpin,
{
    let Some(worker_id) = state.pop_worker(model) else {
        warn!(model, "no workers available");
        reply_failure(
            frontend,
            client_id,
            &format!("no workers available for model '{model}'"),
        )
        .await;
        return;
    };

    let mut parts = vec![
        worker_id.clone(),
        Vec::new(),
        client_id.to_vec(),
        Vec::new(),
        model.as_bytes().to_vec(),
    ];
    parts.extend(payload.iter().cloned());
    if let Err(e) = send_parts(backend, parts).await {
        error!(error = %e, "failed to forward request to worker");
    } else {
        debug!(
            client = %String::from_utf8_lossy(client_id),
            worker = %String::from_utf8_lossy(&worker_id),
            model,
            "routed request"
        );
    }
}

/// Reply to a client with a failure response.
pub(crate) async fn reply_failure<S>(frontend: &mut S, client_id: &[u8], message: &str)
where
    S: Sink<Multipart, Error = TmqError> + Unpin,
{
    match protocol::pack_failure(message) {
        Ok(payload) => {
            if let Err(e) =
                send_parts(frontend, vec![client_id.to_vec(), Vec::new(), payload]).await
            {
                error!(error = %e, "failed to send failure reply");
            }
        }
        Err(e) => error!(error = %e, "failed to encode failure reply"),
    }
}

/// Reply to a `LIST_MODELS` request.
pub(crate) async fn reply_models<S>(frontend: &mut S, client_id: &[u8], models: &[String])
where
    S: Sink<Multipart, Error = TmqError> + Unpin,
{
    match protocol::pack_model_list(models) {
        Ok(payload) => {
            if let Err(e) =
                send_parts(frontend, vec![client_id.to_vec(), Vec::new(), payload]).await
            {
                error!(error = %e, "failed to send model list");
            } else {
                debug!(client = %String::from_utf8_lossy(client_id), ?models, "sent model list");
            }
        }
        Err(e) => error!(error = %e, "failed to encode model list"),
    }
}

/// Reply to a `STATUS_DETAIL` request.
pub(crate) async fn reply_status<S>(frontend: &mut S, client_id: &[u8], detail: &StatusDetail)
where
    S: Sink<Multipart, Error = TmqError> + Unpin,
{
    match protocol::pack_status_detail(detail) {
        Ok(payload) => {
            if let Err(e) =
                send_parts(frontend, vec![client_id.to_vec(), Vec::new(), payload]).await
            {
                error!(error = %e, "failed to send status detail");
            }
        }
        Err(e) => error!(error = %e, "failed to encode status detail"),
    }
}

/// Create endpoint directories and remove stale socket files left by an
/// unclean shutdown, so binding succeeds.
pub(crate) fn prepare_endpoints(endpoints: &[&str]) -> Result<(), ServeError> {
    for endpoint in endpoints {
        protocol::ensure_endpoint_dir(endpoint)?;
    }
    cleanup_endpoints(endpoints);
    Ok(())
}

/// Remove the socket files backing `ipc://` endpoints.
pub(crate) fn cleanup_endpoints(endpoints: &[&str]) {
    for endpoint in endpoints {
        if let Some(path) = protocol::socket_file(endpoint) {
            if path.exists() {
                match std::fs::remove_file(&path) {
                    Ok(()) => debug!(path = %path.display(), "cleaned up socket file"),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "failed to clean up socket file")
                    }
                }
            }
        }
    }
}
