//! # AutoStartBroker — broker that spawns workers on demand
//!
//! ## Responsibility
//! Everything the base broker does, plus: when a request targets a
//! registered model with no live worker, launch a worker process from
//! the model's recipe and wait (bounded) for its registration before
//! dispatching. Workers received their idle timeout at launch and manage
//! their own lifetime; the broker only tracks processes to avoid
//! duplicate starts.
//!
//! ## Guarantees
//! - At most one tracked spawn per model at a time
//! - The registration wait is bounded; the client always gets an answer
//! - Tracked processes are SIGTERMed with a grace period on shutdown
//!
//! ## NOT Responsible For
//! - Worker idle shutdown (workers self-terminate)
//! - Routing rules (see: the parent module)

use super::state::BrokerState;
use super::{
    cleanup_endpoints, dispatch, frames_of, handle_backend, prepare_endpoints, reply_failure,
    reply_models, reply_status, BrokerConfig, SWEEP_INTERVAL,
};
use crate::protocol::{StatusDetail, DEFAULT_IDLE_TIMEOUT_SECS, LIST_MODELS, STATUS_DETAIL};
use crate::registry::ModelRegistry;
use crate::ServeError;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tmq::router::Router;
use tmq::{router, Context};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

/// How often the registration wait re-polls the backend.
const SPAWN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Grace period between SIGTERM and force-kill at shutdown.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Configuration for the autostart broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoStartConfig {
    /// Base routing configuration (endpoints, staleness window).
    #[serde(flatten)]
    pub broker: BrokerConfig,

    /// Idle timeout (seconds) passed to spawned workers.
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,

    /// Bounded wait (seconds) for a spawned worker's registration.
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
}

impl Default for AutoStartConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            worker_timeout_secs: default_worker_timeout_secs(),
            start_timeout_secs: default_start_timeout_secs(),
        }
    }
}

impl AutoStartConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// [`ServeError::InvalidConfig`] with concatenated messages.
    pub fn validate(&self) -> Result<(), ServeError> {
        self.broker.validate()?;
        let mut errors = Vec::new();
        if self.worker_timeout_secs == 0 {
            errors.push("worker_timeout_secs must be > 0".to_string());
        }
        if self.start_timeout_secs == 0 {
            errors.push("start_timeout_secs must be > 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ServeError::InvalidConfig(errors.join("; ")))
        }
    }
}

fn default_worker_timeout_secs() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_start_timeout_secs() -> u64 {
    30
}

/// A broker that starts workers on demand from a static model registry.
///
/// # Example
///
/// ```rust,no_run
/// use mlip_serve::broker::{AutoStartBroker, AutoStartConfig};
/// use mlip_serve::registry::ModelRegistry;
/// use std::path::Path;
/// use tokio::sync::watch;
///
/// # async fn example() -> Result<(), mlip_serve::ServeError> {
/// let registry = ModelRegistry::load(Path::new("models.toml"))?;
/// let broker = AutoStartBroker::new(AutoStartConfig::default(), registry)?;
/// let (_shutdown_tx, shutdown_rx) = watch::channel(false);
/// broker.run(shutdown_rx).await?;
/// # Ok(())
/// # }
/// ```
pub struct AutoStartBroker {
    config: AutoStartConfig,
    registry: ModelRegistry,
    state: BrokerState,
    /// At most one tracked spawned process per model name.
    children: HashMap<String, Child>,
}

impl AutoStartBroker {
    /// Create an autostart broker over a loaded model registry.
    ///
    /// # Errors
    ///
    /// [`ServeError::InvalidConfig`] if validation fails.
    pub fn new(config: AutoStartConfig, registry: ModelRegistry) -> Result<Self, ServeError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            state: BrokerState::default(),
            children: HashMap::new(),
        })
    }

    /// Run the routing loop until `shutdown` fires or a socket closes.
    ///
    /// Identical to the base broker's loop, except that calculation
    /// requests for registered-but-dormant models trigger a spawn and a
    /// bounded registration wait, and shutdown terminates every tracked
    /// worker process.
    ///
    /// # Errors
    ///
    /// Endpoint preparation or bind failures. Runtime routing errors are
    /// logged and never abort the loop.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), ServeError> {
        prepare_endpoints(&[&self.config.broker.frontend, &self.config.broker.backend])?;

        let context = Context::new();
        let mut frontend = router::router(&context)
            .set_linger(0)
            .bind(&self.config.broker.frontend)?;
        let mut backend = router::router(&context)
            .set_linger(0)
            .bind(&self.config.broker.backend)?;
        info!(endpoint = %self.config.broker.frontend, "broker frontend listening");
        info!(endpoint = %self.config.broker.backend, "broker backend listening");
        info!(models = self.registry.len(), "autostart registry loaded");

        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!("autostart broker started, ready to route messages");

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
                    self.state
                        .sweep(Instant::now(), self.config.broker.stale_after());
                    self.prune_children();
                }
            }
        }

        self.shutdown_children().await;
        drop(frontend);
        drop(backend);
        cleanup_endpoints(&[&self.config.broker.frontend, &self.config.broker.backend]);
        info!("autostart broker stopped");
        Ok(())
    }

    /// Handle one client message, auto-starting a worker when a
    /// registered model has none.
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
        let client_id = frames[0].clone();
        let tag = frames[2].as_slice();

        if tag == LIST_MODELS {
            // The full registry key set, so clients can discover
            // spawnable-but-dormant models, merged with anything serving
            // outside the registry.
            reply_models(frontend, &client_id, &self.known_models()).await;
        } else if tag == STATUS_DETAIL {
            let detail = StatusDetail {
                models: self.state.worker_counts(),
                registry: self.registry.names(),
                autostart: true,
            };
            reply_status(frontend, &client_id, &detail).await;
        } else {
            if frames.len() < 4 {
                warn!(frames = frames.len(), "invalid calculation request from client");
                return;
            }
            let model = String::from_utf8_lossy(tag).into_owned();

            if !self.state.has_available(&model) {
                if !self.registry.contains(&model) {
                    warn!(model = %model, "no workers available and model not in registry");
                    reply_failure(
                        frontend,
                        &client_id,
                        &format!("no workers available for model '{model}'"),
                    )
                    .await;
                    return;
                }

                info!(model = %model, "no workers for registered model, auto-starting");
                if let Err(e) = self.ensure_spawned(&model) {
                    error!(model = %model, error = %e, "failed to start worker");
                }
                if !self.wait_for_worker(&model, frontend, backend).await {
                    reply_failure(
                        frontend,
                        &client_id,
                        &format!(
                            "failed to auto-start worker for model '{model}' within {}s",
                            self.config.start_timeout_secs
                        ),
                    )
                    .await;
                    return;
                }
            }

            dispatch(
                &mut self.state,
                backend,
                frontend,
                &client_id,
                &model,
                &frames[3..],
            )
            .await;
        }
    }

    /// Union of the registry key set and any models currently serving
    /// from outside the registry, sorted.
    fn known_models(&self) -> Vec<String> {
        let mut models = self.registry.names();
        for name in self.state.available_models() {
            if !models.contains(&name) {
                models.push(name);
            }
        }
        models.sort();
        models
    }

    /// Launch a worker for `model` unless one is already tracked and
    /// running. The recipe argv is extended with the idle timeout and
    /// the backend endpoint.
    fn ensure_spawned(&mut self, model: &str) -> Result<(), ServeError> {
        if let Some(child) = self.children.get_mut(model) {
            match child.try_wait() {
                Ok(None) => {
                    debug!(model, "worker process already running");
                    return Ok(());
                }
                Ok(Some(status)) => {
                    info!(model, %status, "previous worker process exited, respawning");
                    self.children.remove(model);
                }
                Err(e) => {
                    warn!(model, error = %e, "could not poll worker process, respawning");
                    self.children.remove(model);
                }
            }
        }

        let recipe = self
            .registry
            .get(model)
            .ok_or_else(|| ServeError::Spawn(format!("model '{model}' not in registry")))?;

        let mut argv = recipe.command.clone();
        argv.push("--timeout".to_string());
        argv.push(self.config.worker_timeout_secs.to_string());
        argv.push("--backend".to_string());
        argv.push(self.config.broker.backend.clone());

        info!(model, command = ?argv, "starting worker");
        let child = Command::new(&argv[0])
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                ServeError::Spawn(format!("failed to start worker for model '{model}': {e}"))
            })?;

        info!(model, pid = child.id(), "worker process started");
        self.children.insert(model.to_string(), child);
        Ok(())
    }

    /// Poll the backend until a worker for `model` is queued or the
    /// start timeout elapses. Every message received while waiting flows
    /// through the normal worker-side handler, so the new worker's READY
    /// actually queues it (and unrelated heartbeats and responses behave
    /// normally).
    async fn wait_for_worker(
        &mut self,
        model: &str,
        frontend: &mut Router,
        backend: &mut Router,
    ) -> bool {
        let deadline = Instant::now() + Duration::from_secs(self.config.start_timeout_secs);
        while Instant::now() < deadline {
            if self.state.has_available(model) {
                return true;
            }
            match tokio::time::timeout(SPAWN_POLL_INTERVAL, backend.next()).await {
                Err(_) => continue,
                Ok(None) => {
                    warn!("backend socket closed while waiting for worker");
                    return false;
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "backend receive error while waiting for worker")
                }
                Ok(Some(Ok(msg))) => {
                    let frames = frames_of(&msg);
                    handle_backend(&mut self.state, frontend, &frames).await;
                }
            }
        }
        self.state.has_available(model)
    }

    /// Drop tracked processes that have exited, so a future request can
    /// re-spawn them.
    fn prune_children(&mut self) {
        self.children.retain(|model, child| match child.try_wait() {
            Ok(Some(status)) => {
                info!(model, %status, "worker process exited");
                false
            }
            Ok(None) => true,
            Err(e) => {
                warn!(model, error = %e, "could not poll worker process");
                true
            }
        });
    }

    /// Terminate every tracked worker process: SIGTERM, bounded grace
    /// period, then force-kill.
    async fn shutdown_children(&mut self) {
        for (model, mut child) in self.children.drain() {
            info!(model = %model, pid = child.id(), "terminating worker process");
            terminate_gracefully(&mut child).await;
        }
    }
}

/// Send SIGTERM (Unix), wait up to the grace period, then force-kill.
async fn terminate_gracefully(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            if let Ok(pid) = i32::try_from(pid) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
            }
        }
    }

    match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
        Ok(Ok(status)) => debug!(%status, "worker process exited"),
        Ok(Err(e)) => warn!(error = %e, "error waiting for worker process"),
        Err(_) => {
            warn!("worker process unresponsive after grace period, killing");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "failed to kill worker process");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ModelRecipe;

    fn test_registry(command: &[&str]) -> ModelRegistry {
        ModelRegistry::from_recipes([(
            "lj".to_string(),
            ModelRecipe {
                command: command.iter().map(|s| s.to_string()).collect(),
                extras: vec![],
            },
        )])
        .unwrap()
    }

    fn test_config() -> AutoStartConfig {
        AutoStartConfig {
            broker: BrokerConfig {
                frontend: "ipc:///tmp/mlip-serve-test/frontend.ipc".to_string(),
                backend: "ipc:///tmp/mlip-serve-test/backend.ipc".to_string(),
                stale_after_secs: 15,
            },
            worker_timeout_secs: 300,
            start_timeout_secs: 30,
        }
    }

    #[test]
    fn test_config_defaults_are_valid() {
        assert!(AutoStartConfig::default().validate().is_ok());
        assert_eq!(AutoStartConfig::default().worker_timeout_secs, 300);
    }

    #[test]
    fn test_config_rejects_zero_start_timeout() {
        let config = AutoStartConfig {
            start_timeout_secs: 0,
            ..test_config()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_ensure_spawned_tracks_single_child() {
        let mut broker =
            AutoStartBroker::new(test_config(), test_registry(&["sleep", "30"])).unwrap();
        broker.ensure_spawned("lj").unwrap();
        // A second call while the first child lives must not spawn again.
        broker.ensure_spawned("lj").unwrap();
        assert_eq!(broker.children.len(), 1);
        broker.shutdown_children().await;
        assert!(broker.children.is_empty());
    }

    #[tokio::test]
    async fn test_ensure_spawned_respawns_exited_child() {
        let mut broker =
            AutoStartBroker::new(test_config(), test_registry(&["true"])).unwrap();
        broker.ensure_spawned("lj").unwrap();

        // Wait for the short-lived process to exit.
        if let Some(child) = broker.children.get_mut("lj") {
            let _ = child.wait().await;
        }

        broker.ensure_spawned("lj").unwrap();
        assert_eq!(broker.children.len(), 1);
        broker.shutdown_children().await;
    }

    #[tokio::test]
    async fn test_ensure_spawned_missing_program_is_spawn_error() {
        let mut broker = AutoStartBroker::new(
            test_config(),
            test_registry(&["nonexistent-binary-8472"]),
        )
        .unwrap();
        let result = broker.ensure_spawned("lj");
        assert!(matches!(result, Err(ServeError::Spawn(msg)) if msg.contains("lj")));
        assert!(broker.children.is_empty());
    }

    #[tokio::test]
    async fn test_prune_children_drops_exited_processes() {
        let mut broker =
            AutoStartBroker::new(test_config(), test_registry(&["true"])).unwrap();
        broker.ensure_spawned("lj").unwrap();
        if let Some(child) = broker.children.get_mut("lj") {
            let _ = child.wait().await;
        }
        broker.prune_children();
        assert!(broker.children.is_empty());
    }

    #[test]
    fn test_known_models_merges_registry_and_live_workers() {
        let mut broker =
            AutoStartBroker::new(test_config(), test_registry(&["true"])).unwrap();
        broker
            .state
            .register_ready(b"w1", "external-model", Instant::now());
        let models = broker.known_models();
        assert_eq!(
            models,
            vec!["external-model".to_string(), "lj".to_string()]
        );
    }
}
