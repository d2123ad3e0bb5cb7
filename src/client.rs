//! # Client stub — synchronous-style request/response to the broker
//!
//! ## Responsibility
//! [`RemoteCalculator`] sends one calculation request at a time to the
//! broker frontend and blocks (up to a configurable timeout) for the
//! response. [`Models`] is the discovery helper: a fresh `LIST_MODELS`
//! round trip per query, so membership is always current.
//!
//! ## Timeout behavior
//! A request/response channel that timed out cannot be reused: the
//! socket is dropped and the next call reconnects, so any late reply
//! dies with the old socket. A worker that was already dispatched still
//! completes its calculation and may send a response nobody consumes —
//! an accepted limitation of the routing design.

use crate::broker::{frames_of, multipart};
use crate::protocol::{
    self, pack_request, unpack_model_list, unpack_response, unpack_status_detail,
    CalculationResponse, Property, ProtocolError, StatusDetail, Structure, DEFAULT_PROPERTIES,
    LIST_MODELS, STATUS_DETAIL,
};
use crate::ServeError;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tmq::dealer::Dealer;
use tmq::{dealer, Context};
use tracing::{debug, warn};

/// Default client timeout for calculation round trips.
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Short timeout for discovery round trips.
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// A calculator-shaped stub that evaluates structures on remote workers
/// through the broker.
///
/// # Example
///
/// ```rust,no_run
/// use mlip_serve::client::RemoteCalculator;
/// use mlip_serve::protocol::Structure;
///
/// # async fn example(structure: Structure) -> Result<(), mlip_serve::ServeError> {
/// let mut calc = RemoteCalculator::new("lj");
/// let energy = calc.potential_energy(&structure).await?;
/// println!("E = {energy} eV");
/// # Ok(())
/// # }
/// ```
pub struct RemoteCalculator {
    model: String,
    broker: String,
    timeout: Duration,
    context: Context,
    socket: Option<Dealer>,
}

impl RemoteCalculator {
    /// Create a stub for `model` against the default broker endpoint.
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            broker: protocol::default_frontend_endpoint(),
            timeout: DEFAULT_REQUEST_TIMEOUT,
            context: Context::new(),
            socket: None,
        }
    }

    /// Use an explicit broker frontend endpoint.
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = broker.into();
        self
    }

    /// Set the response timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The model this stub is bound to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Request `properties` of `structure` from a remote worker.
    ///
    /// # Errors
    ///
    /// - [`ServeError::NoResponse`] when the timeout elapses (the
    ///   connection is discarded and recreated on the next call)
    /// - [`ServeError::Calculation`] when the broker or worker reports a
    ///   failure (no workers, calculator error, ...)
    /// - [`ServeError::Transport`] / [`ServeError::Protocol`] for
    ///   transport and decoding faults
    pub async fn calculate(
        &mut self,
        structure: &Structure,
        properties: &[Property],
    ) -> Result<CalculationResponse, ServeError> {
        let payload = pack_request(structure, properties)?;

        // Take the socket out of the slot: any failure path below simply
        // drops it, which is exactly the discard-and-reconnect rule for
        // a stale request/response channel.
        let mut socket = match self.socket.take() {
            Some(socket) => socket,
            None => {
                // LINGER 0 so an undeliverable request never stalls
                // socket teardown after a timeout.
                let socket = dealer::dealer(&self.context)
                    .set_linger(0)
                    .connect(&self.broker)?;
                debug!(broker = %self.broker, "connected to broker");
                socket
            }
        };

        socket
            .send(multipart(vec![
                Vec::new(),
                self.model.as_bytes().to_vec(),
                payload,
            ]))
            .await?;

        let reply = match tokio::time::timeout(self.timeout, socket.next()).await {
            Err(_) => {
                warn!(
                    model = %self.model,
                    timeout = ?self.timeout,
                    "timed out waiting for response, discarding connection"
                );
                return Err(ServeError::NoResponse {
                    model: self.model.clone(),
                    timeout_secs: self.timeout.as_secs(),
                });
            }
            Ok(None) => {
                return Err(ServeError::Unreachable {
                    endpoint: self.broker.clone(),
                })
            }
            Ok(Some(Err(e))) => return Err(e.into()),
            Ok(Some(Ok(msg))) => msg,
        };

        // The round trip succeeded; keep the connection for the next call.
        self.socket = Some(socket);

        let frames = frames_of(&reply);
        let Some(payload) = frames.last() else {
            return Err(ServeError::Unreachable {
                endpoint: self.broker.clone(),
            });
        };
        let response = unpack_response(payload)?;
        if response.success {
            Ok(response)
        } else {
            let message = response
                .error
                .unwrap_or_else(|| "unknown remote error".to_string());
            Err(ServeError::Calculation(message))
        }
    }

    /// Potential energy of `structure` in eV.
    ///
    /// # Errors
    ///
    /// As [`Self::calculate`], plus a protocol error when the response
    /// omits the field.
    pub async fn potential_energy(&mut self, structure: &Structure) -> Result<f64, ServeError> {
        let response = self.calculate(structure, &[Property::Energy]).await?;
        response
            .energy
            .ok_or_else(|| ProtocolError::MissingField { field: "energy" }.into())
    }

    /// Forces on every atom of `structure` in eV/Å.
    ///
    /// # Errors
    ///
    /// As [`Self::calculate`], plus a protocol error when the response
    /// omits the field.
    pub async fn forces(&mut self, structure: &Structure) -> Result<Vec<[f64; 3]>, ServeError> {
        let response = self.calculate(structure, &[Property::Forces]).await?;
        response
            .forces
            .ok_or_else(|| ProtocolError::MissingField { field: "forces" }.into())
    }

    /// Voigt stress of `structure` in eV/Å³.
    ///
    /// # Errors
    ///
    /// As [`Self::calculate`], plus a protocol error when the response
    /// omits the field.
    pub async fn stress(&mut self, structure: &Structure) -> Result<[f64; 6], ServeError> {
        let response = self.calculate(structure, &[Property::Stress]).await?;
        response
            .stress
            .ok_or_else(|| ProtocolError::MissingField { field: "stress" }.into())
    }

    /// Request the default property set (energy and forces).
    ///
    /// # Errors
    ///
    /// As [`Self::calculate`].
    pub async fn calculate_default(
        &mut self,
        structure: &Structure,
    ) -> Result<CalculationResponse, ServeError> {
        self.calculate(structure, &DEFAULT_PROPERTIES).await
    }
}

impl std::fmt::Debug for RemoteCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteCalculator")
            .field("model", &self.model)
            .field("broker", &self.broker)
            .field("timeout", &self.timeout)
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

/// Handle for one model known to a broker, capable of producing a bound
/// [`RemoteCalculator`].
#[derive(Debug, Clone)]
pub struct ModelHandle {
    model: String,
    broker: String,
}

impl ModelHandle {
    /// The model name this handle refers to.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// A [`RemoteCalculator`] bound to this model and broker.
    pub fn calculator(&self) -> RemoteCalculator {
        RemoteCalculator::new(self.model.clone()).with_broker(self.broker.clone())
    }
}

/// Discovery helper over a broker's model directory.
///
/// Every query performs a fresh short-timeout `LIST_MODELS` round trip
/// (no caching), so membership is always current.
///
/// # Example
///
/// ```rust,no_run
/// use mlip_serve::client::Models;
///
/// # async fn example() -> Result<(), mlip_serve::ServeError> {
/// let models = Models::new();
/// for name in models.list().await? {
///     println!("{name}");
/// }
/// let mut calc = models.get("lj").await?.calculator();
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct Models {
    broker: String,
    timeout: Duration,
}

impl Default for Models {
    fn default() -> Self {
        Self::new()
    }
}

impl Models {
    /// Discovery against the default broker endpoint.
    pub fn new() -> Self {
        Self {
            broker: protocol::default_frontend_endpoint(),
            timeout: DISCOVERY_TIMEOUT,
        }
    }

    /// Use an explicit broker frontend endpoint.
    pub fn with_broker(mut self, broker: impl Into<String>) -> Self {
        self.broker = broker.into();
        self
    }

    /// Set the discovery timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Model names currently known to the broker.
    ///
    /// # Errors
    ///
    /// [`ServeError::Unreachable`] when the broker does not answer
    /// within the discovery timeout.
    pub async fn list(&self) -> Result<Vec<String>, ServeError> {
        let payload = round_trip(&self.broker, self.timeout, LIST_MODELS.to_vec()).await?;
        Ok(unpack_model_list(&payload)?)
    }

    /// Whether `name` is currently known to the broker.
    ///
    /// # Errors
    ///
    /// As [`Self::list`].
    pub async fn contains(&self, name: &str) -> Result<bool, ServeError> {
        Ok(self.list().await?.iter().any(|m| m == name))
    }

    /// A handle for `name`, or a not-found error naming the models the
    /// broker reported.
    ///
    /// # Errors
    ///
    /// [`ServeError::ModelNotFound`] for unknown names; otherwise as
    /// [`Self::list`].
    pub async fn get(&self, name: &str) -> Result<ModelHandle, ServeError> {
        let available = self.list().await?;
        if available.iter().any(|m| m == name) {
            Ok(ModelHandle {
                model: name.to_string(),
                broker: self.broker.clone(),
            })
        } else {
            Err(ServeError::ModelNotFound {
                model: name.to_string(),
                available,
            })
        }
    }

    /// Per-model worker counts and the autostart registry.
    ///
    /// # Errors
    ///
    /// As [`Self::list`].
    pub async fn status_detail(&self) -> Result<StatusDetail, ServeError> {
        let payload = round_trip(&self.broker, self.timeout, STATUS_DETAIL.to_vec()).await?;
        Ok(unpack_status_detail(&payload)?)
    }
}

/// Status summary for a broker, for CLI and monitoring use. Never fails;
/// connection problems land in `error`.
#[derive(Debug, Clone)]
pub struct BrokerStatus {
    /// Whether the broker answered the discovery round trip.
    pub running: bool,
    /// The endpoint that was queried.
    pub broker: String,
    /// Models the broker reported (empty when unreachable).
    pub models: Vec<String>,
    /// The failure, when the broker could not be reached.
    pub error: Option<String>,
}

/// Query a broker's status without failing.
pub async fn broker_status(broker: &str) -> BrokerStatus {
    let models = Models::new().with_broker(broker);
    match models.list().await {
        Ok(names) => BrokerStatus {
            running: true,
            broker: broker.to_string(),
            models: names,
            error: None,
        },
        Err(e) => BrokerStatus {
            running: false,
            broker: broker.to_string(),
            models: Vec::new(),
            error: Some(e.to_string()),
        },
    }
}

/// One-shot round trip on a fresh DEALER socket: send `[empty, tag]`,
/// await the reply payload.
async fn round_trip(
    broker: &str,
    timeout: Duration,
    tag: Vec<u8>,
) -> Result<Vec<u8>, ServeError> {
    let context = Context::new();
    let mut socket = dealer::dealer(&context).set_linger(0).connect(broker)?;
    socket.send(multipart(vec![Vec::new(), tag])).await?;

    match tokio::time::timeout(timeout, socket.next()).await {
        Err(_) => Err(ServeError::Unreachable {
            endpoint: broker.to_string(),
        }),
        Ok(None) => Err(ServeError::Unreachable {
            endpoint: broker.to_string(),
        }),
        Ok(Some(Err(e))) => Err(e.into()),
        Ok(Some(Ok(msg))) => {
            let frames = frames_of(&msg);
            frames.last().cloned().ok_or_else(|| ServeError::Unreachable {
                endpoint: broker.to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_calculator_builder() {
        let calc = RemoteCalculator::new("lj")
            .with_broker("ipc:///tmp/x/broker.ipc")
            .with_timeout(Duration::from_secs(3));
        assert_eq!(calc.model(), "lj");
        assert_eq!(calc.broker, "ipc:///tmp/x/broker.ipc");
        assert_eq!(calc.timeout, Duration::from_secs(3));
        assert!(calc.socket.is_none());
    }

    #[test]
    fn test_remote_calculator_debug_omits_socket_internals() {
        let calc = RemoteCalculator::new("lj");
        let debug = format!("{calc:?}");
        assert!(debug.contains("lj"));
        assert!(debug.contains("connected: false"));
    }

    #[test]
    fn test_models_builder_defaults() {
        let models = Models::new();
        assert_eq!(models.timeout, DISCOVERY_TIMEOUT);
        let models = models.with_timeout(Duration::from_secs(1));
        assert_eq!(models.timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_model_handle_produces_bound_calculator() {
        let handle = ModelHandle {
            model: "lj".to_string(),
            broker: "ipc:///tmp/b/broker.ipc".to_string(),
        };
        let calc = handle.calculator();
        assert_eq!(calc.model(), "lj");
        assert_eq!(calc.broker, "ipc:///tmp/b/broker.ipc");
    }

    #[tokio::test]
    async fn test_broker_status_unreachable_reports_error() {
        // Point at an endpoint nothing is bound to; connect succeeds
        // (ZeroMQ connects lazily) but the round trip times out.
        let status = tokio::time::timeout(
            Duration::from_secs(10),
            broker_status("ipc:///tmp/mlip-serve-nonexistent/broker.ipc"),
        )
        .await
        .unwrap();
        assert!(!status.running);
        assert!(status.models.is_empty());
        assert!(status.error.is_some());
    }
}
