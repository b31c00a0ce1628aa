//! Signaling connection supervision
//!
//! The [`ConnectionSupervisor`] owns the local endpoint's presence on the
//! signaling broker: the first registration, the one-shot recovery from an
//! identifier collision, and reconnection after the link drops.
//!
//! ```text
//!  Unregistered ──start──▶ Registering ──Open──▶ Registered
//!                              │  ▲                  │
//!               unavailable-id │  │ suffixed id      │ Disconnected
//!                 (first time) └──┘                  ▼
//!                              │               Disconnected ──reconnect──▶ Registering
//!               unavailable-id │
//!                (again)       ▼
//!                            Failed ──manual reconnect──▶ Registering
//! ```
//!
//! Every registration gets a new generation number. Endpoint events are
//! tagged with the generation they came from so the agent can drop events
//! from an endpoint that has since been replaced.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::agent::Input;
use crate::config::WalkieConfig;
use crate::error::{WalkieError, WalkieResult};
use crate::events::{EventEmitter, WalkieEvent};
use crate::identity::{suffixed_id, IdentityStore};
use crate::recovery::{retry_sync_with_backoff, RetryConfig};
use crate::signaling::{Endpoint, PeerId, Registration, SignalingBroker, SignalingErrorKind};

/// State of the signaling link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Nothing registered yet
    Unregistered,
    /// Registration requested, waiting for the broker
    Registering,
    /// Reachable under the local identifier
    Registered,
    /// The link dropped; calls in progress may survive
    Disconnected,
    /// Registration gave up; only a manual reconnect retries
    Failed,
    /// The endpoint was torn down
    Destroyed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Unregistered => write!(f, "Unregistered"),
            ConnectionState::Registering => write!(f, "Registering"),
            ConnectionState::Registered => write!(f, "Registered"),
            ConnectionState::Disconnected => write!(f, "Disconnected"),
            ConnectionState::Failed => write!(f, "Failed"),
            ConnectionState::Destroyed => write!(f, "Destroyed"),
        }
    }
}

/// Keeps the local endpoint registered
pub struct ConnectionSupervisor {
    broker: Arc<dyn SignalingBroker>,
    identity: IdentityStore,
    generate_local_id: bool,
    suffix_len: usize,
    retry: RetryConfig,
    endpoint: Option<Arc<dyn Endpoint>>,
    state: ConnectionState,
    requested: Option<PeerId>,
    local_id: Option<PeerId>,
    generation: u64,
    collision_retried: bool,
    reconnect_in_flight: bool,
    manual_reconnect: bool,
    inputs: mpsc::UnboundedSender<Input>,
    events: EventEmitter,
}

impl ConnectionSupervisor {
    pub(crate) fn new(
        broker: Arc<dyn SignalingBroker>,
        identity: IdentityStore,
        config: &WalkieConfig,
        inputs: mpsc::UnboundedSender<Input>,
        events: EventEmitter,
    ) -> Self {
        Self {
            broker,
            identity,
            generate_local_id: config.generate_local_id,
            suffix_len: config.collision_suffix_len,
            retry: config.reconnect.to_retry_config(),
            endpoint: None,
            state: ConnectionState::Unregistered,
            requested: None,
            local_id: None,
            generation: 0,
            collision_retried: false,
            reconnect_in_flight: false,
            manual_reconnect: false,
            inputs,
            events,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Identifier confirmed by the broker, if registered at least once
    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn endpoint(&self) -> Option<&Arc<dyn Endpoint>> {
        self.endpoint.as_ref()
    }

    /// Whether events tagged with `generation` come from the live endpoint
    pub fn is_current(&self, generation: u64) -> bool {
        generation == self.generation && self.state != ConnectionState::Destroyed
    }

    /// Register with the stored identifier, creating one first if configured
    pub fn start(&mut self) -> WalkieResult<()> {
        let requested = if self.generate_local_id {
            Some(self.identity.get_or_create_id()?)
        } else {
            self.identity.stored_id()?
        };
        self.register(requested)
    }

    fn register(&mut self, requested: Option<PeerId>) -> WalkieResult<()> {
        let Registration { endpoint, mut events } = match self.broker.register(requested.as_ref()) {
            Ok(registration) => registration,
            Err(e) => {
                error!(error = %e, "Broker refused registration");
                self.set_state(ConnectionState::Failed);
                return Err(e);
            }
        };

        self.generation += 1;
        let generation = self.generation;
        info!(
            requested = requested.as_ref().map(PeerId::as_str).unwrap_or("<broker-assigned>"),
            generation,
            "Registering endpoint"
        );
        self.endpoint = Some(endpoint);
        self.requested = requested;
        self.local_id = None;
        self.reconnect_in_flight = false;
        self.set_state(ConnectionState::Registering);

        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inputs.send(Input::Endpoint { generation, event }).is_err() {
                    break;
                }
            }
            debug!(generation, "Endpoint event stream ended");
        });
        Ok(())
    }

    /// The broker confirmed the registration
    pub fn on_open(&mut self, id: PeerId) {
        info!(local_id = %id, "Endpoint registered");
        self.manual_reconnect = false;
        self.local_id = Some(id.clone());
        self.set_state(ConnectionState::Registered);

        match self.identity.stored_id() {
            Ok(Some(stored)) if stored == id => {}
            _ => {
                if let Err(e) = self.identity.replace_id(&id) {
                    warn!(error = %e, "Could not persist local identity");
                }
            }
        }
        self.events.emit(WalkieEvent::Registered { local_id: id });
    }

    /// The broker reported an error
    pub fn on_error(&mut self, kind: SignalingErrorKind) -> WalkieResult<()> {
        match kind {
            SignalingErrorKind::UnavailableId => self.recover_collision(),
            kind if kind.is_transient() => {
                warn!(code = %kind, "Transient signaling error");
                if self.state == ConnectionState::Registered {
                    self.set_state(ConnectionState::Disconnected);
                }
                self.schedule_reconnect();
                Ok(())
            }
            kind => {
                warn!(code = %kind, "Signaling error");
                self.events.emit(WalkieEvent::SignalingError { kind });
                Ok(())
            }
        }
    }

    fn recover_collision(&mut self) -> WalkieResult<()> {
        let base = match self.requested.clone() {
            Some(base) if !self.collision_retried => base,
            requested => {
                let requested = requested.map(|id| id.to_string()).unwrap_or_default();
                error!(requested = %requested, "Identifier still taken, giving up");
                self.fail(SignalingErrorKind::UnavailableId);
                return Err(WalkieError::IdentifierCollision { requested });
            }
        };

        let replacement = suffixed_id(&base, self.suffix_len);
        warn!(
            previous = %base,
            replacement = %replacement,
            "Identifier taken, retrying with suffix"
        );
        self.identity.replace_id(&replacement)?;
        self.collision_retried = true;
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        self.events.emit(WalkieEvent::IdentityReplaced {
            previous: base,
            replacement: replacement.clone(),
        });
        self.register(Some(replacement))
    }

    fn fail(&mut self, kind: SignalingErrorKind) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.destroy();
        }
        self.set_state(ConnectionState::Failed);
        self.events.emit(WalkieEvent::RegistrationFailed { kind });
    }

    /// The signaling link dropped
    pub fn on_disconnected(&mut self) {
        if self.state == ConnectionState::Destroyed {
            return;
        }
        warn!(
            local_id = self.local_id.as_ref().map(PeerId::as_str).unwrap_or("<none>"),
            "Signaling link lost"
        );
        self.set_state(ConnectionState::Disconnected);
        if std::mem::take(&mut self.manual_reconnect) {
            debug!("Disconnect was part of a manual reconnect");
            return;
        }
        self.schedule_reconnect();
    }

    /// Start a background reconnect unless one is already running
    fn schedule_reconnect(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            debug!("No endpoint to reconnect");
            return;
        };
        if self.reconnect_in_flight {
            debug!("Reconnect already in flight");
            return;
        }
        self.reconnect_in_flight = true;

        let generation = self.generation;
        let retry = self.retry.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = retry_sync_with_backoff("reconnect", retry, || endpoint.reconnect()).await;
            let _ = inputs.send(Input::ReconnectFinished { generation, result });
        });
    }

    /// A background reconnect finished
    pub fn on_reconnect_finished(&mut self, generation: u64, result: WalkieResult<()>) {
        if generation != self.generation {
            debug!(
                generation,
                current = self.generation,
                "Ignoring reconnect result of replaced endpoint"
            );
            return;
        }
        self.reconnect_in_flight = false;
        match result {
            Ok(()) => debug!("Reconnect accepted by broker"),
            Err(e) => warn!(error = %e, "Reconnect failed, waiting for the next trigger"),
        }
    }

    /// The app returned to the foreground
    pub fn on_foreground(&mut self) {
        match self.state {
            ConnectionState::Disconnected => {
                info!("Foregrounded while disconnected, reconnecting");
                self.schedule_reconnect();
            }
            state => debug!(state = %state, "Foregrounded"),
        }
    }

    /// Force the signaling link down and up again
    ///
    /// With no endpoint (registration failed earlier) this registers afresh.
    pub fn reconnect_now(&mut self) -> WalkieResult<()> {
        if self.state == ConnectionState::Destroyed {
            return Err(WalkieError::invalid_state("endpoint destroyed"));
        }
        let Some(endpoint) = self.endpoint.clone() else {
            info!("No endpoint, registering again");
            self.collision_retried = false;
            return self.start();
        };

        info!("Manual reconnect");
        self.manual_reconnect = true;
        endpoint.disconnect();
        self.set_state(ConnectionState::Registering);
        if let Err(e) = endpoint.reconnect() {
            warn!(error = %e, "Manual reconnect failed");
            self.manual_reconnect = false;
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }
        Ok(())
    }

    /// Tear the endpoint down; later events from it are ignored
    pub fn destroy(&mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            info!("Destroying endpoint");
            endpoint.destroy();
        }
        self.generation += 1;
        self.set_state(ConnectionState::Destroyed);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        debug!(from = %self.state, to = %state, "Connection state changed");
        let previous = std::mem::replace(&mut self.state, state);
        self.events.emit(WalkieEvent::ConnectionChanged {
            previous,
            current: state,
        });
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("state", &self.state)
            .field("local_id", &self.local_id)
            .field("generation", &self.generation)
            .field("collision_retried", &self.collision_retried)
            .field("reconnect_in_flight", &self.reconnect_in_flight)
            .finish()
    }
}
