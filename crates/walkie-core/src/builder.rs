//! Builder for assembling a walkie agent

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::agent::Walkie;
use crate::audio::{AudioOutput, AudioSink};
use crate::config::WalkieConfig;
use crate::contacts::ContactBook;
use crate::controller::CallController;
use crate::error::{WalkieError, WalkieResult};
use crate::events::EventEmitter;
use crate::identity::IdentityStore;
use crate::mic::{AudioCapture, MicrophoneManager};
use crate::signaling::SignalingBroker;
use crate::storage::{KeyValueStore, MemoryStore};
use crate::supervisor::ConnectionSupervisor;
use crate::wake::{KeepAwake, WakeLock};

/// Builder for creating a [`Walkie`] from its platform collaborators
///
/// ```rust,no_run
/// use walkie_core::loopback::{LoopbackBroker, LoopbackCapture, LoopbackOutput, PermissionMode};
/// use walkie_core::{Walkie, WalkieConfig};
///
/// # async fn example() -> walkie_core::WalkieResult<()> {
/// let walkie = Walkie::builder()
///     .config(WalkieConfig::default().with_talk_on_incoming(false))
///     .broker(LoopbackBroker::new())
///     .capture(LoopbackCapture::new(PermissionMode::Grant))
///     .output(LoopbackOutput::new())
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct WalkieBuilder {
    config: WalkieConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    broker: Option<Arc<dyn SignalingBroker>>,
    capture: Option<Arc<dyn AudioCapture>>,
    output: Option<Arc<dyn AudioOutput>>,
    wake_lock: Option<Arc<dyn WakeLock>>,
}

impl WalkieBuilder {
    /// Create a new builder with default configuration
    pub fn new() -> Self {
        Self {
            config: WalkieConfig::default(),
            store: None,
            broker: None,
            capture: None,
            output: None,
            wake_lock: None,
        }
    }

    pub fn config(mut self, config: WalkieConfig) -> Self {
        self.config = config;
        self
    }

    /// Persistent storage; defaults to an in-memory store
    pub fn store(mut self, store: impl KeyValueStore + 'static) -> Self {
        self.store = Some(Arc::new(store));
        self
    }

    /// Signaling broker (required)
    pub fn broker(mut self, broker: impl SignalingBroker + 'static) -> Self {
        self.broker = Some(Arc::new(broker));
        self
    }

    /// Microphone access (required)
    pub fn capture(mut self, capture: impl AudioCapture + 'static) -> Self {
        self.capture = Some(Arc::new(capture));
        self
    }

    /// Remote audio playback (required)
    pub fn output(mut self, output: impl AudioOutput + 'static) -> Self {
        self.output = Some(Arc::new(output));
        self
    }

    /// Screen wake lock; ignored when `keep_awake` is off
    pub fn wake_lock(mut self, wake_lock: impl WakeLock + 'static) -> Self {
        self.wake_lock = Some(Arc::new(wake_lock));
        self
    }

    /// Assemble the agent and start registering with the broker
    pub async fn build(self) -> WalkieResult<Walkie> {
        let broker = self
            .broker
            .ok_or_else(|| WalkieError::config("a signaling broker is required"))?;
        let capture = self
            .capture
            .ok_or_else(|| WalkieError::config("an audio capture device is required"))?;
        let output = self
            .output
            .ok_or_else(|| WalkieError::config("an audio output is required"))?;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let config = self.config;

        let events = EventEmitter::new(config.event_capacity);
        let (inputs_tx, inputs_rx) = mpsc::unbounded_channel();

        let identity = IdentityStore::from_config(store.clone(), &config);
        let supervisor = ConnectionSupervisor::new(
            broker,
            identity,
            &config,
            inputs_tx.clone(),
            events.clone(),
        );

        let mic = Arc::new(MicrophoneManager::new(capture, config.capture.clone()));
        let keep_awake = if config.keep_awake {
            KeepAwake::new(self.wake_lock)
        } else {
            KeepAwake::disabled()
        };
        let controller = CallController::new(
            mic,
            AudioSink::new(output),
            keep_awake,
            config.talk_on_incoming,
            inputs_tx.clone(),
            events.clone(),
        );
        let contacts = ContactBook::load(store, config.contacts_key.clone());

        let mut walkie =
            Walkie::from_parts(supervisor, controller, contacts, events, inputs_tx, inputs_rx);
        walkie.mount()?;
        Ok(walkie)
    }
}

impl Default for WalkieBuilder {
    fn default() -> Self {
        Self::new()
    }
}
