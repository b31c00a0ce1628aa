//! The walkie agent
//!
//! [`Walkie`] owns every component and is the only place state changes.
//! Everything that happens, be it a user command, an endpoint event, a call
//! event, a finished microphone request or a finished reconnect, arrives as
//! an [`Input`] on one queue and is processed to completion before the next
//! one. Spawned tasks only wait; they never touch state.
//!
//! ```text
//!  WalkieHandle ──Command──┐
//!  endpoint events ────────┤
//!  call events ────────────┼──▶ input queue ──▶ Walkie::dispatch ──▶ WalkieEvent
//!  mic completions ────────┤                     (supervisor, controller,
//!  reconnect results ──────┘                      contacts)
//! ```
//!
//! Embedders either call [`Walkie::run`] (or [`Walkie::spawn`]) and talk to
//! it through a [`WalkieHandle`], or keep the agent on their own task, call
//! its methods directly and drive queued work with [`Walkie::settle`].

use std::fmt;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::builder::WalkieBuilder;
use crate::contacts::{Contact, ContactBook};
use crate::controller::{CallController, CallToken};
use crate::error::{WalkieError, WalkieResult};
use crate::events::{EventEmitter, EventIterator, EventStream, WalkieEvent};
use crate::mic::MicStream;
use crate::session::Session;
use crate::signaling::{CallEvent, EndpointEvent, PeerId, RemoteStream};
use crate::supervisor::{ConnectionState, ConnectionSupervisor};

/// Idle polls [`Walkie::settle`] makes before deciding the queue is drained
const SETTLE_IDLE_ROUNDS: usize = 32;

/// Everything the agent reacts to
#[derive(Debug)]
pub(crate) enum Input {
    Command(Command),
    Endpoint { generation: u64, event: EndpointEvent },
    Call { token: CallToken, event: CallEvent },
    MicReady { token: CallToken, result: WalkieResult<MicStream> },
    ReconnectFinished { generation: u64, result: WalkieResult<()> },
}

/// User intents accepted by a [`WalkieHandle`]
#[derive(Debug)]
pub enum Command {
    /// Call the given remote id, or toggle talk if already connected to it
    Connect(String),
    /// Call a saved contact by id
    ConnectContact(String),
    ToggleTalk,
    HangUp,
    /// Force the signaling link down and up again
    Reconnect,
    /// The app became visible again
    Foreground,
    /// First user interaction; unlocks audio playback
    UserGesture,
    SelectRemote(String),
    AddContact { name: String, remote_id: String },
    RemoveContact(String),
    Status(oneshot::Sender<WalkieStatus>),
    Shutdown,
}

/// Snapshot of the agent for presentation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalkieStatus {
    pub local_id: Option<PeerId>,
    pub connection: ConnectionState,
    pub session: Session,
    pub selected_remote: Option<PeerId>,
    pub mic_acquired: bool,
    pub mic_enabled: bool,
    pub audio_unlocked: bool,
    pub contacts: Vec<Contact>,
}

/// The walkie-talkie session core
pub struct Walkie {
    supervisor: ConnectionSupervisor,
    controller: CallController,
    contacts: ContactBook,
    events: EventEmitter,
    inputs_tx: mpsc::UnboundedSender<Input>,
    inputs_rx: mpsc::UnboundedReceiver<Input>,
    shut_down: bool,
}

impl Walkie {
    pub fn builder() -> WalkieBuilder {
        WalkieBuilder::new()
    }

    pub(crate) fn from_parts(
        supervisor: ConnectionSupervisor,
        controller: CallController,
        contacts: ContactBook,
        events: EventEmitter,
        inputs_tx: mpsc::UnboundedSender<Input>,
        inputs_rx: mpsc::UnboundedReceiver<Input>,
    ) -> Self {
        Self {
            supervisor,
            controller,
            contacts,
            events,
            inputs_tx,
            inputs_rx,
            shut_down: false,
        }
    }

    /// Begin registration with the broker
    pub(crate) fn mount(&mut self) -> WalkieResult<()> {
        info!("Mounting walkie core");
        self.supervisor.start()
    }

    /// Cloneable handle sending commands to this agent
    pub fn handle(&self) -> WalkieHandle {
        WalkieHandle {
            inputs: self.inputs_tx.clone(),
            events: self.events.clone(),
        }
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn subscribe_simple(&self) -> EventIterator {
        self.events.subscribe_simple()
    }

    pub fn events(&self) -> &EventEmitter {
        &self.events
    }

    // ---- queries -------------------------------------------------------

    pub fn session(&self) -> &Session {
        self.controller.session()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.supervisor.state()
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.supervisor.local_id()
    }

    pub fn contacts(&self) -> &[Contact] {
        self.contacts.list()
    }

    pub fn has_call(&self) -> bool {
        self.controller.has_call()
    }

    pub fn current_peer(&self) -> Option<&PeerId> {
        self.controller.current_peer()
    }

    /// Whether the microphone tracks are audible to the peer
    pub fn is_mic_enabled(&self) -> bool {
        self.controller.mic().is_enabled()
    }

    /// Platform capture requests issued so far
    pub fn mic_request_count(&self) -> usize {
        self.controller.mic().request_count()
    }

    /// Remote stream attached to the audio output
    pub fn remote_audio(&self) -> Option<RemoteStream> {
        self.controller.sink().bound()
    }

    pub fn is_keeping_awake(&self) -> bool {
        self.controller.is_keeping_awake()
    }

    pub fn status(&self) -> WalkieStatus {
        let mic = self.controller.mic();
        WalkieStatus {
            local_id: self.supervisor.local_id().cloned(),
            connection: self.supervisor.state(),
            session: self.controller.session().clone(),
            selected_remote: self.controller.selected_remote().cloned(),
            mic_acquired: mic.is_acquired(),
            mic_enabled: mic.is_enabled(),
            audio_unlocked: self.controller.sink().is_unlocked(),
            contacts: self.contacts.list().to_vec(),
        }
    }

    // ---- user intents --------------------------------------------------

    /// Connect to `remote`, or toggle talk if that call is already up
    pub fn start_or_reuse_call(&mut self, remote: &str) -> WalkieResult<()> {
        self.controller.start_or_reuse_call(remote)
    }

    /// Call a saved contact
    pub fn connect_contact(&mut self, remote_id: &str) -> WalkieResult<()> {
        let contact = PeerId::parse(remote_id)
            .and_then(|id| self.contacts.find(&id).cloned())
            .ok_or_else(|| {
                WalkieError::invalid_state(format!("no contact with id {:?}", remote_id.trim()))
            })?;
        debug!(name = %contact.name, peer = %contact.remote_id, "Calling contact");
        self.controller.start_or_reuse_call(contact.remote_id.as_str())
    }

    pub fn toggle_talk(&mut self) -> WalkieResult<()> {
        self.controller.toggle_talk()
    }

    pub fn hang_up(&mut self) {
        self.controller.end_call();
    }

    pub fn select_remote(&mut self, remote: &str) {
        self.controller.select_remote(remote);
    }

    pub fn reconnect(&mut self) -> WalkieResult<()> {
        self.supervisor.reconnect_now()
    }

    /// The app became visible: resume audio and heal the signaling link
    pub fn on_foreground(&mut self) {
        self.controller.on_user_gesture();
        self.supervisor.on_foreground();
    }

    pub fn on_user_gesture(&mut self) -> bool {
        self.controller.on_user_gesture()
    }

    /// Add a contact or rename the one with the same id
    pub fn add_contact(&mut self, name: &str, remote_id: &str) -> WalkieResult<bool> {
        let changed = self.contacts.add(name, remote_id)?;
        if changed {
            self.contacts_changed();
        }
        Ok(changed)
    }

    pub fn remove_contact(&mut self, remote_id: &str) -> WalkieResult<bool> {
        let Some(remote_id) = PeerId::parse(remote_id) else {
            return Ok(false);
        };
        let removed = self.contacts.remove(&remote_id)?;
        if removed {
            self.contacts_changed();
        }
        Ok(removed)
    }

    fn contacts_changed(&self) {
        self.events.emit(WalkieEvent::ContactsChanged {
            contacts: self.contacts.list().to_vec(),
        });
    }

    /// Release the endpoint, the call, the microphone and the audio output
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        info!("Shutting down walkie core");
        self.controller.shutdown();
        self.supervisor.destroy();
        self.shut_down = true;
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    // ---- input processing ----------------------------------------------

    pub(crate) fn dispatch(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.execute(command),
            Input::Endpoint { generation, event } => self.on_endpoint_event(generation, event),
            Input::Call { token, event } => self.controller.on_call_event(token, event),
            Input::MicReady { token, result } => {
                let endpoint = self.supervisor.endpoint().cloned();
                if let Err(e) = self.controller.on_mic_ready(token, result, endpoint.as_ref()) {
                    report(&e);
                }
            }
            Input::ReconnectFinished { generation, result } => {
                self.supervisor.on_reconnect_finished(generation, result)
            }
        }
    }

    fn on_endpoint_event(&mut self, generation: u64, event: EndpointEvent) {
        if !self.supervisor.is_current(generation) {
            debug!(generation, event = ?event, "Dropping event from replaced endpoint");
            if let EndpointEvent::Call(handle) = event {
                handle.call.close();
            }
            return;
        }
        match event {
            EndpointEvent::Open(id) => self.supervisor.on_open(id),
            EndpointEvent::Error(kind) => {
                if let Err(e) = self.supervisor.on_error(kind) {
                    report(&e);
                }
            }
            EndpointEvent::Disconnected => self.supervisor.on_disconnected(),
            EndpointEvent::Call(handle) => self.controller.handle_incoming(handle),
        }
    }

    fn execute(&mut self, command: Command) {
        debug!(command = ?command, "Executing command");
        let result = match command {
            Command::Connect(remote) => self.start_or_reuse_call(&remote),
            Command::ConnectContact(remote_id) => self.connect_contact(&remote_id),
            Command::ToggleTalk => self.toggle_talk(),
            Command::HangUp => {
                self.hang_up();
                Ok(())
            }
            Command::Reconnect => self.reconnect(),
            Command::Foreground => {
                self.on_foreground();
                Ok(())
            }
            Command::UserGesture => {
                self.on_user_gesture();
                Ok(())
            }
            Command::SelectRemote(remote) => {
                self.select_remote(&remote);
                Ok(())
            }
            Command::AddContact { name, remote_id } => {
                self.add_contact(&name, &remote_id).map(|_| ())
            }
            Command::RemoveContact(remote_id) => self.remove_contact(&remote_id).map(|_| ()),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
                Ok(())
            }
            Command::Shutdown => {
                self.shutdown();
                Ok(())
            }
        };
        if let Err(e) = result {
            report(&e);
        }
    }

    /// Process queued inputs until the queue stays empty
    ///
    /// Spawned work (microphone prompts, reconnect backoff) that is still
    /// waiting is left running; call again once it can have finished.
    pub async fn settle(&mut self) {
        let mut idle_rounds = 0;
        while idle_rounds < SETTLE_IDLE_ROUNDS {
            match self.inputs_rx.try_recv() {
                Ok(input) => {
                    self.dispatch(input);
                    idle_rounds = 0;
                }
                Err(_) => {
                    idle_rounds += 1;
                    tokio::task::yield_now().await;
                }
            }
        }
    }

    /// Process inputs until a shutdown command arrives
    pub async fn run(mut self) {
        while let Some(input) = self.inputs_rx.recv().await {
            let stop = matches!(input, Input::Command(Command::Shutdown));
            self.dispatch(input);
            if stop {
                break;
            }
        }
        self.shutdown();
        info!("Walkie agent stopped");
    }

    /// Run the agent on its own task
    pub fn spawn(self) -> (WalkieHandle, JoinHandle<()>) {
        let handle = self.handle();
        let task = tokio::spawn(self.run());
        (handle, task)
    }
}

impl Drop for Walkie {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Walkie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Walkie")
            .field("supervisor", &self.supervisor)
            .field("controller", &self.controller)
            .field("contacts", &self.contacts.len())
            .field("shut_down", &self.shut_down)
            .finish()
    }
}

fn report(error: &WalkieError) {
    match error {
        WalkieError::StaleCompletion { token } => debug!(token, "Stale completion discarded"),
        e if e.is_user_visible() => info!(error = %e, "Reported to user"),
        e => warn!(error = %e, category = e.category(), "Operation failed"),
    }
}

/// Sends commands to a running [`Walkie`]
#[derive(Clone)]
pub struct WalkieHandle {
    inputs: mpsc::UnboundedSender<Input>,
    events: EventEmitter,
}

impl WalkieHandle {
    pub fn send(&self, command: Command) -> WalkieResult<()> {
        self.inputs
            .send(Input::Command(command))
            .map_err(|_| WalkieError::internal("walkie agent stopped"))
    }

    pub fn connect(&self, remote: impl Into<String>) -> WalkieResult<()> {
        self.send(Command::Connect(remote.into()))
    }

    pub fn connect_contact(&self, remote_id: impl Into<String>) -> WalkieResult<()> {
        self.send(Command::ConnectContact(remote_id.into()))
    }

    pub fn toggle_talk(&self) -> WalkieResult<()> {
        self.send(Command::ToggleTalk)
    }

    pub fn hang_up(&self) -> WalkieResult<()> {
        self.send(Command::HangUp)
    }

    pub fn reconnect(&self) -> WalkieResult<()> {
        self.send(Command::Reconnect)
    }

    pub fn foreground(&self) -> WalkieResult<()> {
        self.send(Command::Foreground)
    }

    pub fn user_gesture(&self) -> WalkieResult<()> {
        self.send(Command::UserGesture)
    }

    pub fn add_contact(
        &self,
        name: impl Into<String>,
        remote_id: impl Into<String>,
    ) -> WalkieResult<()> {
        self.send(Command::AddContact {
            name: name.into(),
            remote_id: remote_id.into(),
        })
    }

    pub fn remove_contact(&self, remote_id: impl Into<String>) -> WalkieResult<()> {
        self.send(Command::RemoveContact(remote_id.into()))
    }

    pub fn shutdown(&self) -> WalkieResult<()> {
        self.send(Command::Shutdown)
    }

    /// Ask the agent for a status snapshot
    pub async fn status(&self) -> WalkieResult<WalkieStatus> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Status(tx))?;
        rx.await
            .map_err(|_| WalkieError::internal("walkie agent stopped"))
    }

    pub fn subscribe(&self) -> EventStream {
        self.events.subscribe()
    }

    pub fn subscribe_simple(&self) -> EventIterator {
        self.events.subscribe_simple()
    }
}

impl fmt::Debug for WalkieHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalkieHandle")
            .field("closed", &self.inputs.is_closed())
            .finish()
    }
}
