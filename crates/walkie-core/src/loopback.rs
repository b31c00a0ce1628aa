//! In-process collaborators
//!
//! A complete set of platform bindings that never leave the process: a
//! signaling broker routing calls between endpoints registered on it, a
//! microphone with a scriptable permission prompt, a playback output that
//! honours an autoplay policy, and a wake lock. Two walkie agents on the same
//! [`LoopbackBroker`] can call each other, which is how the integration tests
//! and the `loopback_pair` example run.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::audio::{AudioOutput, PlaybackError};
use crate::error::{WalkieError, WalkieResult};
use crate::mic::{AudioCapture, CaptureConstraints, CaptureError, MicStream};
use crate::signaling::{
    CallEvent, CallHandle, Endpoint, EndpointEvent, MediaCall, PeerId, Registration, RemoteStream,
    SignalingBroker, SignalingErrorKind,
};
use crate::wake::WakeLock;

// ---------------------------------------------------------------------------
// Signaling
// ---------------------------------------------------------------------------

struct PeerSlot {
    id: PeerId,
    events: mpsc::UnboundedSender<EndpointEvent>,
    registered: AtomicBool,
    connected: AtomicBool,
    destroyed: AtomicBool,
    reconnects: AtomicUsize,
    failing_reconnects: AtomicUsize,
}

impl PeerSlot {
    fn emit(&self, event: EndpointEvent) {
        if self.events.send(event).is_err() {
            trace!(peer = %self.id, "Endpoint event dropped, receiver gone");
        }
    }

    fn is_reachable(&self) -> bool {
        self.registered.load(Ordering::SeqCst)
            && self.connected.load(Ordering::SeqCst)
            && !self.destroyed.load(Ordering::SeqCst)
    }
}

struct CallSide {
    peer: PeerId,
    events: mpsc::UnboundedSender<CallEvent>,
}

struct CallLink {
    caller: CallSide,
    callee: CallSide,
    offer: MicStream,
    closed: AtomicBool,
}

impl CallLink {
    fn involves(&self, peer: &PeerId) -> bool {
        &self.caller.peer == peer || &self.callee.peer == peer
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.caller.events.send(CallEvent::Close);
            let _ = self.callee.events.send(CallEvent::Close);
        }
    }

    fn fail(&self, reason: &str) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.caller.events.send(CallEvent::Error(reason.to_string()));
            let _ = self.callee.events.send(CallEvent::Error(reason.to_string()));
        }
    }
}

#[derive(Default)]
struct BrokerInner {
    peers: DashMap<PeerId, Arc<PeerSlot>>,
    calls: Mutex<Vec<Arc<CallLink>>>,
}

/// Signaling broker connecting endpoints within the process
#[derive(Clone, Default)]
pub struct LoopbackBroker {
    inner: Arc<BrokerInner>,
}

impl LoopbackBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is registered and its link is up
    pub fn is_connected(&self, id: &PeerId) -> bool {
        self.inner
            .peers
            .get(id)
            .map(|slot| slot.is_reachable())
            .unwrap_or(false)
    }

    /// Whether `id` is registered at all
    pub fn is_registered(&self, id: &PeerId) -> bool {
        self.inner.peers.contains_key(id)
    }

    /// Drop the signaling link of `id` as a network loss would
    pub fn drop_signaling(&self, id: &PeerId) {
        if let Some(slot) = self.inner.peers.get(id) {
            if slot.connected.swap(false, Ordering::SeqCst) {
                info!(peer = %id, "Loopback link dropped");
                slot.emit(EndpointEvent::Disconnected);
            }
        }
    }

    /// Make the next `count` reconnect attempts of `id` fail
    pub fn fail_reconnects(&self, id: &PeerId, count: usize) {
        if let Some(slot) = self.inner.peers.get(id) {
            slot.failing_reconnects.store(count, Ordering::SeqCst);
        }
    }

    /// Successful reconnects performed by `id`
    pub fn reconnect_count(&self, id: &PeerId) -> usize {
        self.inner
            .peers
            .get(id)
            .map(|slot| slot.reconnects.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Open calls `id` takes part in
    pub fn open_calls(&self, id: &PeerId) -> usize {
        self.inner
            .calls
            .lock()
            .iter()
            .filter(|link| link.is_open() && link.involves(id))
            .count()
    }

    /// Fail every open call of `id` with a transport error
    pub fn break_calls(&self, id: &PeerId, reason: &str) {
        for link in self.links_of(id) {
            link.fail(reason);
        }
    }

    fn links_of(&self, id: &PeerId) -> Vec<Arc<CallLink>> {
        let mut calls = self.inner.calls.lock();
        calls.retain(|link| link.is_open());
        calls.iter().filter(|link| link.involves(id)).cloned().collect()
    }

    fn reachable(&self, id: &PeerId) -> Option<Arc<PeerSlot>> {
        self.inner
            .peers
            .get(id)
            .filter(|slot| slot.is_reachable())
            .map(|slot| Arc::clone(slot.value()))
    }

    fn remove_slot(&self, slot: &Arc<PeerSlot>) {
        self.inner
            .peers
            .remove_if(&slot.id, |_, existing| Arc::ptr_eq(existing, slot));
    }
}

impl SignalingBroker for LoopbackBroker {
    fn register(&self, requested: Option<&PeerId>) -> WalkieResult<Registration> {
        let id = requested
            .cloned()
            .unwrap_or_else(|| PeerId::new(Uuid::new_v4().simple().to_string()));
        let (tx, rx) = mpsc::unbounded_channel();
        let slot = Arc::new(PeerSlot {
            id: id.clone(),
            events: tx,
            registered: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            reconnects: AtomicUsize::new(0),
            failing_reconnects: AtomicUsize::new(0),
        });

        match self.inner.peers.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                debug!(peer = %id, "Loopback id taken");
                slot.emit(EndpointEvent::Error(SignalingErrorKind::UnavailableId));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                slot.registered.store(true, Ordering::SeqCst);
                slot.connected.store(true, Ordering::SeqCst);
                entry.insert(slot.clone());
                debug!(peer = %id, "Loopback endpoint registered");
                slot.emit(EndpointEvent::Open(id));
            }
        }

        Ok(Registration {
            endpoint: Arc::new(LoopbackEndpoint {
                broker: self.clone(),
                slot,
            }),
            events: rx,
        })
    }
}

impl fmt::Debug for LoopbackBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackBroker")
            .field("peers", &self.inner.peers.len())
            .finish()
    }
}

/// Endpoint handed out by [`LoopbackBroker`]
pub struct LoopbackEndpoint {
    broker: LoopbackBroker,
    slot: Arc<PeerSlot>,
}

impl Endpoint for LoopbackEndpoint {
    fn call(&self, remote: &PeerId, local: &MicStream) -> WalkieResult<CallHandle> {
        if !self.slot.registered.load(Ordering::SeqCst)
            || self.slot.destroyed.load(Ordering::SeqCst)
        {
            return Err(WalkieError::NotRegistered);
        }
        if !self.slot.connected.load(Ordering::SeqCst) {
            return Err(WalkieError::disconnected("loopback link is down"));
        }

        let (caller_tx, caller_rx) = mpsc::unbounded_channel();
        let (callee_tx, callee_rx) = mpsc::unbounded_channel();
        let link = Arc::new(CallLink {
            caller: CallSide {
                peer: self.slot.id.clone(),
                events: caller_tx,
            },
            callee: CallSide {
                peer: remote.clone(),
                events: callee_tx,
            },
            offer: local.clone(),
            closed: AtomicBool::new(false),
        });

        match self.broker.reachable(remote) {
            Some(target) => {
                debug!(from = %self.slot.id, to = %remote, "Loopback call routed");
                self.broker.inner.calls.lock().push(link.clone());
                target.emit(EndpointEvent::Call(CallHandle {
                    call: Arc::new(LoopbackCall {
                        link: link.clone(),
                        remote: self.slot.id.clone(),
                        answerer: true,
                    }),
                    events: callee_rx,
                }));
            }
            None => {
                debug!(to = %remote, "Loopback peer unavailable");
                self.slot
                    .emit(EndpointEvent::Error(SignalingErrorKind::PeerUnavailable));
                link.fail(SignalingErrorKind::PeerUnavailable.code());
            }
        }

        Ok(CallHandle {
            call: Arc::new(LoopbackCall {
                link,
                remote: remote.clone(),
                answerer: false,
            }),
            events: caller_rx,
        })
    }

    fn disconnect(&self) {
        if self.slot.connected.swap(false, Ordering::SeqCst) {
            self.slot.emit(EndpointEvent::Disconnected);
        }
    }

    fn reconnect(&self) -> WalkieResult<()> {
        if self.slot.destroyed.load(Ordering::SeqCst)
            || !self.slot.registered.load(Ordering::SeqCst)
        {
            return Err(WalkieError::invalid_state("endpoint cannot reconnect"));
        }
        let failing = self.slot.failing_reconnects.load(Ordering::SeqCst);
        if failing > 0 {
            self.slot.failing_reconnects.store(failing - 1, Ordering::SeqCst);
            return Err(WalkieError::disconnected("loopback broker unreachable"));
        }
        self.slot.connected.store(true, Ordering::SeqCst);
        self.slot.reconnects.fetch_add(1, Ordering::SeqCst);
        self.slot.emit(EndpointEvent::Open(self.slot.id.clone()));
        Ok(())
    }

    fn destroy(&self) {
        if self.slot.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slot.connected.store(false, Ordering::SeqCst);
        if self.slot.registered.load(Ordering::SeqCst) {
            self.broker.remove_slot(&self.slot);
            for link in self.broker.links_of(&self.slot.id) {
                link.close();
            }
        }
        debug!(peer = %self.slot.id, "Loopback endpoint destroyed");
    }
}

impl fmt::Debug for LoopbackEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackEndpoint")
            .field("id", &self.slot.id)
            .field("connected", &self.slot.connected.load(Ordering::SeqCst))
            .finish()
    }
}

/// One side of a loopback call
pub struct LoopbackCall {
    link: Arc<CallLink>,
    remote: PeerId,
    answerer: bool,
}

impl MediaCall for LoopbackCall {
    fn peer(&self) -> &PeerId {
        &self.remote
    }

    fn answer(&self, local: &MicStream) -> WalkieResult<()> {
        if !self.answerer {
            return Err(WalkieError::invalid_state("outbound calls cannot be answered"));
        }
        if !self.link.is_open() {
            return Err(WalkieError::transport(self.remote.as_str(), "call already closed"));
        }
        let _ = self.link.caller.events.send(CallEvent::Stream(RemoteStream {
            id: local.id().to_string(),
            peer: self.link.callee.peer.clone(),
        }));
        let _ = self.link.callee.events.send(CallEvent::Stream(RemoteStream {
            id: self.link.offer.id().to_string(),
            peer: self.link.caller.peer.clone(),
        }));
        Ok(())
    }

    fn close(&self) {
        self.link.close();
    }
}

impl fmt::Debug for LoopbackCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackCall")
            .field("remote", &self.remote)
            .field("answerer", &self.answerer)
            .field("open", &self.link.is_open())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

/// How the loopback microphone answers permission requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionMode {
    Grant,
    Deny,
    /// Leave the prompt open until [`LoopbackCapture::grant`] or `deny`
    Prompt,
}

struct CaptureInner {
    mode: watch::Sender<PermissionMode>,
    requests: AtomicUsize,
}

/// Microphone with a scriptable permission prompt
#[derive(Clone)]
pub struct LoopbackCapture {
    inner: Arc<CaptureInner>,
}

impl LoopbackCapture {
    pub fn new(mode: PermissionMode) -> Self {
        let (mode, _) = watch::channel(mode);
        Self {
            inner: Arc::new(CaptureInner {
                mode,
                requests: AtomicUsize::new(0),
            }),
        }
    }

    pub fn set_mode(&self, mode: PermissionMode) {
        self.inner.mode.send_replace(mode);
    }

    pub fn grant(&self) {
        self.set_mode(PermissionMode::Grant);
    }

    pub fn deny(&self) {
        self.set_mode(PermissionMode::Deny);
    }

    pub fn request_count(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AudioCapture for LoopbackCapture {
    async fn request(&self, _constraints: &CaptureConstraints) -> Result<MicStream, CaptureError> {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let mut mode = self.inner.mode.subscribe();
        loop {
            let current = *mode.borrow_and_update();
            match current {
                PermissionMode::Grant => return Ok(MicStream::mono("loopback microphone")),
                PermissionMode::Deny => {
                    return Err(CaptureError::PermissionDenied(
                        "microphone access was denied".to_string(),
                    ))
                }
                PermissionMode::Prompt => {}
            }
            if mode.changed().await.is_err() {
                return Err(CaptureError::DeviceUnavailable("capture device went away".to_string()));
            }
        }
    }
}

impl fmt::Debug for LoopbackCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackCapture")
            .field("mode", &*self.inner.mode.borrow())
            .field("requests", &self.request_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Playback
// ---------------------------------------------------------------------------

#[derive(Default)]
struct OutputInner {
    source: Mutex<Option<RemoteStream>>,
    context_running: AtomicBool,
    playing: AtomicBool,
    play_attempts: AtomicUsize,
    resumes: AtomicUsize,
    fail_resume: AtomicBool,
    closed: AtomicBool,
}

/// Playback output that blocks audio until the context has been resumed
#[derive(Clone, Default)]
pub struct LoopbackOutput {
    inner: Arc<OutputInner>,
}

impl LoopbackOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(&self) -> Option<RemoteStream> {
        self.inner.source.lock().clone()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.playing.load(Ordering::SeqCst)
    }

    pub fn play_attempts(&self) -> usize {
        self.inner.play_attempts.load(Ordering::SeqCst)
    }

    /// Number of context resume requests, successful or not
    pub fn resume_count(&self) -> usize {
        self.inner.resumes.load(Ordering::SeqCst)
    }

    /// Make resume requests fail until called again with `false`
    pub fn fail_resume(&self, fail: bool) {
        self.inner.fail_resume.store(fail, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

impl AudioOutput for LoopbackOutput {
    fn set_source(&self, stream: Option<RemoteStream>) {
        *self.inner.source.lock() = stream;
        self.inner.playing.store(false, Ordering::SeqCst);
    }

    fn play(&self) -> Result<(), PlaybackError> {
        self.inner.play_attempts.fetch_add(1, Ordering::SeqCst);
        if self.inner.source.lock().is_none() {
            return Err(PlaybackError::Failed("no source attached".to_string()));
        }
        if !self.inner.context_running.load(Ordering::SeqCst) {
            return Err(PlaybackError::NotAllowed);
        }
        self.inner.playing.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume_context(&self) -> Result<(), PlaybackError> {
        self.inner.resumes.fetch_add(1, Ordering::SeqCst);
        if self.inner.fail_resume.load(Ordering::SeqCst) {
            return Err(PlaybackError::Failed("context refused to resume".to_string()));
        }
        self.inner.context_running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn close_context(&self) {
        self.inner.context_running.store(false, Ordering::SeqCst);
        self.inner.playing.store(false, Ordering::SeqCst);
        self.inner.closed.store(true, Ordering::SeqCst);
    }
}

impl fmt::Debug for LoopbackOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackOutput")
            .field("source", &self.source())
            .field("playing", &self.is_playing())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Wake lock
// ---------------------------------------------------------------------------

struct WakeInner {
    allow: bool,
    held: AtomicBool,
    requests: AtomicUsize,
}

/// Wake lock that grants or refuses every request
#[derive(Clone)]
pub struct LoopbackWakeLock {
    inner: Arc<WakeInner>,
}

impl LoopbackWakeLock {
    pub fn new(allow: bool) -> Self {
        Self {
            inner: Arc::new(WakeInner {
                allow,
                held: AtomicBool::new(false),
                requests: AtomicUsize::new(0),
            }),
        }
    }

    pub fn requests(&self) -> usize {
        self.inner.requests.load(Ordering::SeqCst)
    }

    pub fn is_held(&self) -> bool {
        self.inner.held.load(Ordering::SeqCst)
    }
}

impl WakeLock for LoopbackWakeLock {
    fn request(&self) -> Result<(), String> {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        if !self.inner.allow {
            return Err("wake lock not supported".to_string());
        }
        self.inner.held.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.inner.held.store(false, Ordering::SeqCst);
    }
}

impl fmt::Debug for LoopbackWakeLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopbackWakeLock")
            .field("held", &self.is_held())
            .field("requests", &self.requests())
            .finish()
    }
}
