//! Call lifecycle control
//!
//! The [`CallController`] turns user intents (connect, talk, hang up) and
//! transport callbacks (incoming call, remote stream, close, error) into
//! [`Session`] transitions and carries out their effects in a fixed order:
//!
//! 1. close the call being replaced
//! 2. answer or install the new call object
//! 3. commit the session record
//! 4. set the microphone tracks
//!
//! Work that has to wait (microphone acquisition) runs in a spawned task and
//! reports back through the agent's input queue tagged with a [`CallToken`].
//! Only the completion whose token matches the pending request is acted on;
//! anything else was superseded and is dropped.

use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::agent::Input;
use crate::audio::AudioSink;
use crate::error::{WalkieError, WalkieResult};
use crate::events::{EndReason, EventEmitter, SessionStatusInfo, WalkieEvent};
use crate::mic::{MicStream, MicrophoneManager};
use crate::session::{Phase, Session, SessionEvent, Transition};
use crate::signaling::{CallEvent, CallHandle, Endpoint, MediaCall, PeerId};
use crate::wake::KeepAwake;

/// Correlates an asynchronous completion with the request that started it
pub type CallToken = u64;

/// A call request waiting for the microphone
enum Pending {
    /// Inbound call to answer
    Answer {
        token: CallToken,
        call: Arc<dyn MediaCall>,
    },
    /// Outbound call to place
    Dial { token: CallToken, remote: PeerId },
}

impl Pending {
    fn token(&self) -> CallToken {
        match self {
            Pending::Answer { token, .. } | Pending::Dial { token, .. } => *token,
        }
    }
}

struct ActiveCall {
    token: CallToken,
    call: Arc<dyn MediaCall>,
}

/// Drives the session state machine
pub struct CallController {
    session: Session,
    current: Option<ActiveCall>,
    pending: Option<Pending>,
    next_token: CallToken,
    selected: Option<PeerId>,
    talk_on_incoming: bool,
    mic: Arc<MicrophoneManager>,
    sink: AudioSink,
    keep_awake: KeepAwake,
    inputs: mpsc::UnboundedSender<Input>,
    events: EventEmitter,
}

impl CallController {
    pub(crate) fn new(
        mic: Arc<MicrophoneManager>,
        sink: AudioSink,
        keep_awake: KeepAwake,
        talk_on_incoming: bool,
        inputs: mpsc::UnboundedSender<Input>,
        events: EventEmitter,
    ) -> Self {
        Self {
            session: Session::idle(),
            current: None,
            pending: None,
            next_token: 0,
            selected: None,
            talk_on_incoming,
            mic,
            sink,
            keep_awake,
            inputs,
            events,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Remote id the talk button dials when no call is active
    pub fn selected_remote(&self) -> Option<&PeerId> {
        self.selected.as_ref()
    }

    pub fn has_call(&self) -> bool {
        self.current.is_some()
    }

    /// Peer of the live call object, if any
    pub fn current_peer(&self) -> Option<&PeerId> {
        self.current.as_ref().map(|active| active.call.peer())
    }

    pub fn mic(&self) -> &MicrophoneManager {
        &self.mic
    }

    pub fn sink(&self) -> &AudioSink {
        &self.sink
    }

    pub fn is_keeping_awake(&self) -> bool {
        self.keep_awake.is_held()
    }

    pub fn select_remote(&mut self, input: &str) {
        self.selected = PeerId::parse(input);
        debug!(remote = ?self.selected.as_ref().map(PeerId::as_str), "Remote selected");
    }

    /// Unlock audio playback after a user gesture or on foreground
    pub fn on_user_gesture(&mut self) -> bool {
        self.sink.unlock()
    }

    /// Accept an inbound call; it is answered once the microphone is ready
    pub fn handle_incoming(&mut self, handle: CallHandle) {
        let CallHandle { call, events } = handle;
        let peer = call.peer().clone();
        info!(peer = %peer, "Incoming call");
        self.sink.unlock();

        if let Some(previous) = self.pending.take() {
            self.drop_pending(previous, "superseded by a newer incoming call");
        }
        self.end_stranded_attempt(EndReason::Superseded);
        let token = self.issue_token();
        self.forward_call_events(token, events);
        self.pending = Some(Pending::Answer { token, call });
        self.events.emit(WalkieEvent::IncomingCall { peer });
        self.acquire_mic(token);
    }

    /// Connect to `input`, or toggle talk if already connected to it
    pub fn start_or_reuse_call(&mut self, input: &str) -> WalkieResult<()> {
        let Some(remote) = PeerId::parse(input) else {
            let err = WalkieError::MissingRemoteId;
            self.alert(&err);
            return Err(err);
        };
        self.sink.unlock();
        self.selected = Some(remote.clone());

        if self.current_peer() == Some(&remote) {
            return self.toggle_active();
        }
        if let Some(Pending::Dial { remote: dialing, .. }) = &self.pending {
            if dialing == &remote {
                debug!(peer = %remote, "Already dialing");
                return Ok(());
            }
        }
        if let Some(previous) = self.pending.take() {
            self.drop_pending(previous, "replaced by an outbound call");
        }

        let previous = self.current_peer().cloned();
        let Some(transition) = self.begin(&SessionEvent::Dial { remote: remote.clone() }) else {
            return Err(WalkieError::invalid_state("cannot dial in the current phase"));
        };
        if let Some(previous) = previous {
            info!(from = %previous, to = %remote, "Switching call");
            self.events.emit(WalkieEvent::CallTakenOver {
                previous,
                next: remote.clone(),
            });
        }

        let token = self.issue_token();
        self.pending = Some(Pending::Dial {
            token,
            remote: remote.clone(),
        });
        info!(peer = %remote, token, "Dialing");
        self.commit(transition);
        self.acquire_mic(token);
        Ok(())
    }

    /// Flip talk/mute; with no call, dial the selected remote
    pub fn toggle_talk(&mut self) -> WalkieResult<()> {
        match self.session.phase {
            Phase::Active => self.toggle_active(),
            Phase::Connecting => {
                debug!("Talk toggle ignored while connecting");
                Ok(())
            }
            Phase::Idle => match self.selected.clone() {
                Some(remote) => self.start_or_reuse_call(remote.as_str()),
                None => {
                    let err = WalkieError::MissingRemoteId;
                    self.alert(&err);
                    Err(err)
                }
            },
        }
    }

    fn toggle_active(&mut self) -> WalkieResult<()> {
        if self.step(SessionEvent::ToggleTalk) {
            info!(talking = self.session.talking, "Talk toggled");
            Ok(())
        } else {
            Err(WalkieError::invalid_state("no active call"))
        }
    }

    /// Local hang-up: drop pending requests, close the call, go idle
    pub fn end_call(&mut self) {
        self.hang_up(EndReason::LocalHangup);
    }

    fn hang_up(&mut self, reason: EndReason) {
        if let Some(pending) = self.pending.take() {
            self.drop_pending(pending, "hang-up");
        }
        let closed = self.close_current();
        let peer = closed.or_else(|| self.session.remote_id.clone());
        let was_idle = self.session.is_idle();
        self.step(SessionEvent::Ended);
        if !was_idle {
            info!(peer = ?peer.as_ref().map(PeerId::as_str), reason = %reason, "Call ended");
            self.events.emit(WalkieEvent::CallEnded { peer, reason });
        }
    }

    /// A microphone request finished
    ///
    /// Returns [`WalkieError::StaleCompletion`] when the request was
    /// superseded; nothing changes in that case.
    pub fn on_mic_ready(
        &mut self,
        token: CallToken,
        result: WalkieResult<MicStream>,
        endpoint: Option<&Arc<dyn Endpoint>>,
    ) -> WalkieResult<()> {
        let pending = match self.pending.take() {
            Some(pending) if pending.token() == token => pending,
            other => {
                self.pending = other;
                debug!(token, "Discarding stale microphone completion");
                return Err(WalkieError::StaleCompletion { token });
            }
        };

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                warn!(token, error = %e, "Microphone unavailable");
                if let Pending::Answer { call, .. } = &pending {
                    call.close();
                }
                self.step(SessionEvent::MicDenied);
                self.alert(&e);
                return Err(e);
            }
        };

        match pending {
            Pending::Answer { token, call } => self.answer(token, call, stream),
            Pending::Dial { token, remote } => self.place(token, remote, stream, endpoint),
        }
    }

    fn answer(
        &mut self,
        token: CallToken,
        call: Arc<dyn MediaCall>,
        stream: MicStream,
    ) -> WalkieResult<()> {
        let remote = call.peer().clone();
        let previous = self.current_peer().cloned();
        let event = SessionEvent::Answered {
            remote: remote.clone(),
            talk: self.talk_on_incoming,
        };
        let Some(transition) = self.begin(&event) else {
            call.close();
            return Err(WalkieError::invalid_state("cannot answer in the current phase"));
        };

        let replaced = previous.filter(|_| transition.closes_call());
        if let Err(e) = call.answer(&stream) {
            warn!(peer = %remote, error = %e, "Answer failed");
            call.close();
            if let Some(replaced) = replaced {
                self.events.emit(WalkieEvent::CallEnded {
                    peer: Some(replaced),
                    reason: EndReason::Superseded,
                });
            }
            self.step(SessionEvent::Ended);
            self.events.emit(WalkieEvent::CallEnded {
                peer: Some(remote),
                reason: EndReason::TransportError(e.to_string()),
            });
            return Err(e);
        }

        if let Some(previous) = replaced {
            info!(from = %previous, to = %remote, "Incoming call took over");
            self.events.emit(WalkieEvent::CallTakenOver {
                previous,
                next: remote.clone(),
            });
        }
        self.current = Some(ActiveCall { token, call });
        info!(peer = %remote, talking = self.talk_on_incoming, "Answered call");
        self.commit(transition);
        Ok(())
    }

    fn place(
        &mut self,
        token: CallToken,
        remote: PeerId,
        stream: MicStream,
        endpoint: Option<&Arc<dyn Endpoint>>,
    ) -> WalkieResult<()> {
        let placed = match endpoint {
            Some(endpoint) => endpoint.call(&remote, &stream),
            None => Err(WalkieError::NotRegistered),
        };
        let handle = match placed {
            Ok(handle) => handle,
            Err(e) => {
                warn!(peer = %remote, error = %e, "Could not place call");
                self.step(SessionEvent::Ended);
                self.events.emit(WalkieEvent::CallEnded {
                    peer: Some(remote),
                    reason: EndReason::TransportError(e.to_string()),
                });
                return Err(e);
            }
        };

        let Some(transition) = self.begin(&SessionEvent::Placed { remote: remote.clone() }) else {
            handle.call.close();
            return Err(WalkieError::invalid_state("call placed outside of Connecting"));
        };
        let CallHandle { call, events } = handle;
        self.forward_call_events(token, events);
        self.current = Some(ActiveCall { token, call });
        info!(peer = %remote, token, "Call placed");
        self.commit(transition);
        Ok(())
    }

    /// An event from a call object
    pub fn on_call_event(&mut self, token: CallToken, event: CallEvent) {
        let is_current = self.current.as_ref().is_some_and(|active| active.token == token);
        let is_pending = self.pending.as_ref().is_some_and(|pending| pending.token() == token);

        match event {
            CallEvent::Stream(stream) if is_current => {
                info!(peer = %stream.peer, stream = %stream.id, "Remote audio arrived");
                self.sink.bind(stream.clone());
                self.events.emit(WalkieEvent::RemoteAudio { stream });
            }
            CallEvent::Close if is_current => self.remote_ended(EndReason::RemoteClosed),
            CallEvent::Error(reason) if is_current => {
                warn!(token, reason = %reason, "Call transport error");
                self.remote_ended(EndReason::TransportError(reason));
            }
            CallEvent::Close | CallEvent::Error(_) if is_pending => {
                debug!(token, "Pending incoming call went away before answer");
                self.pending = None;
                self.end_stranded_attempt(EndReason::RemoteClosed);
            }
            event => debug!(token, event = ?event, "Ignoring event from a replaced call"),
        }
    }

    /// Return to Idle from a Connecting phase nothing is working towards
    ///
    /// Connecting is only valid while a dial waits for the microphone. Once
    /// that request is gone and no call object exists, the attempt is over.
    fn end_stranded_attempt(&mut self, reason: EndReason) {
        let stranded = self.session.phase == Phase::Connecting
            && self.current.is_none()
            && !matches!(self.pending, Some(Pending::Dial { .. }));
        if !stranded {
            return;
        }
        let peer = self.session.remote_id.clone();
        self.step(SessionEvent::Ended);
        info!(
            peer = ?peer.as_ref().map(PeerId::as_str),
            reason = %reason,
            "Call attempt abandoned"
        );
        self.events.emit(WalkieEvent::CallEnded { peer, reason });
    }

    /// Tear down the current call only; pending requests survive
    fn remote_ended(&mut self, reason: EndReason) {
        let peer = self.close_current();
        self.step(SessionEvent::Ended);
        info!(peer = ?peer.as_ref().map(PeerId::as_str), reason = %reason, "Call ended");
        self.events.emit(WalkieEvent::CallEnded { peer, reason });
    }

    /// Release everything on teardown
    pub fn shutdown(&mut self) {
        self.hang_up(EndReason::Teardown);
        self.keep_awake.release();
        self.mic.release();
        self.sink.shutdown();
    }

    fn issue_token(&mut self) -> CallToken {
        self.next_token += 1;
        self.next_token
    }

    fn acquire_mic(&self, token: CallToken) {
        if let Some(stream) = self.mic.current() {
            let _ = self.inputs.send(Input::MicReady {
                token,
                result: Ok(stream),
            });
            return;
        }
        let mic = self.mic.clone();
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            let result = mic.ensure().await;
            let _ = inputs.send(Input::MicReady { token, result });
        });
    }

    fn forward_call_events(
        &self,
        token: CallToken,
        mut events: mpsc::UnboundedReceiver<CallEvent>,
    ) {
        let inputs = self.inputs.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if inputs.send(Input::Call { token, event }).is_err() {
                    break;
                }
            }
        });
    }

    fn drop_pending(&self, pending: Pending, reason: &str) {
        match pending {
            Pending::Answer { token, call } => {
                debug!(token, peer = %call.peer(), reason, "Closing unanswered call");
                call.close();
            }
            Pending::Dial { token, remote } => {
                debug!(token, peer = %remote, reason, "Abandoning dial");
            }
        }
    }

    fn close_current(&mut self) -> Option<PeerId> {
        let active = self.current.take()?;
        let peer = active.call.peer().clone();
        debug!(peer = %peer, token = active.token, "Closing call");
        active.call.close();
        self.sink.detach();
        Some(peer)
    }

    /// Compute a transition and run its close effect
    fn begin(&mut self, event: &SessionEvent) -> Option<Transition> {
        let transition = self.session.apply(event);
        match &transition {
            Some(t) if t.closes_call() => {
                self.close_current();
            }
            Some(_) => {}
            None => debug!(
                phase = %self.session.phase,
                event = ?event,
                "Event ignored in current phase"
            ),
        }
        transition
    }

    /// Install the next session and run the remaining effects
    fn commit(&mut self, transition: Transition) {
        let mic = transition.mic();
        let previous = std::mem::replace(&mut self.session, transition.next);
        if let Some(enabled) = mic {
            self.mic.set_enabled(enabled);
        }
        if self.session.is_active() {
            self.keep_awake.acquire();
        } else if self.session.is_idle() {
            self.keep_awake.release();
        }

        if previous != self.session {
            debug!(
                from = %previous.phase,
                to = %self.session.phase,
                talking = self.session.talking,
                "Session changed"
            );
            self.events.emit(WalkieEvent::SessionChanged(SessionStatusInfo {
                session: self.session.clone(),
                previous_phase: previous.phase,
                changed_at: Utc::now(),
            }));
        }
    }

    fn step(&mut self, event: SessionEvent) -> bool {
        match self.begin(&event) {
            Some(transition) => {
                self.commit(transition);
                true
            }
            None => false,
        }
    }

    fn alert(&self, error: &WalkieError) {
        if error.is_user_visible() {
            self.events.emit(WalkieEvent::Alert { error: error.clone() });
        }
    }
}

impl fmt::Debug for CallController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallController")
            .field("session", &self.session)
            .field("current", &self.current_peer())
            .field("pending", &self.pending.as_ref().map(Pending::token))
            .field("selected", &self.selected)
            .finish()
    }
}
