//! Event system for the walkie core
//!
//! The presentation layer never reads internal state directly; it subscribes
//! to [`WalkieEvent`]s and renders them. Events are broadcast, so any number
//! of views (and tests) can listen at once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::contacts::Contact;
use crate::error::WalkieError;
use crate::session::{Phase, Session};
use crate::signaling::{PeerId, RemoteStream, SignalingErrorKind};
use crate::supervisor::ConnectionState;

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// The local user hung up
    LocalHangup,
    /// The remote party closed the call
    RemoteClosed,
    /// The call transport failed
    TransportError(String),
    /// Another call took its place
    Superseded,
    /// The core is shutting down
    Teardown,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndReason::LocalHangup => write!(f, "local hang-up"),
            EndReason::RemoteClosed => write!(f, "remote closed"),
            EndReason::TransportError(reason) => write!(f, "transport error: {}", reason),
            EndReason::Superseded => write!(f, "superseded"),
            EndReason::Teardown => write!(f, "teardown"),
        }
    }
}

/// Snapshot of a session change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatusInfo {
    pub session: Session,
    pub previous_phase: Phase,
    pub changed_at: DateTime<Utc>,
}

/// Events emitted by the walkie core
#[derive(Debug, Clone)]
pub enum WalkieEvent {
    // Signaling events
    /// The endpoint registered under `local_id`
    Registered {
        local_id: PeerId,
    },

    /// The signaling link changed state
    ConnectionChanged {
        previous: ConnectionState,
        current: ConnectionState,
    },

    /// The stored identifier was taken and replaced
    IdentityReplaced {
        previous: PeerId,
        replacement: PeerId,
    },

    /// Registration gave up; the user may retry with a manual reconnect
    RegistrationFailed {
        kind: SignalingErrorKind,
    },

    /// The broker reported an error that did not end the registration
    SignalingError {
        kind: SignalingErrorKind,
    },

    // Call events
    /// A remote peer is calling; the core answers automatically
    IncomingCall {
        peer: PeerId,
    },

    /// The session record changed
    SessionChanged(SessionStatusInfo),

    /// A call replaced the one that was active
    CallTakenOver {
        previous: PeerId,
        next: PeerId,
    },

    /// A call ended
    CallEnded {
        peer: Option<PeerId>,
        reason: EndReason,
    },

    /// Remote audio is attached to the output
    RemoteAudio {
        stream: RemoteStream,
    },

    // User-facing events
    /// Something the user has to see and act on
    Alert {
        error: WalkieError,
    },

    /// The contact list changed
    ContactsChanged {
        contacts: Vec<Contact>,
    },
}

impl WalkieEvent {
    /// Whether this event carries a user-visible message
    pub fn is_alert(&self) -> bool {
        matches!(self, WalkieEvent::Alert { .. })
    }
}

/// Event stream type
pub type EventStream = BroadcastStream<WalkieEvent>;

/// Event iterator that doesn't require StreamExt
pub struct EventIterator {
    stream: EventStream,
}

impl EventIterator {
    pub fn new(stream: EventStream) -> Self {
        Self { stream }
    }

    /// Next event, skipping over lag notifications
    pub async fn next(&mut self) -> Option<WalkieEvent> {
        use tokio_stream::StreamExt;
        loop {
            match self.stream.next().await {
                Some(Ok(event)) => return Some(event),
                Some(Err(lagged)) => {
                    tracing::warn!(error = %lagged, "Event subscriber lagged");
                }
                None => return None,
            }
        }
    }
}

/// Broadcasts [`WalkieEvent`]s to subscribers
#[derive(Clone)]
pub struct EventEmitter {
    sender: broadcast::Sender<WalkieEvent>,
}

impl EventEmitter {
    /// Create a new event emitter with the specified capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: WalkieEvent) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> EventStream {
        BroadcastStream::new(self.sender.subscribe())
    }

    pub fn subscribe_simple(&self) -> EventIterator {
        EventIterator::new(self.subscribe())
    }

    /// Raw receiver, for callers that poll with `try_recv`
    pub fn receiver(&self) -> broadcast::Receiver<WalkieEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventEmitter")
            .field("receivers", &self.receiver_count())
            .finish()
    }
}
