//! Call session state machine
//!
//! [`Session`] is the single record describing the current (or most recent)
//! call attempt. It changes only through [`Session::apply`], a pure function
//! from `(state, event)` to the next state plus the side effects the
//! controller has to carry out. Keeping the table pure means every rule below
//! is testable without a transport.
//!
//! | From         | Event       | To         | Effects                       |
//! |--------------|-------------|------------|-------------------------------|
//! | Idle         | Dial        | Connecting |                               |
//! | Connecting   | Dial        | Connecting |                               |
//! | Active       | Dial        | Connecting | CloseCall                     |
//! | Idle         | Answered    | Active     | SetMic(talk)                  |
//! | Connecting   | Answered    | Active     | SetMic(talk)                  |
//! | Active       | Answered    | Active     | CloseCall, SetMic(talk)       |
//! | Connecting   | Placed      | Active     | SetMic(true)                  |
//! | Active       | ToggleTalk  | Active     | SetMic(!talking)              |
//! | Idle         | MicDenied   | Idle       |                               |
//! | Connecting   | MicDenied   | Idle       |                               |
//! | Idle         | Ended       | Idle       |                               |
//! | Connecting   | Ended       | Idle       |                               |
//! | Active       | Ended       | Idle       | CloseCall                     |
//!
//! Every other pair is rejected (`None`) and leaves the session untouched.
//! `Active` always means a call object exists; `Connecting` means a request
//! is pending and no call object exists yet.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::signaling::PeerId;

/// Lifecycle phase of the session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Connecting,
    Active,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => write!(f, "Idle"),
            Phase::Connecting => write!(f, "Connecting"),
            Phase::Active => write!(f, "Active"),
        }
    }
}

/// The current or most recent call attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Peer of the current or most recent call
    pub remote_id: Option<PeerId>,
    pub phase: Phase,
    /// Whether the local microphone is audible to the peer
    pub talking: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::idle()
    }
}

/// Inputs of the session state machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An outbound call to `remote` was requested; the microphone is pending
    Dial { remote: PeerId },
    /// An inbound call from `remote` was answered
    Answered { remote: PeerId, talk: bool },
    /// The outbound call object to `remote` was created
    Placed { remote: PeerId },
    /// Flip the talk state of the active call
    ToggleTalk,
    /// Microphone acquisition failed
    MicDenied,
    /// Hang-up, remote close, transport error or teardown
    Ended,
}

/// Side effects the controller performs for a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Close the current call object before anything else happens
    CloseCall,
    /// Set the microphone tracks' enabled flag
    SetMic(bool),
}

/// Result of applying an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: Session,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: Session) -> Self {
        Self { next, effects: Vec::new() }
    }

    fn with(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    /// Whether the transition closes the current call
    pub fn closes_call(&self) -> bool {
        self.effects.contains(&Effect::CloseCall)
    }

    /// Microphone state requested by the transition, if any
    pub fn mic(&self) -> Option<bool> {
        self.effects.iter().find_map(|e| match e {
            Effect::SetMic(enabled) => Some(*enabled),
            _ => None,
        })
    }
}

impl Session {
    pub fn idle() -> Self {
        Self {
            remote_id: None,
            phase: Phase::Idle,
            talking: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.phase == Phase::Idle
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    /// Compute the transition for `event`, or `None` if the event is not
    /// valid in the current phase
    pub fn apply(&self, event: &SessionEvent) -> Option<Transition> {
        use Phase::*;

        let transition = match (self.phase, event) {
            (Idle | Connecting, SessionEvent::Dial { remote }) => {
                Transition::to(self.connecting(remote))
            }
            (Active, SessionEvent::Dial { remote }) => {
                Transition::to(self.connecting(remote)).with(Effect::CloseCall)
            }

            (Idle | Connecting, SessionEvent::Answered { remote, talk }) => {
                Transition::to(self.active(remote, *talk)).with(Effect::SetMic(*talk))
            }
            (Active, SessionEvent::Answered { remote, talk }) => {
                Transition::to(self.active(remote, *talk))
                    .with(Effect::CloseCall)
                    .with(Effect::SetMic(*talk))
            }

            (Connecting, SessionEvent::Placed { remote }) => {
                Transition::to(self.active(remote, true)).with(Effect::SetMic(true))
            }

            (Active, SessionEvent::ToggleTalk) => {
                let talking = !self.talking;
                Transition::to(Session {
                    talking,
                    ..self.clone()
                })
                .with(Effect::SetMic(talking))
            }

            (Idle | Connecting, SessionEvent::MicDenied) => Transition::to(self.ended()),

            (Idle | Connecting, SessionEvent::Ended) => Transition::to(self.ended()),
            (Active, SessionEvent::Ended) => Transition::to(self.ended()).with(Effect::CloseCall),

            _ => return None,
        };
        Some(transition)
    }

    fn connecting(&self, remote: &PeerId) -> Session {
        Session {
            remote_id: Some(remote.clone()),
            phase: Phase::Connecting,
            talking: false,
        }
    }

    fn active(&self, remote: &PeerId, talking: bool) -> Session {
        Session {
            remote_id: Some(remote.clone()),
            phase: Phase::Active,
            talking,
        }
    }

    fn ended(&self) -> Session {
        Session {
            remote_id: self.remote_id.clone(),
            phase: Phase::Idle,
            talking: false,
        }
    }
}
