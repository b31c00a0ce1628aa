//! Peer-connection and signaling collaborator contract
//!
//! The walkie core never speaks a signaling protocol itself. A host binding
//! (a browser peer library behind WASM, a native WebRTC stack, or the
//! in-process [`crate::loopback`] broker) implements the traits in this module
//! and reports what happens through event channels:
//!
//! ```text
//! SignalingBroker::register ──▶ Registration { endpoint, events }
//!                                    │             │
//!            Endpoint::call ◀────────┘             ├─ Open(PeerId)
//!                 │                                ├─ Error(kind)
//!                 ▼                                ├─ Disconnected
//!            CallHandle { call, events }           └─ Call(CallHandle)
//!                               │
//!                               ├─ Stream(RemoteStream)
//!                               ├─ Close
//!                               └─ Error(reason)
//! ```
//!
//! Event channels are unbounded so a binding can emit from synchronous
//! callbacks without awaiting.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::WalkieResult;
use crate::mic::MicStream;

/// Identifier of an endpoint registered with the signaling broker
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer id from any string-like value
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Parse user input, returning `None` when it is blank after trimming
    pub fn parse(input: &str) -> Option<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Error kinds reported by the signaling broker
///
/// Names follow the broker's string codes, see [`SignalingErrorKind::from_code`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalingErrorKind {
    /// The requested identifier is already registered by another endpoint
    UnavailableId,
    /// The identifier is malformed
    InvalidId,
    /// The remote peer is not registered
    PeerUnavailable,
    /// The signaling link was lost
    Disconnected,
    /// Network failure talking to the broker
    Network,
    /// The broker failed internally
    ServerError,
    /// The broker socket errored or closed
    SocketError,
    /// The underlying peer-connection stack failed
    WebRtc,
    /// Any code not listed above
    Other(String),
}

impl SignalingErrorKind {
    /// Map a broker error code to a kind
    pub fn from_code(code: &str) -> Self {
        match code {
            "unavailable-id" => Self::UnavailableId,
            "invalid-id" => Self::InvalidId,
            "peer-unavailable" => Self::PeerUnavailable,
            "disconnected" => Self::Disconnected,
            "network" => Self::Network,
            "server-error" => Self::ServerError,
            "socket-error" | "socket-closed" => Self::SocketError,
            "webrtc" => Self::WebRtc,
            other => Self::Other(other.to_string()),
        }
    }

    /// Broker string code for this kind
    pub fn code(&self) -> &str {
        match self {
            Self::UnavailableId => "unavailable-id",
            Self::InvalidId => "invalid-id",
            Self::PeerUnavailable => "peer-unavailable",
            Self::Disconnected => "disconnected",
            Self::Network => "network",
            Self::ServerError => "server-error",
            Self::SocketError => "socket-error",
            Self::WebRtc => "webrtc",
            Self::Other(code) => code,
        }
    }

    /// Whether the condition normally clears up by reconnecting
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Disconnected | Self::Network | Self::ServerError | Self::SocketError
        )
    }
}

impl fmt::Display for SignalingErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Opaque handle to the remote party's inbound audio
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteStream {
    /// Stream identifier assigned by the transport
    pub id: String,
    /// Peer the audio comes from
    pub peer: PeerId,
}

/// Events emitted by a call object
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Remote audio became available
    Stream(RemoteStream),
    /// The call was closed (by either side)
    Close,
    /// The transport failed
    Error(String),
}

/// A single media call with a remote peer
pub trait MediaCall: Send + Sync + fmt::Debug {
    /// Remote identifier of the call
    fn peer(&self) -> &PeerId;

    /// Answer an inbound call with the local microphone stream
    fn answer(&self, local: &MicStream) -> WalkieResult<()>;

    /// Close the call; closing twice is harmless
    fn close(&self);
}

/// A call object together with its event stream
#[derive(Debug)]
pub struct CallHandle {
    pub call: Arc<dyn MediaCall>,
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

impl CallHandle {
    /// Remote identifier of the call
    pub fn peer(&self) -> &PeerId {
        self.call.peer()
    }
}

/// Events emitted by a registered endpoint
#[derive(Debug)]
pub enum EndpointEvent {
    /// Registration succeeded with the given identifier
    Open(PeerId),
    /// The broker reported an error
    Error(SignalingErrorKind),
    /// The signaling link dropped; existing calls may still be alive
    Disconnected,
    /// A remote peer is calling
    Call(CallHandle),
}

/// The local party's presence on the signaling broker
pub trait Endpoint: Send + Sync + fmt::Debug {
    /// Place an outbound call to `remote` sending `local` audio
    fn call(&self, remote: &PeerId, local: &MicStream) -> WalkieResult<CallHandle>;

    /// Drop the signaling link without destroying the endpoint
    fn disconnect(&self);

    /// Re-establish a dropped signaling link
    fn reconnect(&self) -> WalkieResult<()>;

    /// Tear the endpoint down; all of its calls become invalid
    fn destroy(&self);
}

/// Endpoint returned by a registration request, plus its event stream
#[derive(Debug)]
pub struct Registration {
    pub endpoint: Arc<dyn Endpoint>,
    pub events: mpsc::UnboundedReceiver<EndpointEvent>,
}

/// Entry point of the signaling broker
///
/// `register` starts a registration; the outcome arrives later as
/// [`EndpointEvent::Open`] or [`EndpointEvent::Error`]. Passing `None` asks
/// the broker to assign an identifier.
pub trait SignalingBroker: Send + Sync {
    fn register(&self, requested: Option<&PeerId>) -> WalkieResult<Registration>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_parse_trims_and_rejects_blank() {
        assert_eq!(PeerId::parse("  peer-77 "), Some(PeerId::new("peer-77")));
        assert_eq!(PeerId::parse("   "), None);
        assert_eq!(PeerId::parse(""), None);
    }

    #[test]
    fn test_error_codes_map_both_ways() {
        for code in ["unavailable-id", "peer-unavailable", "network", "server-error", "webrtc"] {
            assert_eq!(SignalingErrorKind::from_code(code).code(), code);
        }
        assert_eq!(SignalingErrorKind::from_code("socket-closed"), SignalingErrorKind::SocketError);
        assert_eq!(
            SignalingErrorKind::from_code("ssl-unavailable"),
            SignalingErrorKind::Other("ssl-unavailable".to_string())
        );
    }

    #[test]
    fn test_transient_kinds() {
        assert!(SignalingErrorKind::Network.is_transient());
        assert!(SignalingErrorKind::Disconnected.is_transient());
        assert!(!SignalingErrorKind::UnavailableId.is_transient());
        assert!(!SignalingErrorKind::PeerUnavailable.is_transient());
    }

    #[test]
    fn test_peer_id_serializes_as_plain_string() {
        let json = serde_json::to_string(&PeerId::new("abc")).unwrap();
        assert_eq!(json, "\"abc\"");
    }
}
