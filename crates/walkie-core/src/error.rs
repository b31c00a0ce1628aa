//! Error types for the walkie core
//!
//! Every fallible operation in the crate returns [`WalkieResult`]. Errors fall
//! into two groups: the ones a user has to see and act on (a denied
//! microphone, a missing remote id) and the ones the core recovers from on its
//! own (signaling drops, identifier collisions, stale completions). Use
//! [`WalkieError::is_user_visible`] and [`WalkieError::is_recoverable`] to tell
//! them apart.

use thiserror::Error;

use crate::signaling::SignalingErrorKind;

/// Result type for walkie operations
pub type WalkieResult<T> = Result<T, WalkieError>;

/// Errors that can occur in the walkie core
#[derive(Debug, Clone, Error)]
pub enum WalkieError {
    /// The platform refused microphone capture
    #[error("Microphone permission denied: {message}")]
    PermissionDenied { message: String },

    /// The capture device failed for a reason other than permission
    #[error("Microphone capture failed: {message}")]
    Capture { message: String },

    /// The requested local identifier is already registered with the broker
    #[error("Identifier already in use: {requested}")]
    IdentifierCollision { requested: String },

    /// The signaling link dropped
    #[error("Signaling disconnected: {reason}")]
    SignalingDisconnected { reason: String },

    /// Any other error reported by the signaling broker
    #[error("Signaling error: {kind}")]
    Signaling { kind: SignalingErrorKind },

    /// The call object reported an error
    #[error("Call transport error with {peer}: {reason}")]
    CallTransportError { peer: String, reason: String },

    /// An asynchronous completion arrived after its request was superseded
    #[error("Stale completion for request {token}")]
    StaleCompletion { token: u64 },

    /// A call was requested without a remote identifier
    #[error("Remote identifier is required")]
    MissingRemoteId,

    /// No signaling endpoint is registered
    #[error("Local endpoint is not registered")]
    NotRegistered,

    /// Persisted storage could not be read or written
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// JSON (de)serialization failed
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// Filesystem error from the file-backed store
    #[error("I/O error: {message}")]
    Io { message: String },

    /// The core was assembled without a required collaborator or setting
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Operation is not valid in the current state
    #[error("Invalid state: {message}")]
    InvalidState { message: String },

    /// Internal error
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl WalkieError {
    /// Create a permission denied error
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Create a capture error
    pub fn capture(message: impl Into<String>) -> Self {
        Self::Capture {
            message: message.into(),
        }
    }

    /// Create a signaling disconnected error
    pub fn disconnected(reason: impl Into<String>) -> Self {
        Self::SignalingDisconnected {
            reason: reason.into(),
        }
    }

    /// Create a call transport error
    pub fn transport(peer: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CallTransportError {
            peer: peer.into(),
            reason: reason.into(),
        }
    }

    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an invalid state error
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed
    ///
    /// Used by [`crate::recovery::retry_with_backoff`] to decide whether
    /// another attempt is worthwhile.
    pub fn is_recoverable(&self) -> bool {
        match self {
            WalkieError::SignalingDisconnected { .. } => true,
            WalkieError::Signaling { kind } => kind.is_transient(),
            WalkieError::Io { .. } => true,
            WalkieError::Storage { .. } => true,
            _ => false,
        }
    }

    /// Whether the error must be shown to the user as an actionable message
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            WalkieError::PermissionDenied { .. }
                | WalkieError::Capture { .. }
                | WalkieError::MissingRemoteId
        )
    }

    /// Short category label used in structured logs
    pub fn category(&self) -> &'static str {
        match self {
            WalkieError::PermissionDenied { .. } | WalkieError::Capture { .. } => "microphone",
            WalkieError::IdentifierCollision { .. }
            | WalkieError::SignalingDisconnected { .. }
            | WalkieError::Signaling { .. }
            | WalkieError::NotRegistered => "signaling",
            WalkieError::CallTransportError { .. } => "call",
            WalkieError::StaleCompletion { .. } => "stale",
            WalkieError::MissingRemoteId | WalkieError::InvalidState { .. } => "user",
            WalkieError::Storage { .. }
            | WalkieError::Serialization { .. }
            | WalkieError::Io { .. } => "storage",
            WalkieError::Configuration { .. } | WalkieError::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for WalkieError {
    fn from(err: serde_json::Error) -> Self {
        WalkieError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for WalkieError {
    fn from(err: std::io::Error) -> Self {
        WalkieError::Io {
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(WalkieError::disconnected("socket closed").is_recoverable());
        assert!(WalkieError::Signaling { kind: SignalingErrorKind::Network }.is_recoverable());
        let collision = WalkieError::Signaling {
            kind: SignalingErrorKind::UnavailableId,
        };
        assert!(!collision.is_recoverable());
        assert!(!WalkieError::permission_denied("blocked").is_recoverable());
        assert!(!WalkieError::MissingRemoteId.is_recoverable());
    }

    #[test]
    fn test_user_visible_errors() {
        assert!(WalkieError::permission_denied("blocked").is_user_visible());
        assert!(WalkieError::MissingRemoteId.is_user_visible());
        assert!(!WalkieError::StaleCompletion { token: 3 }.is_user_visible());
        assert!(!WalkieError::transport("peer-1", "ice failed").is_user_visible());
    }

    #[test]
    fn test_display_and_category() {
        let err = WalkieError::IdentifierCollision { requested: "abc".to_string() };
        assert_eq!(err.to_string(), "Identifier already in use: abc");
        assert_eq!(err.category(), "signaling");

        let err: WalkieError = serde_json::from_str::<Vec<u8>>("{").unwrap_err().into();
        assert_eq!(err.category(), "storage");
    }
}
