//! Walkie configuration
//!
//! [`WalkieConfig`] gathers the knobs of the session core: storage keys,
//! identity policy, capture constraints, talk policy and reconnect backoff.
//! Defaults match the behaviour of the browser application the core was
//! built for, so most hosts only need `WalkieConfig::default()`.
//!
//! ```rust
//! use walkie_core::config::WalkieConfig;
//!
//! let config = WalkieConfig::new()
//!     .with_identity_key("walkie-id")
//!     .with_talk_on_incoming(false)
//!     .with_reconnect_attempts(5);
//!
//! assert!(!config.talk_on_incoming);
//! assert_eq!(config.reconnect.max_attempts, 5);
//! ```
//!
//! The struct derives `serde`, so a host can also ship it as JSON; missing
//! fields fall back to their defaults:
//!
//! ```rust
//! use walkie_core::config::WalkieConfig;
//!
//! let config = WalkieConfig::from_json(r#"{ "talk_on_incoming": false }"#).unwrap();
//! assert_eq!(config.contacts_key, "walkie-friends");
//! assert!(!config.talk_on_incoming);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::WalkieResult;
use crate::mic::CaptureConstraints;
use crate::recovery::RetryConfig;

/// Storage key of the local identity
pub const DEFAULT_IDENTITY_KEY: &str = "walkie-id";

/// Older storage key some installations used for the local identity
pub const LEGACY_IDENTITY_KEY: &str = "walkie-peer-id";

/// Storage key of the contact list
pub const DEFAULT_CONTACTS_KEY: &str = "walkie-friends";

/// Number of random characters appended to a colliding identifier
pub const DEFAULT_COLLISION_SUFFIX_LEN: usize = 4;

/// Reconnect backoff settings, in serializable form
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Attempts per disconnect before giving up until the next trigger
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay_ms: u64,
    /// Upper bound on any single delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub backoff_multiplier: f64,
    /// Randomise delays by +/-10%
    pub use_jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 10_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl ReconnectConfig {
    /// Convert into the retry settings used by [`crate::recovery`]
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_multiplier: self.backoff_multiplier,
            use_jitter: self.use_jitter,
        }
    }
}

/// Configuration of the walkie session core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalkieConfig {
    /// Storage key holding the local identity
    pub identity_key: String,
    /// Older keys to migrate the identity from when `identity_key` is empty
    pub legacy_identity_keys: Vec<String>,
    /// Storage key holding the contact list
    pub contacts_key: String,
    /// Generate and persist an identity on first run instead of letting the
    /// broker assign one
    pub generate_local_id: bool,
    /// Random characters appended to a colliding identifier
    pub collision_suffix_len: usize,
    /// Microphone capture constraints
    pub capture: CaptureConstraints,
    /// Unmute the microphone as soon as an inbound call is answered
    pub talk_on_incoming: bool,
    /// Hold a screen wake lock while a call is active
    pub keep_awake: bool,
    /// Reconnect backoff after a signaling drop
    pub reconnect: ReconnectConfig,
    /// Capacity of the UI event broadcast channel
    pub event_capacity: usize,
}

impl Default for WalkieConfig {
    fn default() -> Self {
        Self {
            identity_key: DEFAULT_IDENTITY_KEY.to_string(),
            legacy_identity_keys: vec![LEGACY_IDENTITY_KEY.to_string()],
            contacts_key: DEFAULT_CONTACTS_KEY.to_string(),
            generate_local_id: true,
            collision_suffix_len: DEFAULT_COLLISION_SUFFIX_LEN,
            capture: CaptureConstraints::default(),
            talk_on_incoming: true,
            keep_awake: true,
            reconnect: ReconnectConfig::default(),
            event_capacity: 256,
        }
    }
}

impl WalkieConfig {
    /// Create a configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a configuration from JSON; absent fields take their defaults
    pub fn from_json(json: &str) -> WalkieResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Set the identity storage key
    pub fn with_identity_key(mut self, key: impl Into<String>) -> Self {
        self.identity_key = key.into();
        self
    }

    /// Set the contacts storage key
    pub fn with_contacts_key(mut self, key: impl Into<String>) -> Self {
        self.contacts_key = key.into();
        self
    }

    /// Let the broker assign an identifier when none is stored
    pub fn with_broker_assigned_id(mut self) -> Self {
        self.generate_local_id = false;
        self
    }

    /// Set the inbound talk policy
    pub fn with_talk_on_incoming(mut self, talk: bool) -> Self {
        self.talk_on_incoming = talk;
        self
    }

    /// Enable or disable the best-effort wake lock
    pub fn with_keep_awake(mut self, keep_awake: bool) -> Self {
        self.keep_awake = keep_awake;
        self
    }

    /// Set microphone capture constraints
    pub fn with_capture(mut self, capture: CaptureConstraints) -> Self {
        self.capture = capture;
        self
    }

    /// Set the reconnect backoff
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Set the number of reconnect attempts per disconnect
    pub fn with_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.reconnect.max_attempts = attempts;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WalkieConfig::default();
        assert_eq!(config.identity_key, "walkie-id");
        assert_eq!(config.legacy_identity_keys, vec!["walkie-peer-id".to_string()]);
        assert_eq!(config.contacts_key, "walkie-friends");
        assert_eq!(config.collision_suffix_len, 4);
        assert!(config.generate_local_id);
        assert!(config.talk_on_incoming);
        assert!(config.capture.echo_cancellation);
        assert!(config.capture.noise_suppression);
    }

    #[test]
    fn test_reconnect_to_retry_config() {
        let retry = ReconnectConfig {
            max_attempts: 0,
            initial_delay_ms: 250,
            max_delay_ms: 4_000,
            backoff_multiplier: 1.5,
            use_jitter: false,
        }
        .to_retry_config();

        // zero attempts would never try at all
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.initial_delay, Duration::from_millis(250));
        assert_eq!(retry.max_delay, Duration::from_secs(4));
        assert!(!retry.use_jitter);
    }

    #[test]
    fn test_partial_json() {
        let config = WalkieConfig::from_json(
            r#"{ "identity_key": "custom-id", "reconnect": { "max_attempts": 7 } }"#,
        )
        .unwrap();
        assert_eq!(config.identity_key, "custom-id");
        assert_eq!(config.reconnect.max_attempts, 7);
        assert_eq!(config.reconnect.initial_delay_ms, 500);
        assert!(config.keep_awake);
    }

    #[test]
    fn test_invalid_json_is_an_error() {
        assert!(WalkieConfig::from_json("{ nope").is_err());
    }
}
