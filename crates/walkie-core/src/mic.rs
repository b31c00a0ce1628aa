//! Microphone resource management
//!
//! The microphone is acquired once, on first need, and then kept for the
//! whole process: calls come and go but the same [`MicStream`] is handed to
//! every one of them. Muting flips the per-track `enabled` flag and never
//! touches the device, so pressing talk again is instant and the platform
//! never prompts for permission twice.
//!
//! ```text
//!  ensure() ──▶ cached? ──yes──▶ same MicStream
//!                  │
//!                  no
//!                  ▼
//!        AudioCapture::request(constraints)   (may wait on a permission prompt)
//!                  │
//!                  ▼
//!        tracks.enabled = desired mute state, cache, return
//! ```

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{WalkieError, WalkieResult};

/// Processing constraints passed to the capture device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
        }
    }
}

/// One audio track of a capture stream
#[derive(Debug)]
pub struct AudioTrack {
    label: String,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

impl AudioTrack {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            enabled: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

struct MicStreamInner {
    id: Uuid,
    tracks: Vec<AudioTrack>,
}

/// Shared handle to a local capture stream
///
/// Clones refer to the same tracks; the transport reads the `enabled` flags
/// of the clone it was given.
#[derive(Clone)]
pub struct MicStream {
    inner: Arc<MicStreamInner>,
}

impl MicStream {
    /// Build a stream from the tracks a capture device produced
    pub fn new(tracks: Vec<AudioTrack>) -> Self {
        Self {
            inner: Arc::new(MicStreamInner {
                id: Uuid::new_v4(),
                tracks,
            }),
        }
    }

    /// Single-track stream, as produced by a typical microphone
    pub fn mono(label: impl Into<String>) -> Self {
        Self::new(vec![AudioTrack::new(label)])
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn tracks(&self) -> &[AudioTrack] {
        &self.inner.tracks
    }

    /// True when every track is enabled (and there is at least one)
    pub fn is_enabled(&self) -> bool {
        !self.inner.tracks.is_empty() && self.inner.tracks.iter().all(AudioTrack::is_enabled)
    }

    pub fn set_enabled(&self, enabled: bool) {
        for track in &self.inner.tracks {
            track.set_enabled(enabled);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.tracks.iter().all(AudioTrack::is_stopped)
    }

    /// Whether both handles refer to the same capture
    pub fn same_stream(&self, other: &MicStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn stop(&self) {
        for track in &self.inner.tracks {
            track.stop();
        }
    }
}

impl fmt::Debug for MicStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicStream")
            .field("id", &self.inner.id)
            .field("tracks", &self.inner.tracks.len())
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

/// Why a capture request failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The user or platform refused access
    PermissionDenied(String),
    /// No usable input device, or it failed to start
    DeviceUnavailable(String),
}

impl From<CaptureError> for WalkieError {
    fn from(err: CaptureError) -> Self {
        match err {
            CaptureError::PermissionDenied(message) => WalkieError::permission_denied(message),
            CaptureError::DeviceUnavailable(message) => WalkieError::capture(message),
        }
    }
}

/// Platform microphone access
///
/// `request` may wait indefinitely on a permission prompt.
#[async_trait]
pub trait AudioCapture: Send + Sync {
    async fn request(&self, constraints: &CaptureConstraints) -> Result<MicStream, CaptureError>;
}

/// Owns the single local capture stream
pub struct MicrophoneManager {
    capture: Arc<dyn AudioCapture>,
    constraints: CaptureConstraints,
    cached: RwLock<Option<MicStream>>,
    acquire: tokio::sync::Mutex<()>,
    desired_enabled: AtomicBool,
    requests: AtomicUsize,
}

impl MicrophoneManager {
    /// Create a manager; nothing is acquired until [`ensure`](Self::ensure)
    pub fn new(capture: Arc<dyn AudioCapture>, constraints: CaptureConstraints) -> Self {
        Self {
            capture,
            constraints,
            cached: RwLock::new(None),
            acquire: tokio::sync::Mutex::new(()),
            desired_enabled: AtomicBool::new(false),
            requests: AtomicUsize::new(0),
        }
    }

    /// Return the cached stream, acquiring it first if needed
    ///
    /// Concurrent callers share one platform request. A fresh stream starts
    /// with its tracks set to the current desired state (muted by default).
    pub async fn ensure(&self) -> WalkieResult<MicStream> {
        if let Some(stream) = self.current() {
            return Ok(stream);
        }

        let _guard = self.acquire.lock().await;
        if let Some(stream) = self.current() {
            return Ok(stream);
        }

        self.requests.fetch_add(1, Ordering::SeqCst);
        debug!(
            echo_cancellation = self.constraints.echo_cancellation,
            noise_suppression = self.constraints.noise_suppression,
            "Requesting microphone"
        );
        match self.capture.request(&self.constraints).await {
            Ok(stream) => {
                let enabled = self.desired_enabled.load(Ordering::SeqCst);
                stream.set_enabled(enabled);
                info!(stream = %stream.id(), enabled, "Microphone acquired");
                *self.cached.write() = Some(stream.clone());
                Ok(stream)
            }
            Err(e) => {
                warn!(error = ?e, "Microphone request failed");
                Err(e.into())
            }
        }
    }

    /// The cached stream, if one was acquired
    pub fn current(&self) -> Option<MicStream> {
        self.cached.read().clone()
    }

    pub fn is_acquired(&self) -> bool {
        self.cached.read().is_some()
    }

    /// Enable or mute every track; remembered for a stream acquired later
    pub fn set_enabled(&self, enabled: bool) {
        self.desired_enabled.store(enabled, Ordering::SeqCst);
        if let Some(stream) = self.cached.read().as_ref() {
            stream.set_enabled(enabled);
            debug!(stream = %stream.id(), enabled, "Microphone tracks toggled");
        }
    }

    /// Whether the tracks are (or will be) enabled
    pub fn is_enabled(&self) -> bool {
        match self.cached.read().as_ref() {
            Some(stream) => stream.is_enabled(),
            None => self.desired_enabled.load(Ordering::SeqCst),
        }
    }

    /// Number of platform capture requests issued so far
    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Stop and drop the stream; only called on process teardown
    pub fn release(&self) {
        if let Some(stream) = self.cached.write().take() {
            stream.stop();
            info!(stream = %stream.id(), "Microphone released");
        }
    }
}

impl fmt::Debug for MicrophoneManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicrophoneManager")
            .field("constraints", &self.constraints)
            .field("cached", &*self.cached.read())
            .field("requests", &self.request_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::{LoopbackCapture, PermissionMode};

    fn manager(capture: &LoopbackCapture) -> MicrophoneManager {
        MicrophoneManager::new(Arc::new(capture.clone()), CaptureConstraints::default())
    }

    #[tokio::test]
    async fn test_second_ensure_reuses_stream() {
        let capture = LoopbackCapture::new(PermissionMode::Grant);
        let mic = manager(&capture);

        let first = mic.ensure().await.unwrap();
        let second = mic.ensure().await.unwrap();

        assert!(first.same_stream(&second));
        assert_eq!(mic.request_count(), 1);
        assert_eq!(capture.request_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_issues_one_request() {
        let capture = LoopbackCapture::new(PermissionMode::Prompt);
        let mic = Arc::new(manager(&capture));

        let a = tokio::spawn({
            let mic = mic.clone();
            async move { mic.ensure().await }
        });
        let b = tokio::spawn({
            let mic = mic.clone();
            async move { mic.ensure().await }
        });
        tokio::task::yield_now().await;
        capture.grant();

        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert!(a.same_stream(&b));
        assert_eq!(capture.request_count(), 1);
    }

    #[test]
    fn test_ensure_waits_for_prompt() {
        let capture = LoopbackCapture::new(PermissionMode::Prompt);
        let mic = manager(&capture);

        let mut ensure = tokio_test::task::spawn(mic.ensure());
        tokio_test::assert_pending!(ensure.poll());
        tokio_test::assert_pending!(ensure.poll());

        capture.grant();
        assert!(ensure.is_woken());
        let stream = tokio_test::assert_ready_ok!(ensure.poll());
        drop(ensure);
        assert!(mic.current().is_some_and(|cached| cached.same_stream(&stream)));
    }

    #[tokio::test]
    async fn test_new_stream_starts_muted_by_default() {
        let capture = LoopbackCapture::new(PermissionMode::Grant);
        let mic = manager(&capture);

        let stream = mic.ensure().await.unwrap();
        assert!(!stream.is_enabled());
        assert!(!mic.is_enabled());
    }

    #[tokio::test]
    async fn test_desired_state_applies_to_later_stream() {
        let capture = LoopbackCapture::new(PermissionMode::Grant);
        let mic = manager(&capture);

        mic.set_enabled(true);
        let stream = mic.ensure().await.unwrap();
        assert!(stream.is_enabled());

        mic.set_enabled(false);
        assert!(!stream.is_enabled());
        assert_eq!(capture.request_count(), 1);
    }

    #[tokio::test]
    async fn test_permission_denied_is_reported_and_not_cached() {
        let capture = LoopbackCapture::new(PermissionMode::Deny);
        let mic = manager(&capture);

        let err = mic.ensure().await.unwrap_err();
        assert!(matches!(err, WalkieError::PermissionDenied { .. }));
        assert!(err.is_user_visible());
        assert!(!mic.is_acquired());

        capture.set_mode(PermissionMode::Grant);
        assert!(mic.ensure().await.is_ok());
        assert_eq!(capture.request_count(), 2);
    }

    #[tokio::test]
    async fn test_release_stops_tracks() {
        let capture = LoopbackCapture::new(PermissionMode::Grant);
        let mic = manager(&capture);

        let stream = mic.ensure().await.unwrap();
        mic.release();
        assert!(stream.is_stopped());
        assert!(!mic.is_acquired());
    }
}
