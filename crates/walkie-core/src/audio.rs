//! Remote audio output
//!
//! Inbound audio goes to a single playback output. Platforms with an autoplay
//! policy reject playback until the user interacts with the page, so
//! [`AudioSink::bind`] swallows playback failures and [`AudioSink::unlock`]
//! (called on the first gesture and whenever the app returns to the
//! foreground) resumes the audio context and retries.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::signaling::RemoteStream;

/// Why the platform refused to play
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackError {
    /// Autoplay policy blocked playback until a user gesture
    NotAllowed,
    /// Any other platform failure
    Failed(String),
}

impl fmt::Display for PlaybackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlaybackError::NotAllowed => write!(f, "playback not allowed before user gesture"),
            PlaybackError::Failed(reason) => write!(f, "playback failed: {}", reason),
        }
    }
}

/// The platform playback element and its audio context
pub trait AudioOutput: Send + Sync {
    /// Attach (or with `None`, detach) the stream to play
    fn set_source(&self, stream: Option<RemoteStream>);

    /// Start or resume playback of the attached stream
    fn play(&self) -> Result<(), PlaybackError>;

    /// Resume a suspended audio processing context
    fn resume_context(&self) -> Result<(), PlaybackError>;

    /// Close the audio processing context
    fn close_context(&self) {}
}

/// Routes the remote stream to the playback output
pub struct AudioSink {
    output: Arc<dyn AudioOutput>,
    unlocked: AtomicBool,
    bound: Mutex<Option<RemoteStream>>,
}

impl AudioSink {
    pub fn new(output: Arc<dyn AudioOutput>) -> Self {
        Self {
            output,
            unlocked: AtomicBool::new(false),
            bound: Mutex::new(None),
        }
    }

    /// Attach `stream` and start playing it
    pub fn bind(&self, stream: RemoteStream) {
        debug!(stream = %stream.id, peer = %stream.peer, "Binding remote audio");
        self.output.set_source(Some(stream.clone()));
        *self.bound.lock() = Some(stream);
        if let Err(e) = self.output.play() {
            // expected until the first user gesture
            trace!(error = %e, "Playback rejected");
        }
    }

    /// Detach the current stream, if any
    pub fn detach(&self) {
        if self.bound.lock().take().is_some() {
            self.output.set_source(None);
        }
    }

    /// Resume audio after a user gesture; a no-op once it has succeeded
    ///
    /// Returns whether the sink is unlocked afterwards.
    pub fn unlock(&self) -> bool {
        if self.unlocked.load(Ordering::SeqCst) {
            return true;
        }
        match self.output.resume_context() {
            Ok(()) => {
                self.unlocked.store(true, Ordering::SeqCst);
                debug!("Audio output unlocked");
            }
            Err(e) => debug!(error = %e, "Audio context did not resume"),
        }
        if self.bound.lock().is_some() {
            if let Err(e) = self.output.play() {
                trace!(error = %e, "Playback retry rejected");
            }
        }
        self.unlocked.load(Ordering::SeqCst)
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.load(Ordering::SeqCst)
    }

    /// Currently attached stream
    pub fn bound(&self) -> Option<RemoteStream> {
        self.bound.lock().clone()
    }

    /// Detach and close the audio context
    pub fn shutdown(&self) {
        self.detach();
        self.output.close_context();
    }
}

impl fmt::Debug for AudioSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioSink")
            .field("unlocked", &self.is_unlocked())
            .field("bound", &*self.bound.lock())
            .finish()
    }
}
