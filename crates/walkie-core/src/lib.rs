//! # Walkie Core - Two-Party Voice Walkie-Talkie
//!
//! This crate implements the session lifecycle of a peer-to-peer
//! push-to-talk voice app. Two parties, each identified by a persistent id
//! registered with a signaling broker, call each other directly; pressing
//! talk unmutes the microphone, pressing it again mutes it.
//!
//! The core owns every stateful concern and nothing platform specific:
//!
//! - **identity** and **contacts**: persistent local id and saved peers
//! - **supervisor**: registration, identifier collision recovery, reconnect
//! - **controller** and **session**: the call state machine, takeovers and
//!   stale-completion handling
//! - **mic**, **audio** and **wake**: the microphone stream, remote playback
//!   and the screen wake lock
//!
//! Platform access goes through the traits in [`signaling`], [`mic`],
//! [`audio`], [`wake`] and [`storage`]. The [`loopback`] module implements
//! all of them in-process.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use walkie_core::loopback::{LoopbackBroker, LoopbackCapture, LoopbackOutput, PermissionMode};
//! use walkie_core::{Walkie, WalkieEvent};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let walkie = Walkie::builder()
//!         .broker(LoopbackBroker::new())
//!         .capture(LoopbackCapture::new(PermissionMode::Grant))
//!         .output(LoopbackOutput::new())
//!         .build()
//!         .await?;
//!
//!     let (handle, task) = walkie.spawn();
//!     let mut events = handle.subscribe_simple();
//!     handle.connect("friend-id")?;
//!
//!     while let Some(event) = events.next().await {
//!         if let WalkieEvent::CallEnded { .. } = event {
//!             break;
//!         }
//!     }
//!     handle.shutdown()?;
//!     task.await?;
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod audio;
pub mod builder;
pub mod config;
pub mod contacts;
pub mod controller;
pub mod error;
pub mod events;
pub mod identity;
pub mod loopback;
pub mod mic;
pub mod recovery;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod supervisor;
pub mod wake;

// Re-export main types
pub use agent::{Command, Walkie, WalkieHandle, WalkieStatus};
pub use builder::WalkieBuilder;
pub use config::WalkieConfig;
pub use contacts::Contact;
pub use error::{WalkieError, WalkieResult};
pub use events::{EndReason, EventStream, WalkieEvent};
pub use session::{Phase, Session};
pub use signaling::PeerId;
pub use supervisor::ConnectionState;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
