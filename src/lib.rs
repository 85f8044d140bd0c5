//! Hark - wake-word-gated duplex voice assistant
//!
//! This library provides the pieces of an always-listening voice assistant:
//! - Audio capture and a keyword spotter that gates on a single wake phrase
//! - A capture-to-spotter loop running on its own thread
//! - Dialog turns with a remote assistant service, streaming audio both ways
//! - Interaction state notifications (logs, device LEDs, sound cues)
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐   chunks   ┌──────────────┐  detection  ┌──────────────┐
//! │ AudioCapture ├───────────►│ WakeListener ├────────────►│    Daemon    │
//! └──────┬───────┘            │  + Spotter   │             └──────┬───────┘
//!        │                    └──────────────┘                    │ turns
//!        │ chunks (reopened)                               ┌──────▼───────┐
//!        └────────────────────────────────────────────────►│DialogSession │◄──► service
//!                                                          └──────┬───────┘
//!                                                                 │ audio out
//!                                                          ┌──────▼───────┐
//!                                                          │   Playback   │
//!                                                          └──────────────┘
//! ```

pub mod config;
pub mod daemon;
pub mod dialog;
pub mod error;
pub mod notify;
pub mod voice;

pub use config::Config;
pub use daemon::Daemon;
pub use dialog::{ConversationState, DialogSession, DialogSettings, TcpTransport, TurnOutcome};
pub use error::{DeviceError, EngineError, Error, Result};
pub use notify::{InteractionState, LedNotifier, LogNotifier, StateNotifier};
pub use voice::{AudioPlayback, CpalCapture, KeywordSpotter, WakeListener};
