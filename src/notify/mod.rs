//! Interaction state notifications
//!
//! The assistant reports what it is doing (idle, listening, thinking,
//! speaking, error) to an external indicator. Notification is fire-and-forget:
//! implementations log their own failures and never block the caller.

mod led;

use std::fmt;

use serde::Deserialize;

pub use led::{LedCommand, LedNotifier, LedTracker};

/// What the assistant is doing, as shown to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InteractionState {
    /// Waiting for the wake word
    Idle,
    /// Capturing a request
    Listening,
    /// Request sent, waiting for the answer
    Thinking,
    /// Playing the answer
    Speaking,
    /// Something went wrong
    Error,
}

impl fmt::Display for InteractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Error => "error",
        };
        f.write_str(name)
    }
}

/// Receives interaction state changes
pub trait StateNotifier: Send + Sync {
    /// Report a state change; must not block
    fn notify(&self, state: InteractionState);
}

/// Notifier that only logs
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl StateNotifier for LogNotifier {
    fn notify(&self, state: InteractionState) {
        tracing::info!(%state, "interaction state");
    }
}

/// Which notifier the daemon uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifierKind {
    /// Log state changes only
    #[default]
    Log,
    /// Drive LEDs over ubus and play sound cues
    Ubus,
}

impl NotifierKind {
    /// Parse from a string, falling back to `Log` for unknown values
    #[must_use]
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "ubus" | "led" | "leds" => Self::Ubus,
            _ => Self::Log,
        }
    }
}
