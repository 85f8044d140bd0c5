//! LED and sound cue notifier for devices running `ubus`
//!
//! State changes are queued to a worker thread that drives the LED manager
//! (`ubus call ledmgr set_condition|clear_condition`) and plays sound cues
//! through `aplay`. The caller never waits on either.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::{InteractionState, StateNotifier};
use crate::Result;

/// Delay before the wake sound so it doesn't clip the end of the wake word
const LISTENING_CUE_DELAY: Duration = Duration::from_millis(500);

/// Cue played when the wake word is heard
const WAKE_SOUND: &str = "ful_ui_wakesound.wav";

/// Cue played when the request has been captured
const ENDPOINT_SOUND: &str = "ful_ui_endpointing.wav";

/// LED manager condition for a state
#[must_use]
pub const fn led_condition(state: InteractionState) -> &'static str {
    match state {
        InteractionState::Idle => "c_alexa_idle",
        InteractionState::Listening => "c_alexa_listening",
        InteractionState::Thinking => "c_alexa_thinking",
        InteractionState::Speaking => "c_alexa_responding",
        InteractionState::Error => "c_alexa_system_error",
    }
}

/// A single LED manager call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedCommand {
    /// Light the condition for a state
    Set(InteractionState),
    /// Clear the condition for a state
    Clear(InteractionState),
}

impl LedCommand {
    const fn method(self) -> &'static str {
        match self {
            Self::Set(_) => "set_condition",
            Self::Clear(_) => "clear_condition",
        }
    }

    const fn state(self) -> InteractionState {
        match self {
            Self::Set(state) | Self::Clear(state) => state,
        }
    }
}

/// Tracks which condition is lit and computes the calls for a transition
///
/// Idle has no lit condition: entering idle clears the current one, leaving
/// idle sets the new one, and moving between busy states swaps them.
#[derive(Debug, Clone, Copy)]
pub struct LedTracker {
    current: InteractionState,
}

impl Default for LedTracker {
    fn default() -> Self {
        Self {
            current: InteractionState::Idle,
        }
    }
}

impl LedTracker {
    /// Calls that reset the LEDs at startup
    #[must_use]
    pub fn init_commands() -> Vec<LedCommand> {
        vec![
            LedCommand::Clear(InteractionState::Listening),
            LedCommand::Clear(InteractionState::Thinking),
            LedCommand::Clear(InteractionState::Speaking),
        ]
    }

    /// Move to `next`, returning the LED calls to make
    pub fn transition(&mut self, next: InteractionState) -> Vec<LedCommand> {
        let previous = self.current;
        if previous == next {
            return Vec::new();
        }
        self.current = next;

        match (previous, next) {
            (InteractionState::Idle, _) => vec![LedCommand::Set(next)],
            (_, InteractionState::Idle) => vec![LedCommand::Clear(previous)],
            _ => vec![LedCommand::Clear(previous), LedCommand::Set(next)],
        }
    }

    /// Currently lit state
    #[must_use]
    pub const fn current(&self) -> InteractionState {
        self.current
    }
}

/// Notifier that drives device LEDs over ubus and plays sound cues
pub struct LedNotifier {
    tx: Option<Sender<InteractionState>>,
    worker: Option<JoinHandle<()>>,
}

impl LedNotifier {
    /// Start the notifier worker
    ///
    /// `ubus_socket` overrides the ubus socket path; `sounds_dir` holds the
    /// cue WAV files.
    ///
    /// # Errors
    ///
    /// Returns error if the worker thread cannot be spawned
    pub fn start(ubus_socket: Option<String>, sounds_dir: PathBuf) -> Result<Self> {
        if which::which("ubus").is_err() {
            tracing::warn!("ubus not found in PATH, LED updates will fail");
        }
        if which::which("aplay").is_err() {
            tracing::warn!("aplay not found in PATH, sound cues disabled");
        }

        let (tx, rx) = unbounded();
        let worker = Worker {
            ubus_socket,
            sounds_dir,
            tracker: LedTracker::default(),
        };
        let handle = std::thread::Builder::new()
            .name("hark-led".to_string())
            .spawn(move || worker.run(&rx))?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(handle),
        })
    }
}

impl StateNotifier for LedNotifier {
    fn notify(&self, state: InteractionState) {
        tracing::info!(%state, "interaction state");
        if let Some(tx) = &self.tx
            && tx.send(state).is_err()
        {
            tracing::warn!(%state, "LED worker gone, dropping state change");
        }
    }
}

impl Drop for LedNotifier {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop
        self.tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

struct Worker {
    ubus_socket: Option<String>,
    sounds_dir: PathBuf,
    tracker: LedTracker,
}

impl Worker {
    fn run(mut self, rx: &Receiver<InteractionState>) {
        for command in LedTracker::init_commands() {
            self.call_ledmgr(command);
        }

        while let Ok(state) = rx.recv() {
            for command in self.tracker.transition(state) {
                self.call_ledmgr(command);
            }
            self.play_cue(state);
        }
        tracing::debug!("LED worker exited");
    }

    fn call_ledmgr(&self, command: LedCommand) {
        let message = serde_json::json!({ "name": led_condition(command.state()) }).to_string();

        let mut cmd = Command::new("ubus");
        if let Some(socket) = &self.ubus_socket {
            cmd.arg("-s").arg(socket);
        }
        cmd.args(["call", "ledmgr", command.method(), &message])
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match cmd.status() {
            Ok(status) if status.success() => {
                tracing::debug!(?command, "ledmgr updated");
            }
            Ok(status) => tracing::warn!(?command, %status, "ledmgr call failed"),
            Err(e) => tracing::warn!(?command, error = %e, "failed to run ubus"),
        }
    }

    fn play_cue(&self, state: InteractionState) {
        let sound = match state {
            InteractionState::Listening => {
                std::thread::sleep(LISTENING_CUE_DELAY);
                WAKE_SOUND
            }
            InteractionState::Thinking => ENDPOINT_SOUND,
            _ => return,
        };
        play_sound(&self.sounds_dir.join(sound));
    }
}

fn play_sound(path: &Path) {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "sound cue missing");
        return;
    }

    match Command::new("aplay")
        .arg("-q")
        .arg(path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => tracing::warn!(path = %path.display(), %status, "aplay failed"),
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to run aplay"),
    }
}
