//! One conversational turn with the dialog service

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use uuid::Uuid;

use super::protocol::{
    AudioInConfig, AudioOutConfig, ConversationState, DialogRequest, DialogResponse, EventType,
    MicrophoneMode, TurnConfig,
};
use super::transport::{DialogStream, DialogTransport};
use super::uplink::AudioUplink;
use crate::Result;
use crate::notify::{InteractionState, StateNotifier};
use crate::voice::{CaptureSource, DRAIN_GRACE, PlaybackSink, RETRY_BACKOFF};

/// Interval between checks on queued response audio
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Dialog session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    /// Stream opened, config not yet sent
    Opening,
    /// Sending audio and reading responses
    Streaming,
    /// Audio closed, still reading responses
    AudioStopped,
    /// Stream finished
    Closed,
}

/// Device identity and preferences sent with every turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogSettings {
    /// Conversation language, e.g. `en-US`
    pub locale: String,
    /// Identifies this device instance to the service
    pub device_id: String,
    /// Identifies the device model to the service
    pub device_model_id: String,
    /// Response volume, 0 to 100
    pub volume_percentage: u8,
}

impl Default for DialogSettings {
    fn default() -> Self {
        Self {
            locale: "en-US".to_string(),
            device_id: "hark".to_string(),
            device_model_id: "hark-device".to_string(),
            volume_percentage: 100,
        }
    }
}

impl DialogSettings {
    /// Build the config message for a turn
    #[must_use]
    pub fn turn_config(&self, conversation_state: Option<ConversationState>) -> TurnConfig {
        TurnConfig {
            audio_in_config: AudioInConfig::default(),
            audio_out_config: AudioOutConfig {
                volume_percentage: self.volume_percentage,
                ..AudioOutConfig::default()
            },
            locale: self.locale.clone(),
            device_id: self.device_id.clone(),
            device_model_id: self.device_model_id.clone(),
            conversation_state,
        }
    }
}

/// Result of a completed turn
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TurnOutcome {
    /// The service asked for a follow-on turn
    pub continue_dialog: bool,
    /// Token for the next turn's config
    pub conversation_state: Option<ConversationState>,
    /// Device action payloads received, in arrival order
    pub device_actions: Vec<String>,
}

/// Runs a single turn: config, audio up, responses down
pub struct DialogSession<'a> {
    transport: &'a dyn DialogTransport,
    capture: Arc<dyn CaptureSource>,
    playback: &'a mut dyn PlaybackSink,
    notifier: &'a dyn StateNotifier,
    settings: &'a DialogSettings,
    backoff: Duration,
    state: DialogState,
    turn: Uuid,
}

impl<'a> DialogSession<'a> {
    /// Create a session over its collaborators
    pub fn new(
        transport: &'a dyn DialogTransport,
        capture: Arc<dyn CaptureSource>,
        playback: &'a mut dyn PlaybackSink,
        notifier: &'a dyn StateNotifier,
        settings: &'a DialogSettings,
    ) -> Self {
        Self {
            transport,
            capture,
            playback,
            notifier,
            settings,
            backoff: RETRY_BACKOFF,
            state: DialogState::Opening,
            turn: Uuid::new_v4(),
        }
    }

    /// Override the capture retry backoff
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> DialogState {
        self.state
    }

    /// Run the turn to completion
    ///
    /// `carried` is the token returned by the previous turn, if any.
    ///
    /// # Errors
    ///
    /// Returns error if the stream cannot be opened, the config cannot be
    /// sent, or the stream finishes with a failure status
    pub async fn run(mut self, carried: Option<ConversationState>) -> Result<TurnOutcome> {
        tracing::debug!(turn = %self.turn, carried = carried.is_some(), "opening dialog stream");
        let stream = self.transport.open().await?;

        if let Err(e) = self.playback.start() {
            tracing::warn!(turn = %self.turn, error = %e, "failed to start playback");
        }

        let result = self.exchange(stream, carried).await;

        if result.is_ok() {
            self.drain_playback().await;
        }
        if let Err(e) = self.playback.stop() {
            tracing::warn!(turn = %self.turn, error = %e, "failed to stop playback");
        }
        self.transition(DialogState::Closed);

        match &result {
            Ok(outcome) => tracing::info!(
                turn = %self.turn,
                continue_dialog = outcome.continue_dialog,
                actions = outcome.device_actions.len(),
                "dialog turn finished"
            ),
            Err(e) => tracing::error!(turn = %self.turn, error = %e, "dialog turn failed"),
        }
        result
    }

    async fn exchange(
        &mut self,
        stream: DialogStream,
        carried: Option<ConversationState>,
    ) -> Result<TurnOutcome> {
        let (sender, mut responses, finisher) = stream.into_parts();

        let config = self.settings.turn_config(carried.clone());
        sender.write(DialogRequest::Config(config)).await?;

        let mut uplink = AudioUplink::start(Arc::clone(&self.capture), sender, self.backoff).await?;
        self.transition(DialogState::Streaming);

        let mut outcome = TurnOutcome {
            continue_dialog: false,
            conversation_state: carried,
            device_actions: Vec::new(),
        };
        let mut speaking = false;

        while let Some(response) = responses.read().await {
            self.apply(response, &uplink, &mut outcome, &mut speaking);
        }
        tracing::debug!(turn = %self.turn, "response stream closed by peer");

        self.stop_audio(&uplink);
        uplink.finish().await;
        finisher.finish().await?;

        Ok(outcome)
    }

    /// Let queued response audio play out before the output is released
    async fn drain_playback(&mut self) {
        let deadline = Instant::now() + self.playback.buffered() + DRAIN_GRACE;
        loop {
            let remaining = self.playback.buffered();
            if remaining.is_zero() {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    turn = %self.turn,
                    remaining_ms = remaining.as_millis(),
                    "playback drain timed out"
                );
                break;
            }
            tokio::time::sleep(DRAIN_POLL).await;
        }
    }

    fn apply(
        &mut self,
        response: DialogResponse,
        uplink: &AudioUplink,
        outcome: &mut TurnOutcome,
        speaking: &mut bool,
    ) {
        if let Some(error) = response.error {
            tracing::error!(turn = %self.turn, error = %error, "dialog service reported an error");
            self.stop_audio(uplink);
            self.notifier.notify(InteractionState::Error);
        }

        for result in &response.speech_results {
            tracing::info!(
                turn = %self.turn,
                transcript = %result.transcript,
                stability = result.stability,
                "speech recognized"
            );
        }

        if response.event_type == Some(EventType::EndOfUtterance) {
            tracing::debug!(turn = %self.turn, "end of utterance");
            if self.stop_audio(uplink) {
                self.notifier.notify(InteractionState::Thinking);
            }
        }

        match response.microphone_mode {
            Some(MicrophoneMode::DialogFollowOn) => {
                tracing::debug!(turn = %self.turn, "follow-on requested");
                outcome.continue_dialog = true;
            }
            Some(MicrophoneMode::CloseMicrophone) => {
                tracing::debug!(turn = %self.turn, "microphone closed by service");
                outcome.continue_dialog = false;
            }
            Some(MicrophoneMode::Unspecified) | None => {}
        }

        if let Some(state) = response.conversation_state
            && !state.is_empty()
        {
            tracing::debug!(turn = %self.turn, bytes = state.as_bytes().len(), "conversation state updated");
            outcome.conversation_state = Some(state);
        }

        if let Some(audio) = response.audio_out {
            self.stop_audio(uplink);
            if !*speaking {
                *speaking = true;
                self.notifier.notify(InteractionState::Speaking);
            }
            if let Err(e) = self.playback.send(audio) {
                tracing::warn!(turn = %self.turn, error = %e, "failed to queue response audio");
            }
        }

        if let Some(action) = response.device_action {
            tracing::info!(turn = %self.turn, action = %action, "device action received");
            outcome.device_actions.push(action);
        }
    }

    /// Close outbound audio; returns `true` only when this call closed it
    fn stop_audio(&mut self, uplink: &AudioUplink) -> bool {
        if self.state != DialogState::Streaming {
            return false;
        }
        uplink.stop();
        self.transition(DialogState::AudioStopped);
        true
    }

    fn transition(&mut self, next: DialogState) {
        if self.state != next {
            tracing::debug!(turn = %self.turn, from = ?self.state, to = ?next, "dialog transition");
            self.state = next;
        }
    }
}
