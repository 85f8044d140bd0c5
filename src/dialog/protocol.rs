//! Dialog wire messages
//!
//! One JSON object per frame. Binary fields (audio, conversation state) are
//! base64 strings.

use serde::{Deserialize, Serialize};

use crate::voice::SAMPLE_RATE;

/// Opaque continuation token issued by the dialog service
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationState(#[serde(with = "b64")] Vec<u8>);

impl ConversationState {
    /// Wrap raw token bytes
    #[must_use]
    pub const fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    /// Raw token bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the token carries no data
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for ConversationState {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

/// Audio sample encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AudioEncoding {
    /// Signed 16-bit little-endian PCM
    #[default]
    Linear16,
}

/// Format of the audio sent to the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioInConfig {
    /// Sample encoding of `audio_in` frames
    pub encoding: AudioEncoding,
    /// Capture sample rate
    pub sample_rate_hertz: u32,
}

impl Default for AudioInConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sample_rate_hertz: SAMPLE_RATE,
        }
    }
}

/// Format of the audio the service answers with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioOutConfig {
    /// Requested encoding of `audio_out` frames
    pub encoding: AudioEncoding,
    /// Requested playback sample rate
    pub sample_rate_hertz: u32,
    /// Output volume, 0 to 100
    pub volume_percentage: u8,
}

impl Default for AudioOutConfig {
    fn default() -> Self {
        Self {
            encoding: AudioEncoding::Linear16,
            sample_rate_hertz: SAMPLE_RATE,
            volume_percentage: 100,
        }
    }
}

/// First message of every turn
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnConfig {
    /// Format of the audio we send
    pub audio_in_config: AudioInConfig,
    /// Format of the audio we want back
    pub audio_out_config: AudioOutConfig,
    /// Language of the conversation, e.g. `en-US`
    pub locale: String,
    /// Identifies this device instance
    pub device_id: String,
    /// Identifies the device model
    pub device_model_id: String,
    /// Absent on the first turn of a wake cycle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_state: Option<ConversationState>,
}

/// Client to service frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DialogRequest {
    /// Turn configuration, sent exactly once before any audio
    Config(TurnConfig),
    /// Captured LINEAR16 audio
    AudioIn {
        #[serde(with = "b64")]
        audio: Vec<u8>,
    },
}

/// Service event flag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    /// The service heard the end of the user's request
    EndOfUtterance,
    #[serde(other)]
    Unspecified,
}

/// Whether the service expects another turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicrophoneMode {
    /// Conversation over; return to wake word listening
    CloseMicrophone,
    /// Open the microphone again for a follow-up
    DialogFollowOn,
    #[serde(other)]
    Unspecified,
}

/// Interim recognition of the user's speech
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechResult {
    /// Recognized text so far
    pub transcript: String,
    /// How likely the transcript is to change, 0.0 to 1.0
    #[serde(default)]
    pub stability: f32,
}

/// Final status of a turn, sent by the service as its last frame
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamStatus {
    /// Zero on success
    pub code: i32,
    /// Failure detail
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl StreamStatus {
    /// Whether the turn completed successfully
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.code == 0
    }
}

/// Service to client frame; every field is optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DialogResponse {
    /// Recognition event, such as end of utterance
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_type: Option<EventType>,
    /// Whether to reopen the microphone after this turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub microphone_mode: Option<MicrophoneMode>,
    /// Token to carry into the next turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_state: Option<ConversationState>,
    /// Response audio, played as it arrives
    #[serde(with = "b64_opt", skip_serializing_if = "Option::is_none")]
    pub audio_out: Option<Vec<u8>>,
    /// Device action payload, passed through uninterpreted
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_action: Option<String>,
    /// Interim transcripts of the user's speech
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub speech_results: Vec<SpeechResult>,
    /// Service-side failure for this turn
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// End-of-turn status; consumed by the transport
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StreamStatus>,
}

impl DialogResponse {
    /// Whether the frame carries nothing for the session
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_type.is_none()
            && self.microphone_mode.is_none()
            && self.conversation_state.is_none()
            && self.audio_out.is_none()
            && self.device_action.is_none()
            && self.speech_results.is_empty()
            && self.error.is_none()
    }
}

mod b64 {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

mod b64_opt {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        Option::<String>::deserialize(deserializer)?
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
