//! Voice processing module
//!
//! Handles audio capture, keyword spotting, the wake listener loop and
//! response playback. The dialog side lives in `crate::dialog`.

mod capture;
mod listener;
mod playback;
#[cfg(feature = "wake-word")]
mod rustpotter;
mod spotter;

pub use capture::{
    AudioChunk, BYTES_PER_FRAME, CHUNK_FRAMES, CaptureDevice, CaptureSource, CpalCapture,
    ReadOutcome, SAMPLE_RATE, f32_to_i16, samples_to_wav,
};
pub use listener::{
    Detection, ListenOutcome, ListenReport, ListenerHandle, ListenerState, RETRY_BACKOFF,
    StopSignal, WakeListener,
};
pub use playback::{AudioPlayback, DRAIN_GRACE, PlaybackSink, sine_tone};
#[cfg(feature = "wake-word")]
pub use rustpotter::RustpotterEngine;
pub use spotter::{
    DetectionEngine, DetectionOutcome, EngineSession, KeywordSpotter, ResultHandler, SpotResult,
    TRIGGER_PHRASE, Task,
};
