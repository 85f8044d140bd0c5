//! Error types for the hark assistant

use thiserror::Error;

/// Result type alias for hark operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the assistant
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio error (playback, format conversion)
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture device could not be opened or configured
    #[error("capture device error: {0}")]
    Device(#[from] DeviceError),

    /// Wake word engine error
    #[error("wake word engine error: {0}")]
    Engine(#[from] EngineError),

    /// Dialog transport failure (connect, stream finalize)
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed dialog message
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Failure to open or configure a capture device
///
/// Fatal to that capture attempt; the orchestrator retries on the next wake cycle.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// No input device matched the request
    #[error("no input device available: {0}")]
    NotFound(String),

    /// The device refused the requested format
    #[error("unsupported capture format: {0}")]
    UnsupportedFormat(String),

    /// The stream could not be built or started
    #[error("failed to start capture stream: {0}")]
    Stream(String),
}

/// Failure reported by the wake word engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    /// Model file missing or unreadable
    #[error("failed to load model {path}: {detail}")]
    Load {
        /// Model path
        path: String,
        /// Engine-provided detail
        detail: String,
    },

    /// A runtime option could not be applied
    #[error("failed to apply {option}: {detail}")]
    Option {
        /// Option name
        option: &'static str,
        /// Engine-provided detail
        detail: String,
    },

    /// Session duplication failed
    #[error("failed to duplicate session: {0}")]
    Duplicate(String),

    /// Processing audio failed
    #[error("failed to process audio: {0}")]
    Process(String),
}
