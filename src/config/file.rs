//! TOML configuration file loading
//!
//! Supports `~/.config/hark/config.toml` as a persistent config source.
//! All fields are optional; the file is a partial overlay on top of defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::notify::NotifierKind;

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct HarkConfigFile {
    /// Audio devices
    #[serde(default)]
    pub audio: AudioFileConfig,

    /// Wake word model
    #[serde(default)]
    pub wake: WakeFileConfig,

    /// Dialog service
    #[serde(default)]
    pub dialog: DialogFileConfig,

    /// State indicator
    #[serde(default)]
    pub notify: NotifyFileConfig,
}

/// Audio device configuration
#[derive(Debug, Default, Deserialize)]
pub struct AudioFileConfig {
    /// Input device name (default system input if unset)
    pub capture_device: Option<String>,

    /// Output device name (default system output if unset)
    pub playback_device: Option<String>,

    /// Frames per capture read
    pub chunk_frames: Option<usize>,
}

/// Wake word configuration
#[derive(Debug, Default, Deserialize)]
pub struct WakeFileConfig {
    /// Path to the wake word model
    pub model_path: Option<String>,

    /// Detection threshold (0.0 to 1.0)
    pub threshold: Option<f32>,
}

/// Dialog service configuration
#[derive(Debug, Default, Deserialize)]
pub struct DialogFileConfig {
    /// Service address (`host:port`)
    pub endpoint: Option<String>,

    /// Conversation language (default `en-US`)
    pub locale: Option<String>,

    /// Device instance id (default derived from the host name)
    pub device_id: Option<String>,

    /// Device model id
    pub device_model_id: Option<String>,

    /// Response volume, 0 to 100
    pub volume_percentage: Option<u8>,
}

/// State indicator configuration
#[derive(Debug, Default, Deserialize)]
pub struct NotifyFileConfig {
    /// `log` or `ubus`
    pub kind: Option<NotifierKind>,

    /// ubus socket path override
    pub ubus_socket: Option<String>,

    /// Directory holding the sound cue WAV files
    pub sounds_dir: Option<String>,
}

/// Load the TOML config file from the standard path (or `HARK_CONFIG`)
///
/// Returns `HarkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> HarkConfigFile {
    let path = std::env::var("HARK_CONFIG")
        .ok()
        .map(PathBuf::from)
        .or_else(config_file_path);

    match path {
        Some(path) => load_config_from(&path),
        None => HarkConfigFile::default(),
    }
}

/// Load a config file from an explicit path
///
/// Returns `HarkConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_from(path: &Path) -> HarkConfigFile {
    if !path.exists() {
        return HarkConfigFile::default();
    }

    match std::fs::read_to_string(path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(config) => {
                tracing::info!(path = %path.display(), "loaded config file");
                config
            }
            Err(e) => {
                tracing::warn!(
                    path = %path.display(),
                    error = %e,
                    "failed to parse config file, using defaults"
                );
                HarkConfigFile::default()
            }
        },
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to read config file"
            );
            HarkConfigFile::default()
        }
    }
}

/// Return the config file path: `~/.config/hark/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| d.config_dir().join("hark").join("config.toml"))
}
