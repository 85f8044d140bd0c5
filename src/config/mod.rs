//! Configuration management for hark
//!
//! Resolution order is environment, then the TOML file, then defaults.

pub mod file;

use std::path::PathBuf;

use crate::dialog::{DEFAULT_ENDPOINT, DialogSettings};
use crate::notify::NotifierKind;
use crate::voice::CHUNK_FRAMES;
use crate::{Error, Result};

/// Default wake word detection threshold
pub const DEFAULT_THRESHOLD: f32 = 0.5;

/// Default sound cue directory on the device
pub const DEFAULT_SOUNDS_DIR: &str = "/etc/sounds";

/// Assistant configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Audio device configuration
    pub audio: AudioConfig,

    /// Wake word configuration
    pub wake: WakeConfig,

    /// Dialog service configuration
    pub dialog: DialogConfig,

    /// State indicator configuration
    pub notify: NotifyConfig,
}

/// Audio device configuration
#[derive(Debug, Clone)]
pub struct AudioConfig {
    /// Input device name; system default if unset
    pub capture_device: Option<String>,

    /// Output device name; system default if unset
    pub playback_device: Option<String>,

    /// Frames per capture read
    pub chunk_frames: usize,
}

/// Wake word configuration
#[derive(Debug, Clone)]
pub struct WakeConfig {
    /// Model file; required to listen
    pub model_path: Option<PathBuf>,

    /// Detection threshold
    pub threshold: f32,
}

/// Dialog service configuration
#[derive(Debug, Clone)]
pub struct DialogConfig {
    /// Service address (`host:port`)
    pub endpoint: String,

    /// Identity and preferences sent with each turn
    pub settings: DialogSettings,
}

/// State indicator configuration
#[derive(Debug, Clone)]
pub struct NotifyConfig {
    /// Which notifier reports interaction states
    pub kind: NotifierKind,

    /// ubus socket path override
    pub ubus_socket: Option<String>,

    /// Directory holding the sound cue WAV files
    pub sounds_dir: PathBuf,
}

impl Config {
    /// Load configuration from the process environment and config file
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    pub fn load() -> Result<Self> {
        let fc = file::load_config_file();
        Self::resolve(fc, |key| std::env::var(key).ok())
    }

    /// Resolve configuration from a parsed file and an env lookup
    ///
    /// # Errors
    ///
    /// Returns error if a configured value is out of range
    pub fn resolve<F>(fc: file::HarkConfigFile, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let audio = AudioConfig {
            capture_device: env("HARK_CAPTURE_DEVICE").or(fc.audio.capture_device),
            playback_device: env("HARK_PLAYBACK_DEVICE").or(fc.audio.playback_device),
            chunk_frames: fc.audio.chunk_frames.unwrap_or(CHUNK_FRAMES),
        };
        if audio.chunk_frames == 0 {
            return Err(Error::Config("audio.chunk_frames must be positive".to_string()));
        }

        let wake = WakeConfig {
            model_path: env("HARK_WAKE_MODEL")
                .or(fc.wake.model_path)
                .map(PathBuf::from),
            threshold: env("HARK_WAKE_THRESHOLD")
                .and_then(|s| s.parse().ok())
                .or(fc.wake.threshold)
                .unwrap_or(DEFAULT_THRESHOLD),
        };
        if !(0.0..=1.0).contains(&wake.threshold) {
            return Err(Error::Config(format!(
                "wake.threshold must be between 0 and 1, got {}",
                wake.threshold
            )));
        }

        let defaults = DialogSettings::default();
        let volume_percentage = fc
            .dialog
            .volume_percentage
            .unwrap_or(defaults.volume_percentage);
        if volume_percentage > 100 {
            return Err(Error::Config(format!(
                "dialog.volume_percentage must be at most 100, got {volume_percentage}"
            )));
        }

        let dialog = DialogConfig {
            endpoint: env("HARK_ENDPOINT")
                .or(fc.dialog.endpoint)
                .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string()),
            settings: DialogSettings {
                locale: env("HARK_LOCALE")
                    .or(fc.dialog.locale)
                    .unwrap_or(defaults.locale),
                device_id: env("HARK_DEVICE_ID")
                    .or(fc.dialog.device_id)
                    .unwrap_or_else(default_device_id),
                device_model_id: env("HARK_DEVICE_MODEL_ID")
                    .or(fc.dialog.device_model_id)
                    .unwrap_or(defaults.device_model_id),
                volume_percentage,
            },
        };

        let notify = NotifyConfig {
            kind: env("HARK_NOTIFY")
                .map(|s| NotifierKind::from_str(&s))
                .or(fc.notify.kind)
                .unwrap_or_default(),
            ubus_socket: env("HARK_UBUS_SOCKET").or(fc.notify.ubus_socket),
            sounds_dir: env("HARK_SOUNDS_DIR")
                .or(fc.notify.sounds_dir)
                .map_or_else(|| PathBuf::from(DEFAULT_SOUNDS_DIR), PathBuf::from),
        };

        Ok(Self {
            audio,
            wake,
            dialog,
            notify,
        })
    }
}

/// Device id derived from the host name
pub fn default_device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| format!("hark_{}", uuid::Uuid::new_v4()))
}
