//! Audio capture from microphone
//!
//! The capture contract is chunk-oriented: a device hands out fixed-size
//! chunks of 16-bit mono PCM, and reports every abnormal condition as a typed
//! [`ReadOutcome`] so callers decide how to recover.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, SampleRate, Stream, StreamError};
use thiserror::Error;

use crate::error::DeviceError;
use crate::{Error, Result};

/// Sample rate for audio capture (16kHz for speech)
pub const SAMPLE_RATE: u32 = 16000;

/// Frames per chunk (100ms at 16kHz)
pub const CHUNK_FRAMES: usize = 1600;

/// Mono S16LE
pub const BYTES_PER_FRAME: usize = 2;

/// How many chunks the callback may queue before the reader is considered overrun
const QUEUE_CHUNKS: usize = 16;

/// A block of captured PCM audio
///
/// Owned and immutable; each chunk goes to exactly one consumer.
#[derive(Debug, PartialEq, Eq)]
pub struct AudioChunk {
    data: Vec<u8>,
    frames: usize,
}

impl AudioChunk {
    /// Build a chunk from 16-bit samples
    #[must_use]
    pub fn from_samples(samples: &[i16]) -> Self {
        let data = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        Self {
            data,
            frames: samples.len(),
        }
    }

    /// Build a chunk from little-endian PCM bytes
    ///
    /// A trailing odd byte is not a whole frame and is discarded.
    #[must_use]
    pub fn from_bytes(mut data: Vec<u8>) -> Self {
        let frames = data.len() / BYTES_PER_FRAME;
        data.truncate(frames * BYTES_PER_FRAME);
        Self { data, frames }
    }

    /// Raw PCM bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Consume the chunk, yielding its bytes
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Number of frames (samples, since audio is mono)
    #[must_use]
    pub const fn frames(&self) -> usize {
        self.frames
    }

    /// Whether the chunk carries no audio
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.frames == 0
    }

    /// Decode the samples
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_FRAME)
            .map(|b| i16::from_le_bytes([b[0], b[1]]))
    }

    /// RMS level normalized to [0.0, 1.0]
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn rms(&self) -> f32 {
        if self.frames == 0 {
            return 0.0;
        }
        let sum_squares: f32 = self
            .samples()
            .map(|s| {
                let v = f32::from(s) / 32768.0;
                v * v
            })
            .sum();
        (sum_squares / self.frames as f32).sqrt()
    }
}

/// Abnormal result of a chunk read
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Not enough audio buffered yet; back off briefly and retry
    #[error("capture buffer empty, retry")]
    TransientRetry,
    /// Audio was lost because the reader fell behind
    #[error("capture overrun, audio lost")]
    Overrun,
    /// Device temporarily suspended; retry without discarding state
    #[error("capture device suspended")]
    SuspendedRecoverable,
    /// Device is unusable
    #[error("capture device failed")]
    Fatal,
}

/// An open capture device
///
/// Exclusive to one reader. `close` may be called after any outcome and more
/// than once.
pub trait CaptureDevice {
    /// Read the next chunk
    ///
    /// # Errors
    ///
    /// Returns a [`ReadOutcome`] describing why no chunk is available
    fn read_chunk(&mut self) -> std::result::Result<AudioChunk, ReadOutcome>;

    /// Release the device
    fn close(&mut self);
}

/// Opens capture devices
///
/// Shared between the wake listener and the dialog uplink; only one of them
/// holds an open device at a time.
pub trait CaptureSource: Send + Sync {
    /// Open the device for reading
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or configured
    fn open(&self) -> std::result::Result<Box<dyn CaptureDevice>, DeviceError>;
}

/// Samples queued by the cpal callback, drained in fixed chunks by the reader
#[derive(Debug)]
struct SampleQueue {
    samples: VecDeque<i16>,
    capacity: usize,
    overrun: bool,
    fault: Option<ReadOutcome>,
}

impl SampleQueue {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            overrun: false,
            fault: None,
        }
    }

    fn push(&mut self, data: impl ExactSizeIterator<Item = i16>) {
        if self.samples.len() + data.len() > self.capacity {
            // Mirrors a driver overrun: what was queued is stale, start over
            self.samples.clear();
            self.overrun = true;
            return;
        }
        self.samples.extend(data);
    }

    fn fail(&mut self, outcome: ReadOutcome) {
        // A fatal fault is never downgraded
        if self.fault != Some(ReadOutcome::Fatal) {
            self.fault = Some(outcome);
        }
    }

    fn take_chunk(&mut self, frames: usize) -> std::result::Result<AudioChunk, ReadOutcome> {
        match self.fault {
            Some(ReadOutcome::Fatal) => return Err(ReadOutcome::Fatal),
            Some(outcome) => {
                self.fault = None;
                return Err(outcome);
            }
            None => {}
        }

        if self.overrun {
            self.overrun = false;
            return Err(ReadOutcome::Overrun);
        }

        if self.samples.len() < frames {
            return Err(ReadOutcome::TransientRetry);
        }

        let samples: Vec<i16> = self.samples.drain(..frames).collect();
        Ok(AudioChunk::from_samples(&samples))
    }
}

/// Capture source backed by a cpal input device
#[derive(Debug, Clone)]
pub struct CpalCapture {
    device_name: Option<String>,
    chunk_frames: usize,
}

impl CpalCapture {
    /// Create a capture source
    ///
    /// `device_name` selects an input by name; `None` uses the system default.
    #[must_use]
    pub fn new(device_name: Option<String>, chunk_frames: usize) -> Self {
        Self {
            device_name,
            chunk_frames: chunk_frames.max(1),
        }
    }

    /// List input device names
    ///
    /// # Errors
    ///
    /// Returns error if the host cannot enumerate devices
    pub fn list_devices() -> Result<Vec<String>> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| Error::Audio(e.to_string()))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn find_device(&self) -> std::result::Result<cpal::Device, DeviceError> {
        let host = cpal::default_host();
        match &self.device_name {
            Some(name) => host
                .input_devices()
                .map_err(|e| DeviceError::NotFound(e.to_string()))?
                .find(|d| d.name().is_ok_and(|n| &n == name))
                .ok_or_else(|| DeviceError::NotFound(format!("input device '{name}' not found"))),
            None => host
                .default_input_device()
                .ok_or_else(|| DeviceError::NotFound("no default input device".to_string())),
        }
    }
}

impl CaptureSource for CpalCapture {
    fn open(&self) -> std::result::Result<Box<dyn CaptureDevice>, DeviceError> {
        let device = self.find_device()?;

        let supported = device
            .supported_input_configs()
            .map_err(|e| DeviceError::UnsupportedFormat(e.to_string()))?
            .filter(|c| {
                c.channels() == 1
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
                    && matches!(c.sample_format(), SampleFormat::I16 | SampleFormat::F32)
            })
            .min_by_key(|c| c.sample_format() != SampleFormat::I16)
            .ok_or_else(|| {
                DeviceError::UnsupportedFormat("no mono 16kHz input config".to_string())
            })?
            .with_sample_rate(SampleRate(SAMPLE_RATE));

        let format = supported.sample_format();
        let config = supported.config();
        let queue = Arc::new(Mutex::new(SampleQueue::new(self.chunk_frames * QUEUE_CHUNKS)));

        let stream = match format {
            SampleFormat::I16 => {
                let queue_cb = Arc::clone(&queue);
                device.build_input_stream(
                    &config,
                    move |data: &[i16], _: &cpal::InputCallbackInfo| {
                        if let Ok(mut q) = queue_cb.lock() {
                            q.push(data.iter().copied());
                        }
                    },
                    stream_error_handler(Arc::clone(&queue)),
                    None,
                )
            }
            _ => {
                let queue_cb = Arc::clone(&queue);
                device.build_input_stream(
                    &config,
                    move |data: &[f32], _: &cpal::InputCallbackInfo| {
                        if let Ok(mut q) = queue_cb.lock() {
                            q.push(data.iter().map(|&s| f32_to_i16(s)));
                        }
                    },
                    stream_error_handler(Arc::clone(&queue)),
                    None,
                )
            }
        }
        .map_err(|e| DeviceError::Stream(e.to_string()))?;

        stream
            .play()
            .map_err(|e| DeviceError::Stream(e.to_string()))?;

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            ?format,
            chunk_frames = self.chunk_frames,
            "capture device opened"
        );

        Ok(Box::new(CpalCaptureDevice {
            stream: Some(stream),
            queue,
            chunk_frames: self.chunk_frames,
        }))
    }
}

fn stream_error_handler(
    queue: Arc<Mutex<SampleQueue>>,
) -> impl FnMut(StreamError) + Send + 'static {
    move |err| {
        let outcome = match err {
            StreamError::DeviceNotAvailable => ReadOutcome::Fatal,
            StreamError::BackendSpecific { .. } => ReadOutcome::SuspendedRecoverable,
        };
        tracing::warn!(error = %err, ?outcome, "capture stream error");
        if let Ok(mut q) = queue.lock() {
            q.fail(outcome);
        }
    }
}

/// Open cpal input stream
struct CpalCaptureDevice {
    stream: Option<Stream>,
    queue: Arc<Mutex<SampleQueue>>,
    chunk_frames: usize,
}

impl CaptureDevice for CpalCaptureDevice {
    fn read_chunk(&mut self) -> std::result::Result<AudioChunk, ReadOutcome> {
        if self.stream.is_none() {
            return Err(ReadOutcome::Fatal);
        }
        let Ok(mut queue) = self.queue.lock() else {
            return Err(ReadOutcome::Fatal);
        };
        queue.take_chunk(self.chunk_frames)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("capture device closed");
        }
    }
}

impl Drop for CpalCaptureDevice {
    fn drop(&mut self) {
        self.close();
    }
}

/// Convert an f32 sample in [-1.0, 1.0] to i16
#[allow(clippy::cast_possible_truncation)]
#[must_use]
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample * 32767.0).clamp(-32768.0, 32767.0) as i16
}

/// Encode 16-bit samples as a mono WAV file
///
/// # Errors
///
/// Returns error if WAV encoding fails
pub fn samples_to_wav(samples: &[i16], sample_rate: u32) -> Result<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut cursor = std::io::Cursor::new(Vec::new());
    {
        let mut writer =
            hound::WavWriter::new(&mut cursor, spec).map_err(|e| Error::Audio(e.to_string()))?;

        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| Error::Audio(e.to_string()))?;
        }

        writer.finalize().map_err(|e| Error::Audio(e.to_string()))?;
    }

    Ok(cursor.into_inner())
}
