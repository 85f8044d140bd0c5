//! Audio playback to speakers
//!
//! Response audio arrives in small LINEAR16 chunks while the dialog is still
//! streaming, so playback is a queue drained by a cpal output stream that
//! lives on its own thread (cpal streams aren't `Send`).

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleRate, StreamConfig};
use crossbeam_channel::{Sender, bounded};

use super::capture::{AudioChunk, SAMPLE_RATE};
use crate::{Error, Result};

/// Upper bound on queued audio (30 seconds)
const MAX_QUEUED_SAMPLES: usize = SAMPLE_RATE as usize * 30;

/// Extra time allowed for the device to drain after the queue empties
pub const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Receives response audio from a dialog turn
///
/// Implementations must not block in `send`; the dialog read loop calls it
/// for every audio frame.
pub trait PlaybackSink: Send {
    /// Prepare the output for a turn
    ///
    /// # Errors
    ///
    /// Returns error if the output cannot be opened
    fn start(&mut self) -> Result<()>;

    /// Queue LINEAR16 audio bytes
    ///
    /// # Errors
    ///
    /// Returns error if the output is not started
    fn send(&mut self, audio: Vec<u8>) -> Result<()>;

    /// Release the output, discarding anything still queued
    ///
    /// Callers that want queued audio heard wait for [`PlaybackSink::buffered`]
    /// to reach zero first.
    ///
    /// # Errors
    ///
    /// Returns error if the output thread failed
    fn stop(&mut self) -> Result<()>;

    /// Audio queued but not yet played
    fn buffered(&self) -> Duration {
        Duration::ZERO
    }
}

struct PlaybackWorker {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// Plays queued audio on the default (or named) output device
pub struct AudioPlayback {
    device_name: Option<String>,
    queue: Arc<Mutex<VecDeque<f32>>>,
    worker: Option<PlaybackWorker>,
}

impl AudioPlayback {
    /// Create a playback sink; the device is opened on `start`
    #[must_use]
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            queue: Arc::new(Mutex::new(VecDeque::new())),
            worker: None,
        }
    }

    fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or_default()
    }

    /// Block until queued audio has played, bounded by its length plus a grace
    pub fn drain(&self) {
        let deadline = Instant::now() + self.buffered() + DRAIN_GRACE;

        while self.queued() > 0 {
            if Instant::now() > deadline {
                tracing::warn!(remaining = self.queued(), "playback drain timed out");
                break;
            }
            std::thread::sleep(Duration::from_millis(20));
        }
    }
}

impl PlaybackSink for AudioPlayback {
    fn start(&mut self) -> Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = bounded::<Result<()>>(1);
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let queue = Arc::clone(&self.queue);
        let device_name = self.device_name.clone();

        let handle = std::thread::Builder::new()
            .name("hark-playback".to_string())
            .spawn(move || {
                let stream = match open_output_stream(device_name.as_deref(), queue) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Block until stop; the stream plays while it is alive
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(PlaybackWorker { stop_tx, handle });
                tracing::debug!("playback started");
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::Audio("playback thread exited".to_string()))
            }
        }
    }

    fn send(&mut self, audio: Vec<u8>) -> Result<()> {
        if self.worker.is_none() {
            return Err(Error::Audio("playback not started".to_string()));
        }

        let chunk = AudioChunk::from_bytes(audio);
        let mut queue = self
            .queue
            .lock()
            .map_err(|_| Error::Audio("playback queue poisoned".to_string()))?;
        queue.extend(chunk.samples().map(|s| f32::from(s) / 32768.0));

        if queue.len() > MAX_QUEUED_SAMPLES {
            let excess = queue.len() - MAX_QUEUED_SAMPLES;
            queue.drain(..excess);
            tracing::warn!(dropped = excess, "playback queue full, dropped oldest audio");
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };

        let _ = worker.stop_tx.send(());
        worker
            .handle
            .join()
            .map_err(|_| Error::Audio("playback thread panicked".to_string()))?;

        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
        tracing::debug!("playback stopped");
        Ok(())
    }

    fn buffered(&self) -> Duration {
        let queued = self.queued() as u64;
        Duration::from_millis(queued * 1000 / u64::from(SAMPLE_RATE))
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.stop_tx.send(());
            let _ = worker.handle.join();
        }
    }
}

fn open_output_stream(
    device_name: Option<&str>,
    queue: Arc<Mutex<VecDeque<f32>>>,
) -> Result<cpal::Stream> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => host
            .output_devices()
            .map_err(|e| Error::Audio(e.to_string()))?
            .find(|d| d.name().is_ok_and(|n| n == name))
            .ok_or_else(|| Error::Audio(format!("output device '{name}' not found")))?,
        None => host
            .default_output_device()
            .ok_or_else(|| Error::Audio("no output device available".to_string()))?,
    };

    let config = output_config(&device)?;
    let channels = usize::from(config.channels);

    let stream = device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                let Ok(mut queue) = queue.lock() else {
                    data.fill(0.0);
                    return;
                };
                for frame in data.chunks_mut(channels) {
                    let sample = queue.pop_front().unwrap_or(0.0);
                    frame.fill(sample);
                }
            },
            |err| {
                tracing::error!(error = %err, "audio playback error");
            },
            None,
        )
        .map_err(|e| Error::Audio(e.to_string()))?;

    stream.play().map_err(|e| Error::Audio(e.to_string()))?;

    tracing::debug!(
        device = %device.name().unwrap_or_default(),
        sample_rate = SAMPLE_RATE,
        channels,
        "audio playback initialized"
    );
    Ok(stream)
}

fn output_config(device: &cpal::Device) -> Result<StreamConfig> {
    let supports_rate = |c: &cpal::SupportedStreamConfigRange, channels: u16| {
        c.channels() == channels
            && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
            && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
    };

    let supported = device
        .supported_output_configs()
        .map_err(|e| Error::Audio(e.to_string()))?
        .find(|c| supports_rate(c, 1))
        .or_else(|| {
            // Fallback: try stereo
            device
                .supported_output_configs()
                .ok()?
                .find(|c| supports_rate(c, 2))
        })
        .ok_or_else(|| Error::Audio("no suitable output config found".to_string()))?;

    Ok(supported.with_sample_rate(SampleRate(SAMPLE_RATE)).config())
}

/// Generate a LINEAR16 sine tone, used by the speaker self-test
#[must_use]
#[allow(
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::cast_precision_loss
)]
pub fn sine_tone(frequency: f32, duration: Duration, amplitude: f32) -> Vec<u8> {
    let num_samples = (SAMPLE_RATE as f32 * duration.as_secs_f32()) as usize;
    let samples: Vec<i16> = (0..num_samples)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            super::capture::f32_to_i16(amplitude * (2.0 * std::f32::consts::PI * frequency * t).sin())
        })
        .collect();
    AudioChunk::from_samples(&samples).into_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_requires_start() {
        let mut playback = AudioPlayback::new(None);
        assert!(playback.send(vec![0, 0]).is_err());
        // Stopping an idle sink is a no-op
        assert!(playback.stop().is_ok());
    }

    #[test]
    fn test_idle_sink_has_nothing_buffered() {
        let playback = AudioPlayback::new(None);
        assert_eq!(playback.buffered(), Duration::ZERO);
    }

    #[test]
    fn test_sine_tone_length() {
        let tone = sine_tone(440.0, Duration::from_millis(100), 0.3);
        assert_eq!(tone.len(), 1600 * 2);
        let chunk = AudioChunk::from_bytes(tone);
        assert!(chunk.rms() > 0.1);
    }
}
