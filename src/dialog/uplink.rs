//! Audio uplink: captured audio into the dialog request stream
//!
//! A capture thread reads chunks from its own device handle and hands them to
//! a forwarder task, which writes them as `audio_in` frames in capture order.
//! Stopping ends capture after the current read; chunks already captured are
//! still forwarded, then the request stream is half-closed.

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use super::protocol::DialogRequest;
use super::transport::RequestSender;
use crate::error::DeviceError;
use crate::voice::{AudioChunk, CaptureSource, ReadOutcome, StopSignal};
use crate::{Error, Result};

/// Chunks buffered between the capture thread and the forwarder
const UPLINK_BUFFER: usize = 32;

/// Counters reported when the uplink finishes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UplinkStats {
    /// Chunks read from the device
    pub captured: usize,
    /// Chunks written to the request stream
    pub sent: usize,
    /// Overruns reported by the device
    pub overruns: usize,
}

/// Streams captured audio into a dialog request stream
pub struct AudioUplink {
    stop: StopSignal,
    capture: Option<JoinHandle<CaptureCounters>>,
    forwarder: Option<tokio::task::JoinHandle<usize>>,
}

#[derive(Debug, Default)]
struct CaptureCounters {
    captured: usize,
    overruns: usize,
}

impl AudioUplink {
    /// Open the capture device and start forwarding
    ///
    /// Resolves once the device is open, so a turn never streams from a
    /// device that failed to open.
    ///
    /// # Errors
    ///
    /// Returns error if the capture thread cannot be spawned or the device
    /// cannot be opened
    pub async fn start(
        source: Arc<dyn CaptureSource>,
        sender: RequestSender,
        backoff: Duration,
    ) -> Result<Self> {
        let stop = StopSignal::new();
        let (chunk_tx, chunk_rx) = mpsc::channel(UPLINK_BUFFER);
        let (opened_tx, opened_rx) = oneshot::channel();

        let capture_stop = stop.clone();
        let capture = std::thread::Builder::new()
            .name("hark-uplink".to_string())
            .spawn(move || {
                capture_loop(source.as_ref(), opened_tx, &chunk_tx, &capture_stop, backoff)
            })
            .map_err(|e| Error::Audio(format!("failed to spawn uplink capture thread: {e}")))?;

        match opened_rx.await {
            Ok(Ok(())) => {}
            // The capture thread exits right after reporting
            Ok(Err(e)) => return Err(Error::Device(e)),
            Err(_) => return Err(Error::Audio("uplink capture thread exited".to_string())),
        }

        let forwarder = tokio::spawn(forward_chunks(chunk_rx, sender));

        Ok(Self {
            stop,
            capture: Some(capture),
            forwarder: Some(forwarder),
        })
    }

    /// Stop capturing; returns `true` only for the call that stopped it
    pub fn stop(&self) -> bool {
        if self.stop.is_stop_requested() {
            return false;
        }
        self.stop.request_stop();
        tracing::debug!("audio uplink stopping");
        true
    }

    /// Whether a stop was requested
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Stop, then wait for the capture thread and the forwarder to exit
    pub async fn finish(mut self) -> UplinkStats {
        self.stop();
        let mut stats = UplinkStats::default();

        if let Some(handle) = self.capture.take() {
            match tokio::task::spawn_blocking(move || handle.join()).await {
                Ok(Ok(counters)) => {
                    stats.captured = counters.captured;
                    stats.overruns = counters.overruns;
                }
                Ok(Err(_)) => tracing::error!("uplink capture thread panicked"),
                Err(e) => tracing::error!(error = %e, "failed to join uplink capture thread"),
            }
        }

        if let Some(forwarder) = self.forwarder.take() {
            match forwarder.await {
                Ok(sent) => stats.sent = sent,
                Err(e) => tracing::error!(error = %e, "uplink forwarder failed"),
            }
        }

        tracing::debug!(
            captured = stats.captured,
            sent = stats.sent,
            overruns = stats.overruns,
            "audio uplink finished"
        );
        stats
    }
}

impl Drop for AudioUplink {
    fn drop(&mut self) {
        // Threads exit on their own once stopped
        self.stop.request_stop();
    }
}

fn capture_loop(
    source: &dyn CaptureSource,
    opened: oneshot::Sender<std::result::Result<(), DeviceError>>,
    chunks: &mpsc::Sender<AudioChunk>,
    stop: &StopSignal,
    backoff: Duration,
) -> CaptureCounters {
    let mut counters = CaptureCounters::default();

    let mut device = match source.open() {
        Ok(device) => device,
        Err(e) => {
            tracing::error!(error = %e, "failed to open capture device for dialog");
            let _ = opened.send(Err(e));
            return counters;
        }
    };
    if opened.send(Ok(())).is_err() {
        tracing::debug!("uplink abandoned before capture started");
        device.close();
        return counters;
    }

    while !stop.is_stop_requested() {
        match device.read_chunk() {
            Ok(chunk) => {
                counters.captured += 1;
                if chunks.blocking_send(chunk).is_err() {
                    tracing::debug!("uplink forwarder gone, ending capture");
                    break;
                }
            }
            Err(ReadOutcome::TransientRetry) => std::thread::sleep(backoff),
            Err(ReadOutcome::Overrun) => {
                counters.overruns += 1;
                tracing::warn!(overruns = counters.overruns, "capture overrun during dialog");
            }
            Err(ReadOutcome::SuspendedRecoverable) => {
                tracing::warn!("capture device suspended during dialog");
                std::thread::sleep(backoff);
            }
            Err(ReadOutcome::Fatal) => {
                tracing::error!("capture device failed during dialog");
                break;
            }
        }
    }

    device.close();
    counters
}

async fn forward_chunks(mut chunks: mpsc::Receiver<AudioChunk>, sender: RequestSender) -> usize {
    let mut sent = 0;
    while let Some(chunk) = chunks.recv().await {
        let request = DialogRequest::AudioIn {
            audio: chunk.into_bytes(),
        };
        if let Err(e) = sender.write(request).await {
            tracing::warn!(error = %e, "failed to forward audio");
            break;
        }
        sent += 1;
    }
    sender.close_send();
    sent
}
