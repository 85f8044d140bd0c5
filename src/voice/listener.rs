//! Wake listener: the capture-to-spotter loop
//!
//! Runs on its own thread, pulling chunks from a capture device into the
//! keyword spotter until the trigger phrase is heard, the device fails, or a
//! stop is requested. The stop flag is the only state shared with the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use super::capture::{CaptureSource, ReadOutcome};
use super::spotter::{DetectionOutcome, KeywordSpotter};
use crate::error::{DeviceError, EngineError};
use crate::{Error, Result};

/// Delay before retrying an empty device read
pub const RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Cooperative stop flag shared with a capture thread
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Create an unset signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the owning loop to stop after its current read
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Whether a stop was requested
    #[must_use]
    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Listener state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Waiting for the trigger phrase
    Armed,
    /// Trigger heard; terminal for this cycle
    Detected,
    /// Shutting down and releasing the device
    Stopping,
}

/// A trigger phrase detection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    /// Phrase text
    pub phrase: String,
    /// Begin offset in samples, relative to the current engine session
    pub begin: u64,
    /// End offset in samples, relative to the current engine session
    pub end: u64,
}

/// Why the listener exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenOutcome {
    /// The trigger phrase was heard
    Detected(Detection),
    /// A stop was requested
    Stopped,
    /// The device reported an unrecoverable error
    DeviceLost,
    /// The device could not be opened
    DeviceUnavailable(DeviceError),
    /// The engine session could not be replaced after an overrun
    EngineFailed(EngineError),
}

/// What the listener hands back when it exits
pub struct ListenReport {
    /// Exit reason
    pub outcome: ListenOutcome,
    /// The spotter, returned to the caller for the next cycle
    pub spotter: KeywordSpotter,
    /// Chunks fed to the spotter
    pub chunks: usize,
    /// Overruns recovered from
    pub overruns: usize,
}

/// Drives capture chunks into a keyword spotter
pub struct WakeListener {
    source: Arc<dyn CaptureSource>,
    spotter: KeywordSpotter,
    stop: StopSignal,
    backoff: Duration,
    state: ListenerState,
    chunks: usize,
    overruns: usize,
}

impl WakeListener {
    /// Create a listener over a capture source and spotter
    #[must_use]
    pub fn new(source: Arc<dyn CaptureSource>, spotter: KeywordSpotter) -> Self {
        Self {
            source,
            spotter,
            stop: StopSignal::new(),
            backoff: RETRY_BACKOFF,
            state: ListenerState::Armed,
            chunks: 0,
            overruns: 0,
        }
    }

    /// Override the retry backoff
    #[must_use]
    pub const fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Signal that stops this listener
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> ListenerState {
        self.state
    }

    /// Run the loop on the calling thread until it exits
    ///
    /// The device is opened here and closed before returning, whatever the
    /// exit reason.
    #[must_use]
    pub fn run(mut self) -> ListenReport {
        let mut device = match self.source.open() {
            Ok(device) => device,
            Err(e) => {
                tracing::error!(error = %e, "failed to open capture device");
                self.transition(ListenerState::Stopping);
                return self.into_report(ListenOutcome::DeviceUnavailable(e));
            }
        };

        tracing::info!("listening for wake word");

        let outcome = loop {
            if self.stop.is_stop_requested() {
                self.transition(ListenerState::Stopping);
                break ListenOutcome::Stopped;
            }

            match device.read_chunk() {
                Ok(chunk) => {
                    self.chunks += 1;
                    match self.spotter.feed(chunk) {
                        DetectionOutcome::Match { phrase, begin, end } => {
                            tracing::info!(phrase = %phrase, begin, end, "wake word detected");
                            self.transition(ListenerState::Detected);
                            break ListenOutcome::Detected(Detection { phrase, begin, end });
                        }
                        DetectionOutcome::NoMatch => {}
                        DetectionOutcome::EngineError(detail) => {
                            tracing::warn!(detail = %detail, "no detection for chunk");
                        }
                    }
                }
                Err(ReadOutcome::TransientRetry) => std::thread::sleep(self.backoff),
                Err(ReadOutcome::Overrun) => {
                    self.overruns += 1;
                    tracing::warn!(overruns = self.overruns, "capture overrun, resetting keyword session");
                    if let Err(e) = self.spotter.duplicate_and_reconfigure() {
                        tracing::error!(error = %e, "keyword session reset failed");
                        self.transition(ListenerState::Stopping);
                        break ListenOutcome::EngineFailed(e);
                    }
                }
                Err(ReadOutcome::SuspendedRecoverable) => {
                    tracing::warn!("capture device suspended");
                    std::thread::sleep(self.backoff);
                }
                Err(ReadOutcome::Fatal) => {
                    tracing::error!("capture device failed");
                    self.transition(ListenerState::Stopping);
                    break ListenOutcome::DeviceLost;
                }
            }
        };

        device.close();
        tracing::debug!(chunks = self.chunks, overruns = self.overruns, "wake listener exited");
        self.into_report(outcome)
    }

    /// Run the loop on a dedicated thread
    ///
    /// # Errors
    ///
    /// Returns error if the thread cannot be spawned
    pub fn spawn(self) -> Result<ListenerHandle> {
        let stop = self.stop_signal();
        let handle = std::thread::Builder::new()
            .name("hark-wake".to_string())
            .spawn(move || self.run())?;
        Ok(ListenerHandle { stop, handle })
    }

    fn transition(&mut self, next: ListenerState) {
        if self.state != next {
            tracing::debug!(from = ?self.state, to = ?next, "wake listener transition");
            self.state = next;
        }
    }

    fn into_report(self, outcome: ListenOutcome) -> ListenReport {
        ListenReport {
            outcome,
            spotter: self.spotter,
            chunks: self.chunks,
            overruns: self.overruns,
        }
    }
}

/// Handle to a listener running on its own thread
pub struct ListenerHandle {
    stop: StopSignal,
    handle: JoinHandle<ListenReport>,
}

impl ListenerHandle {
    /// Ask the listener to stop
    pub fn stop(&self) {
        self.stop.request_stop();
    }

    /// Signal that stops this listener
    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Whether the listener thread has exited
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the listener to exit
    ///
    /// # Errors
    ///
    /// Returns error if the listener thread panicked
    pub fn join(self) -> Result<ListenReport> {
        self.handle
            .join()
            .map_err(|_| Error::Audio("wake listener thread panicked".to_string()))
    }
}
