//! Assistant daemon: wake word listening and dialog turns

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::dialog::{ConversationState, DialogSession, DialogSettings, DialogTransport};
use crate::notify::{InteractionState, StateNotifier};
use crate::voice::{
    CaptureSource, KeywordSpotter, ListenOutcome, ListenReport, PlaybackSink, RETRY_BACKOFF,
    WakeListener,
};
use crate::{Error, Result};

/// Pause after a failed wake cycle before listening again
pub const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

/// Main daemon that runs the wake / converse cycle
pub struct Daemon {
    capture: Arc<dyn CaptureSource>,
    spotter: Option<KeywordSpotter>,
    transport: Arc<dyn DialogTransport>,
    playback: Box<dyn PlaybackSink>,
    notifier: Arc<dyn StateNotifier>,
    settings: DialogSettings,
    capture_backoff: Duration,
    failure_backoff: Duration,
    cycles: usize,
}

/// How waiting for the wake word ended
enum WakeEnd {
    Detected,
    Failed,
    Shutdown,
}

impl Daemon {
    /// Create a daemon over its components
    pub fn new(
        capture: Arc<dyn CaptureSource>,
        spotter: KeywordSpotter,
        transport: Arc<dyn DialogTransport>,
        playback: Box<dyn PlaybackSink>,
        notifier: Arc<dyn StateNotifier>,
        settings: DialogSettings,
    ) -> Self {
        Self {
            capture,
            spotter: Some(spotter),
            transport,
            playback,
            notifier,
            settings,
            capture_backoff: RETRY_BACKOFF,
            failure_backoff: FAILURE_BACKOFF,
            cycles: 0,
        }
    }

    /// Override the capture retry and failure backoffs
    #[must_use]
    pub const fn with_backoff(mut self, capture: Duration, failure: Duration) -> Self {
        self.capture_backoff = capture;
        self.failure_backoff = failure;
        self
    }

    /// Run until shutdown is signalled
    ///
    /// # Errors
    ///
    /// Returns error if the wake listener thread cannot be started or dies
    pub async fn run(mut self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<()> {
        tracing::info!(device_id = %self.settings.device_id, "assistant started");

        loop {
            self.notifier.notify(InteractionState::Idle);

            match self.wait_for_wake(shutdown_rx).await? {
                WakeEnd::Detected => {}
                WakeEnd::Shutdown => break,
                WakeEnd::Failed => {
                    self.notifier.notify(InteractionState::Error);
                    tokio::select! {
                        _ = shutdown_rx.recv() => break,
                        () = tokio::time::sleep(self.failure_backoff) => continue,
                    }
                }
            }

            if self.converse(shutdown_rx).await {
                break;
            }
        }

        tracing::info!(cycles = self.cycles, "assistant stopped");
        Ok(())
    }

    /// Run the wake listener on its own thread until it exits
    async fn wait_for_wake(&mut self, shutdown_rx: &mut mpsc::Receiver<()>) -> Result<WakeEnd> {
        let mut spotter = self
            .spotter
            .take()
            .ok_or_else(|| Error::Config("keyword spotter unavailable".to_string()))?;

        // Every cycle after the first starts from a fresh session so offsets
        // restart at zero
        if self.cycles > 0
            && let Err(e) = spotter.duplicate_and_reconfigure()
        {
            tracing::warn!(error = %e, "failed to refresh keyword session, keeping current");
        }
        self.cycles += 1;

        let listener =
            WakeListener::new(Arc::clone(&self.capture), spotter).with_backoff(self.capture_backoff);
        let handle = listener.spawn()?;
        let stop = handle.stop_signal();
        let mut join = tokio::task::spawn_blocking(move || handle.join());

        let mut shutdown = false;
        let joined = tokio::select! {
            joined = &mut join => joined,
            _ = shutdown_rx.recv() => {
                tracing::info!("shutdown requested");
                shutdown = true;
                stop.request_stop();
                join.await
            }
        };

        let ListenReport {
            outcome,
            spotter,
            chunks,
            overruns,
        } = joined.map_err(|e| Error::Audio(format!("failed to join wake listener: {e}")))??;
        self.spotter = Some(spotter);
        tracing::debug!(cycle = self.cycles, chunks, overruns, "wake cycle ended");

        if shutdown {
            return Ok(WakeEnd::Shutdown);
        }

        Ok(match outcome {
            ListenOutcome::Detected(_) => WakeEnd::Detected,
            ListenOutcome::Stopped => WakeEnd::Shutdown,
            ListenOutcome::DeviceLost => {
                tracing::error!("capture device lost, restarting wake cycle");
                WakeEnd::Failed
            }
            ListenOutcome::DeviceUnavailable(e) => {
                tracing::error!(error = %e, "capture device unavailable, restarting wake cycle");
                WakeEnd::Failed
            }
            ListenOutcome::EngineFailed(e) => {
                tracing::error!(error = %e, "keyword engine failed, restarting wake cycle");
                WakeEnd::Failed
            }
        })
    }

    /// Run dialog turns until the service stops asking for more
    ///
    /// Returns `true` if shutdown was requested.
    async fn converse(&mut self, shutdown_rx: &mut mpsc::Receiver<()>) -> bool {
        let mut conversation_state: Option<ConversationState> = None;
        let mut turns = 0usize;

        loop {
            self.notifier.notify(InteractionState::Listening);
            turns += 1;

            let session = DialogSession::new(
                self.transport.as_ref(),
                Arc::clone(&self.capture),
                self.playback.as_mut(),
                self.notifier.as_ref(),
                &self.settings,
            )
            .with_backoff(self.capture_backoff);

            let result = tokio::select! {
                result = session.run(conversation_state.take()) => result,
                _ = shutdown_rx.recv() => {
                    tracing::info!("shutdown requested during dialog");
                    return true;
                }
            };

            match result {
                Ok(outcome) => {
                    for action in &outcome.device_actions {
                        tracing::debug!(action = %action, "device action not handled");
                    }
                    conversation_state = outcome.conversation_state;
                    if !outcome.continue_dialog {
                        break;
                    }
                    tracing::debug!(turns, "continuing conversation");
                }
                Err(e) => {
                    tracing::error!(error = %e, turns, "dialog failed, returning to wake word");
                    self.notifier.notify(InteractionState::Error);
                    break;
                }
            }
        }

        tracing::info!(turns, "conversation ended");
        false
    }
}
