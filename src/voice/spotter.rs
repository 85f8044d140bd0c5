//! Keyword spotting
//!
//! Wraps a stateful detection engine session. The engine reports results
//! through a callback; here the callback only publishes into a channel that
//! [`KeywordSpotter::feed`] drains once the engine has consumed the chunk, so
//! no engine state is reachable from outside the spotter.

use std::path::Path;

use crossbeam_channel::{Receiver, Sender, unbounded};

use super::capture::AudioChunk;
use crate::error::EngineError;

/// The only phrase that wakes the assistant
pub const TRIGGER_PHRASE: &str = "alexa";

/// A result reported by the engine's callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotResult {
    /// Recognized phrase text
    pub text: String,
    /// First sample of the phrase, relative to the session's start
    pub begin_sample: u64,
    /// Last sample of the phrase, relative to the session's start
    pub end_sample: u64,
}

/// Callback bound to an engine session
pub type ResultHandler = Box<dyn FnMut(SpotResult) + Send>;

/// Engine task a session must be configured for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    /// Continuous phrase spotting
    PhraseSpot,
}

/// A live engine session
///
/// Runtime options (auto-flush, result handler) belong to the session
/// instance and are not carried over by [`EngineSession::duplicate`].
pub trait EngineSession: Send {
    /// Assert the task the loaded model must perform
    ///
    /// # Errors
    ///
    /// Returns error if the model cannot perform the task
    fn require_task(&mut self, task: Task) -> Result<(), EngineError>;

    /// Enable or disable flushing the pipeline at the end of each input
    ///
    /// # Errors
    ///
    /// Returns error if the option is rejected
    fn set_auto_flush(&mut self, enabled: bool) -> Result<(), EngineError>;

    /// Bind the result callback
    ///
    /// # Errors
    ///
    /// Returns error if the handler cannot be registered
    fn set_result_handler(&mut self, handler: ResultHandler) -> Result<(), EngineError>;

    /// Stream PCM bytes (S16LE mono) through the engine, invoking the handler
    /// for each result
    ///
    /// # Errors
    ///
    /// Returns error if processing fails
    fn process(&mut self, pcm: &[u8]) -> Result<(), EngineError>;

    /// Create a fresh session with this session's model and configuration
    /// but none of its runtime settings or sample counters
    ///
    /// # Errors
    ///
    /// Returns error if the engine cannot duplicate the session
    fn duplicate(&self) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// Loads engine sessions from model files
pub trait DetectionEngine: Send + Sync {
    /// Load a model into a new session
    ///
    /// # Errors
    ///
    /// Returns error if the model cannot be loaded
    fn load(&self, model_path: &Path) -> Result<Box<dyn EngineSession>, EngineError>;
}

/// Result of feeding one chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectionOutcome {
    /// Nothing recognized (or only non-trigger text)
    NoMatch,
    /// The trigger phrase was recognized
    Match {
        /// Phrase text as reported by the engine
        phrase: String,
        /// Begin offset in samples
        begin: u64,
        /// End offset in samples
        end: u64,
    },
    /// The engine failed on this chunk
    EngineError(String),
}

/// Feeds audio to a detection session and filters for the trigger phrase
pub struct KeywordSpotter {
    session: Box<dyn EngineSession>,
    results_tx: Sender<SpotResult>,
    results_rx: Receiver<SpotResult>,
}

impl KeywordSpotter {
    /// Load a model and configure a session for phrase spotting
    ///
    /// # Errors
    ///
    /// Returns error if loading or configuring the session fails
    pub fn create(engine: &dyn DetectionEngine, model_path: &Path) -> Result<Self, EngineError> {
        let mut session = engine.load(model_path)?;
        session.require_task(Task::PhraseSpot)?;

        let (results_tx, results_rx) = unbounded();
        configure_runtime(session.as_mut(), &results_tx)?;

        tracing::debug!(model = %model_path.display(), "keyword spotter initialized");

        Ok(Self {
            session,
            results_tx,
            results_rx,
        })
    }

    /// Run a chunk through the engine
    ///
    /// If the engine reports several results for one chunk, the last trigger
    /// match wins; other recognized text is logged and ignored.
    pub fn feed(&mut self, chunk: AudioChunk) -> DetectionOutcome {
        // Results left over from a failed call must not leak into this one
        let stale = self.results_rx.try_iter().count();
        if stale > 0 {
            tracing::debug!(stale, "discarded stale spot results");
        }

        if let Err(e) = self.session.process(chunk.as_bytes()) {
            tracing::warn!(error = %e, "keyword engine failed on chunk");
            return DetectionOutcome::EngineError(e.to_string());
        }

        let mut outcome = DetectionOutcome::NoMatch;
        for result in self.results_rx.try_iter() {
            tracing::debug!(
                keyword = %result.text,
                begin = result.begin_sample,
                end = result.end_sample,
                "keyword engine result"
            );

            if result.text == TRIGGER_PHRASE {
                outcome = DetectionOutcome::Match {
                    phrase: result.text,
                    begin: result.begin_sample,
                    end: result.end_sample,
                };
            } else {
                tracing::info!(keyword = %result.text, "ignoring non-trigger phrase");
            }
        }
        outcome
    }

    /// Replace the session with a duplicate and re-apply runtime options
    ///
    /// Used after an audio discontinuity so sample offsets restart from zero.
    /// The old session stays in place if anything fails.
    ///
    /// # Errors
    ///
    /// Returns error if duplication or reconfiguration fails
    pub fn duplicate_and_reconfigure(&mut self) -> Result<(), EngineError> {
        let mut replacement = self.session.duplicate()?;
        configure_runtime(replacement.as_mut(), &self.results_tx)?;
        self.session = replacement;

        tracing::debug!("keyword session replaced");
        Ok(())
    }
}

fn configure_runtime(
    session: &mut dyn EngineSession,
    results_tx: &Sender<SpotResult>,
) -> Result<(), EngineError> {
    let tx = results_tx.clone();
    session.set_result_handler(Box::new(move |result| {
        // The receiver lives as long as the spotter
        let _ = tx.send(result);
    }))?;

    // Audio arrives in small chunks; flushing at every chunk end would cut
    // phrases that straddle two chunks
    session.set_auto_flush(false)?;
    Ok(())
}
