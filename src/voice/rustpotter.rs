//! Wake word engine backed by rustpotter
//!
//! The model file stem is the phrase reported on detection, so a model saved
//! as `alexa.rpw` reports `"alexa"`. Rustpotter scores whole frames, so the
//! offsets reported are frame boundaries.

use std::path::{Path, PathBuf};

use rustpotter::{Rustpotter, RustpotterConfig, SampleFormat};

use super::capture::SAMPLE_RATE;
use super::spotter::{DetectionEngine, EngineSession, ResultHandler, SpotResult, Task};
use crate::error::EngineError;

/// Loads rustpotter wake word models
#[derive(Debug, Clone)]
pub struct RustpotterEngine {
    threshold: f32,
}

impl RustpotterEngine {
    /// Create an engine with the given detection threshold
    #[must_use]
    pub const fn new(threshold: f32) -> Self {
        Self { threshold }
    }
}

impl DetectionEngine for RustpotterEngine {
    fn load(&self, model_path: &Path) -> Result<Box<dyn EngineSession>, EngineError> {
        let session = RustpotterSession::open(model_path.to_path_buf(), self.threshold, None)?;
        Ok(Box::new(session))
    }
}

struct RustpotterSession {
    detector: Rustpotter,
    model_path: PathBuf,
    threshold: f32,
    phrase: String,
    task: Option<Task>,
    handler: Option<ResultHandler>,
    auto_flush: bool,
    pending: Vec<f32>,
    processed: u64,
}

impl RustpotterSession {
    fn open(model_path: PathBuf, threshold: f32, task: Option<Task>) -> Result<Self, EngineError> {
        let load_error = |detail: String| EngineError::Load {
            path: model_path.display().to_string(),
            detail,
        };

        let path_str = model_path
            .to_str()
            .ok_or_else(|| load_error("model path is not valid UTF-8".to_string()))?;
        let phrase = model_path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| load_error("model path has no file name".to_string()))?
            .to_string();

        let mut config = RustpotterConfig::default();
        config.fmt.sample_rate = SAMPLE_RATE as usize;
        config.fmt.channels = 1;
        config.fmt.sample_format = SampleFormat::F32;
        config.detector.threshold = threshold;

        let mut detector = Rustpotter::new(&config).map_err(|e| load_error(e.to_string()))?;
        detector
            .add_wakeword_from_file(&phrase, path_str)
            .map_err(|e| load_error(e.to_string()))?;

        tracing::debug!(model = path_str, phrase = %phrase, threshold, "rustpotter session loaded");

        Ok(Self {
            detector,
            model_path,
            threshold,
            phrase,
            task,
            handler: None,
            // Engine default; the spotter turns it off
            auto_flush: true,
            pending: Vec::new(),
            processed: 0,
        })
    }

    fn run_frame(&mut self, frame: &[f32]) -> Result<(), EngineError> {
        let begin = self.processed;
        self.processed += frame.len() as u64;

        if let Some(detection) = self.detector.process_f32(frame) {
            let handler = self.handler.as_mut().ok_or_else(|| EngineError::Option {
                option: "result handler",
                detail: "no handler bound".to_string(),
            })?;
            handler(SpotResult {
                text: detection.name,
                begin_sample: begin,
                end_sample: self.processed,
            });
        }
        Ok(())
    }
}

impl EngineSession for RustpotterSession {
    fn require_task(&mut self, task: Task) -> Result<(), EngineError> {
        match task {
            Task::PhraseSpot => {
                self.task = Some(task);
                Ok(())
            }
        }
    }

    fn set_auto_flush(&mut self, enabled: bool) -> Result<(), EngineError> {
        self.auto_flush = enabled;
        Ok(())
    }

    fn set_result_handler(&mut self, handler: ResultHandler) -> Result<(), EngineError> {
        self.handler = Some(handler);
        Ok(())
    }

    fn process(&mut self, pcm: &[u8]) -> Result<(), EngineError> {
        if self.task.is_none() {
            return Err(EngineError::Process("no task required".to_string()));
        }

        self.pending.extend(
            pcm.chunks_exact(2)
                .map(|b| f32::from(i16::from_le_bytes([b[0], b[1]])) / 32768.0),
        );

        let frame_len = self.detector.get_samples_per_frame();
        while self.pending.len() >= frame_len {
            let frame: Vec<f32> = self.pending.drain(..frame_len).collect();
            self.run_frame(&frame)?;
        }

        if self.auto_flush && !self.pending.is_empty() {
            let mut frame = std::mem::take(&mut self.pending);
            frame.resize(frame_len, 0.0);
            self.run_frame(&frame)?;
        }
        Ok(())
    }

    fn duplicate(&self) -> Result<Box<dyn EngineSession>, EngineError> {
        let session = Self::open(self.model_path.clone(), self.threshold, self.task)
            .map_err(|e| EngineError::Duplicate(e.to_string()))?;
        Ok(Box::new(session))
    }
}

impl std::fmt::Debug for RustpotterSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RustpotterSession")
            .field("model_path", &self.model_path)
            .field("phrase", &self.phrase)
            .field("auto_flush", &self.auto_flush)
            .field("processed", &self.processed)
            .finish_non_exhaustive()
    }
}
