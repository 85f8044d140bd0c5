//! Shared test utilities
//!
//! Scripted stand-ins for the capture device, detection engine, dialog
//! service, playback sink and state notifier.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::mpsc;

use hark::dialog::{
    ConversationState, DialogRequest, DialogResponse, DialogStream, DialogTransport, EventType,
    MicrophoneMode,
};
use hark::error::{DeviceError, EngineError};
use hark::notify::{InteractionState, StateNotifier};
use hark::voice::{
    AudioChunk, CaptureDevice, CaptureSource, DetectionEngine, EngineSession, PlaybackSink,
    ReadOutcome, ResultHandler, SpotResult, Task,
};
use hark::{Error, Result};

/// Something a fake did, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Open,
    Close,
    RequireTask { session: usize },
    AutoFlush { session: usize, enabled: bool },
    Handler { session: usize },
    Process { session: usize, frames: usize },
    Duplicate { from: usize, to: usize },
}

/// Event log shared between the capture and engine fakes
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<Event>>>);

impl EventLog {
    pub fn push(&self, event: Event) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.0.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Event) -> bool) -> usize {
        self.0.lock().unwrap().iter().filter(|e| pred(e)).count()
    }

    pub fn position(&self, pred: impl Fn(&Event) -> bool) -> Option<usize> {
        self.0.lock().unwrap().iter().position(pred)
    }
}

/// One scripted device read
#[derive(Debug, Clone, Copy)]
pub enum Step {
    /// A chunk of this many frames, every sample set to the value
    Chunk { frames: usize, value: i16 },
    /// An abnormal read
    Outcome(ReadOutcome),
}

/// Chunk step helper
pub const fn chunk(frames: usize, value: i16) -> Step {
    Step::Chunk { frames, value }
}

/// Capture source that hands each opened device the next script
pub struct ScriptedCapture {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    exhausted: ReadOutcome,
    fail_open: bool,
    log: EventLog,
}

impl ScriptedCapture {
    /// Devices idle with `TransientRetry` once their script runs out
    pub fn new(log: EventLog, scripts: Vec<Vec<Step>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            exhausted: ReadOutcome::TransientRetry,
            fail_open: false,
            log,
        }
    }

    /// Report this outcome forever once a script runs out
    pub fn exhausted_with(mut self, outcome: ReadOutcome) -> Self {
        self.exhausted = outcome;
        self
    }

    /// Fail every open
    pub fn failing(log: EventLog) -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            exhausted: ReadOutcome::Fatal,
            fail_open: true,
            log,
        }
    }

    pub fn opens(&self) -> usize {
        self.log.count(|e| *e == Event::Open)
    }

    pub fn closes(&self) -> usize {
        self.log.count(|e| *e == Event::Close)
    }
}

impl CaptureSource for ScriptedCapture {
    fn open(&self) -> std::result::Result<Box<dyn CaptureDevice>, DeviceError> {
        if self.fail_open {
            return Err(DeviceError::NotFound("scripted failure".to_string()));
        }
        self.log.push(Event::Open);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedDevice {
            steps: script.into(),
            exhausted: self.exhausted,
            log: self.log.clone(),
            closed: false,
        }))
    }
}

struct ScriptedDevice {
    steps: VecDeque<Step>,
    exhausted: ReadOutcome,
    log: EventLog,
    closed: bool,
}

impl CaptureDevice for ScriptedDevice {
    fn read_chunk(&mut self) -> std::result::Result<AudioChunk, ReadOutcome> {
        match self.steps.pop_front() {
            Some(Step::Chunk { frames, value }) => Ok(AudioChunk::from_samples(&vec![value; frames])),
            Some(Step::Outcome(outcome)) => Err(outcome),
            None => Err(self.exhausted),
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.log.push(Event::Close);
        }
    }
}

/// What a fake session reports for one process call
#[derive(Debug, Clone)]
pub struct Spot {
    pub text: String,
    /// Explicit offsets; `None` reports the chunk's span within the session
    pub span: Option<(u64, u64)>,
}

pub fn spot(text: &str) -> Spot {
    Spot {
        text: text.to_string(),
        span: None,
    }
}

pub fn spot_at(text: &str, begin: u64, end: u64) -> Spot {
    Spot {
        text: text.to_string(),
        span: Some((begin, end)),
    }
}

/// Runtime options observed on a session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionOptions {
    pub task_required: bool,
    pub auto_flush: Option<bool>,
    pub handler_bound: bool,
}

#[derive(Default)]
struct EngineShared {
    replies: Mutex<VecDeque<Vec<Spot>>>,
    sessions: Mutex<Vec<SessionOptions>>,
    next_session: AtomicUsize,
    fail_duplicate: bool,
    /// Process calls, counted across sessions
    calls: AtomicUsize,
    failing_calls: Mutex<Vec<usize>>,
}

/// Detection engine whose sessions reply from a script, one entry per
/// process call
#[derive(Clone)]
pub struct ScriptedEngine {
    shared: Arc<EngineShared>,
    log: EventLog,
}

impl ScriptedEngine {
    pub fn new(log: EventLog, replies: Vec<Vec<Spot>>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                replies: Mutex::new(replies.into()),
                ..EngineShared::default()
            }),
            log,
        }
    }

    /// Sessions refuse to duplicate
    pub fn failing_duplicate(log: EventLog, replies: Vec<Vec<Spot>>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                replies: Mutex::new(replies.into()),
                fail_duplicate: true,
                ..EngineShared::default()
            }),
            log,
        }
    }

    /// These process calls (counted from zero across sessions) report their
    /// scripted results, then fail
    pub fn failing_process(self, calls: &[usize]) -> Self {
        self.shared.failing_calls.lock().unwrap().extend_from_slice(calls);
        self
    }

    pub fn session_options(&self, session: usize) -> SessionOptions {
        self.shared.sessions.lock().unwrap()[session]
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().unwrap().len()
    }

    fn new_session(&self) -> ScriptedSession {
        let id = self.shared.next_session.fetch_add(1, Ordering::SeqCst);
        self.shared
            .sessions
            .lock()
            .unwrap()
            .push(SessionOptions::default());
        ScriptedSession {
            id,
            engine: self.clone(),
            handler: None,
            processed: 0,
        }
    }
}

impl DetectionEngine for ScriptedEngine {
    fn load(&self, _model_path: &Path) -> std::result::Result<Box<dyn EngineSession>, EngineError> {
        Ok(Box::new(self.new_session()))
    }
}

struct ScriptedSession {
    id: usize,
    engine: ScriptedEngine,
    handler: Option<ResultHandler>,
    processed: u64,
}

impl ScriptedSession {
    fn update(&self, f: impl FnOnce(&mut SessionOptions)) {
        f(&mut self.engine.shared.sessions.lock().unwrap()[self.id]);
    }
}

impl EngineSession for ScriptedSession {
    fn require_task(&mut self, _task: Task) -> std::result::Result<(), EngineError> {
        self.engine.log.push(Event::RequireTask { session: self.id });
        self.update(|o| o.task_required = true);
        Ok(())
    }

    fn set_auto_flush(&mut self, enabled: bool) -> std::result::Result<(), EngineError> {
        self.engine.log.push(Event::AutoFlush {
            session: self.id,
            enabled,
        });
        self.update(|o| o.auto_flush = Some(enabled));
        Ok(())
    }

    fn set_result_handler(&mut self, handler: ResultHandler) -> std::result::Result<(), EngineError> {
        self.engine.log.push(Event::Handler { session: self.id });
        self.update(|o| o.handler_bound = true);
        self.handler = Some(handler);
        Ok(())
    }

    fn process(&mut self, pcm: &[u8]) -> std::result::Result<(), EngineError> {
        let frames = pcm.len() / 2;
        self.engine.log.push(Event::Process {
            session: self.id,
            frames,
        });

        let begin = self.processed;
        self.processed += frames as u64;
        let reply = self
            .engine
            .shared
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();

        let handler = self
            .handler
            .as_mut()
            .ok_or_else(|| EngineError::Process("no handler bound".to_string()))?;
        for spot in reply {
            let (begin_sample, end_sample) = spot.span.unwrap_or((begin, self.processed));
            handler(SpotResult {
                text: spot.text,
                begin_sample,
                end_sample,
            });
        }

        let call = self.engine.shared.calls.fetch_add(1, Ordering::SeqCst);
        if self.engine.shared.failing_calls.lock().unwrap().contains(&call) {
            return Err(EngineError::Process("scripted failure".to_string()));
        }
        Ok(())
    }

    fn duplicate(&self) -> std::result::Result<Box<dyn EngineSession>, EngineError> {
        if self.engine.shared.fail_duplicate {
            return Err(EngineError::Duplicate("scripted failure".to_string()));
        }
        let copy = self.engine.new_session();
        // The model-level task carries over; runtime options do not
        copy.update(|o| o.task_required = true);
        self.engine.log.push(Event::Duplicate {
            from: self.id,
            to: copy.id,
        });
        Ok(Box::new(copy))
    }
}

/// Playback call, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackCall {
    Start,
    Send(Vec<u8>),
    Stop,
}

/// Playback sink that records calls
#[derive(Debug, Clone, Default)]
pub struct RecordingPlayback {
    calls: Arc<Mutex<Vec<PlaybackCall>>>,
    /// Play time each sent frame adds to the queue
    backlog: Duration,
    drained_at: Arc<Mutex<Option<Instant>>>,
}

impl RecordingPlayback {
    /// Every sent frame keeps audio queued for this long
    pub fn with_backlog(backlog: Duration) -> Self {
        Self {
            backlog,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> Vec<PlaybackCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlaybackCall::Send(audio) => Some(audio),
                _ => None,
            })
            .collect()
    }
}

impl PlaybackSink for RecordingPlayback {
    fn start(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(PlaybackCall::Start);
        Ok(())
    }

    fn send(&mut self, audio: Vec<u8>) -> Result<()> {
        self.calls.lock().unwrap().push(PlaybackCall::Send(audio));
        *self.drained_at.lock().unwrap() = Some(Instant::now() + self.backlog);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.calls.lock().unwrap().push(PlaybackCall::Stop);
        *self.drained_at.lock().unwrap() = None;
        Ok(())
    }

    fn buffered(&self) -> Duration {
        self.drained_at
            .lock()
            .unwrap()
            .map_or(Duration::ZERO, |at| at.saturating_duration_since(Instant::now()))
    }
}

/// Notifier that records states
#[derive(Debug, Clone, Default)]
pub struct RecordingNotifier {
    states: Arc<Mutex<Vec<InteractionState>>>,
}

impl RecordingNotifier {
    pub fn states(&self) -> Vec<InteractionState> {
        self.states.lock().unwrap().clone()
    }

    pub fn count(&self, state: InteractionState) -> usize {
        self.states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == state)
            .count()
    }
}

impl StateNotifier for RecordingNotifier {
    fn notify(&self, state: InteractionState) {
        self.states.lock().unwrap().push(state);
    }
}

/// Scripted behaviour of the service for one turn
#[derive(Debug, Clone)]
pub struct TurnScript {
    /// Sent once this many audio frames have arrived
    pub wait_for_audio: usize,
    pub responses: Vec<DialogResponse>,
    /// `Err` makes the stream finish with a transport failure
    pub status: std::result::Result<(), String>,
}

impl TurnScript {
    pub fn respond(responses: Vec<DialogResponse>) -> Self {
        Self {
            wait_for_audio: 0,
            responses,
            status: Ok(()),
        }
    }

    pub fn after_audio(mut self, frames: usize) -> Self {
        self.wait_for_audio = frames;
        self
    }

    pub fn failing(mut self, detail: &str) -> Self {
        self.status = Err(detail.to_string());
        self
    }
}

/// In-memory dialog service; one script per opened stream
#[derive(Clone, Default)]
pub struct ScriptedTransport {
    turns: Arc<Mutex<VecDeque<TurnScript>>>,
    requests: Arc<Mutex<Vec<Vec<DialogRequest>>>>,
}

impl ScriptedTransport {
    pub fn new(turns: Vec<TurnScript>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns.into())),
            requests: Arc::default(),
        }
    }

    /// Requests received, per turn
    pub fn requests(&self) -> Vec<Vec<DialogRequest>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn turns_opened(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    /// Conversation state carried in a turn's config message
    pub fn carried_state(&self, turn: usize) -> Option<ConversationState> {
        match self.requests()[turn].first() {
            Some(DialogRequest::Config(config)) => config.conversation_state.clone(),
            other => panic!("turn {turn} did not start with a config: {other:?}"),
        }
    }

    /// Audio payloads sent in a turn
    pub fn audio(&self, turn: usize) -> Vec<Vec<u8>> {
        self.requests()[turn]
            .iter()
            .filter_map(|r| match r {
                DialogRequest::AudioIn { audio } => Some(audio.clone()),
                DialogRequest::Config(_) => None,
            })
            .collect()
    }
}

#[async_trait]
impl DialogTransport for ScriptedTransport {
    async fn open(&self) -> Result<DialogStream> {
        let script = self
            .turns
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| Error::Transport("service unavailable".to_string()))?;

        let turn = {
            let mut requests = self.requests.lock().unwrap();
            requests.push(Vec::new());
            requests.len() - 1
        };

        let (request_tx, mut request_rx) = mpsc::channel(64);
        let (response_tx, response_rx) = mpsc::channel(64);
        let log = Arc::clone(&self.requests);

        let driver = tokio::spawn(async move {
            let mut response_tx = Some(response_tx);
            let mut pending = Some(script.responses);
            let mut audio = 0;

            if script.wait_for_audio == 0 {
                deliver(&mut response_tx, &mut pending).await;
            }
            while let Some(request) = request_rx.recv().await {
                if matches!(request, DialogRequest::AudioIn { .. }) {
                    audio += 1;
                }
                log.lock().unwrap()[turn].push(request);
                if audio >= script.wait_for_audio {
                    deliver(&mut response_tx, &mut pending).await;
                }
            }
            deliver(&mut response_tx, &mut pending).await;

            script.status.map_err(Error::Transport)
        });

        Ok(DialogStream::new(request_tx, response_rx, driver))
    }
}

/// Send the scripted responses, then close the response stream
async fn deliver(
    tx: &mut Option<mpsc::Sender<DialogResponse>>,
    pending: &mut Option<Vec<DialogResponse>>,
) {
    if let (Some(tx), Some(responses)) = (tx.take(), pending.take()) {
        for response in responses {
            let _ = tx.send(response).await;
        }
    }
}

/// Response with only an event type
pub fn end_of_utterance() -> DialogResponse {
    DialogResponse {
        event_type: Some(EventType::EndOfUtterance),
        ..DialogResponse::default()
    }
}

/// Response with only a microphone mode
pub fn microphone(mode: MicrophoneMode) -> DialogResponse {
    DialogResponse {
        microphone_mode: Some(mode),
        ..DialogResponse::default()
    }
}

/// Response with only a conversation state token
pub fn conversation_state(token: &str) -> DialogResponse {
    DialogResponse {
        conversation_state: Some(ConversationState::from(token)),
        ..DialogResponse::default()
    }
}

/// Response with only audio
pub fn audio_out(bytes: &[u8]) -> DialogResponse {
    DialogResponse {
        audio_out: Some(bytes.to_vec()),
        ..DialogResponse::default()
    }
}

/// Poll `cond` until it holds, panicking after five seconds
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

/// Short backoff so scripted loops spin quickly
pub const FAST: Duration = Duration::from_millis(1);
