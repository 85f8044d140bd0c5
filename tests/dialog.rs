//! Dialog session integration tests
//!
//! Runs single turns against an in-memory dialog service

use std::sync::Arc;
use std::time::{Duration, Instant};

use hark::dialog::{
    ConversationState, DialogRequest, DialogResponse, DialogSession, DialogSettings,
    MicrophoneMode,
};
use hark::notify::InteractionState;
use hark::{Error, TurnOutcome};

mod common;

use common::{
    EventLog, FAST, PlaybackCall, RecordingNotifier, RecordingPlayback, ScriptedCapture,
    ScriptedTransport, Step, TurnScript, audio_out, chunk, conversation_state, end_of_utterance,
    microphone,
};

struct Harness {
    transport: ScriptedTransport,
    capture: Arc<ScriptedCapture>,
    playback: RecordingPlayback,
    notifier: RecordingNotifier,
    settings: DialogSettings,
}

impl Harness {
    fn new(turn: TurnScript, capture_steps: Vec<Step>) -> Self {
        Self {
            transport: ScriptedTransport::new(vec![turn]),
            capture: Arc::new(ScriptedCapture::new(EventLog::default(), vec![capture_steps])),
            playback: RecordingPlayback::default(),
            notifier: RecordingNotifier::default(),
            settings: DialogSettings {
                device_id: "test-device".to_string(),
                ..DialogSettings::default()
            },
        }
    }

    fn with_playback(mut self, playback: RecordingPlayback) -> Self {
        self.playback = playback;
        self
    }

    async fn run(&self, carried: Option<ConversationState>) -> hark::Result<TurnOutcome> {
        let mut playback = self.playback.clone();
        DialogSession::new(
            &self.transport,
            self.capture.clone(),
            &mut playback,
            &self.notifier,
            &self.settings,
        )
        .with_backoff(FAST)
        .run(carried)
        .await
    }
}

#[tokio::test]
async fn test_no_follow_on_ends_conversation() {
    let harness = Harness::new(
        TurnScript::respond(vec![end_of_utterance(), audio_out(&[1, 2])]),
        vec![],
    );

    let outcome = harness.run(None).await.unwrap();

    assert!(!outcome.continue_dialog);
    assert!(outcome.conversation_state.is_none());
}

#[tokio::test]
async fn test_follow_on_with_token() {
    let harness = Harness::new(
        TurnScript::respond(vec![
            audio_out(b"X"),
            microphone(MicrophoneMode::DialogFollowOn),
            conversation_state("tok1"),
        ]),
        vec![],
    );

    let outcome = harness.run(None).await.unwrap();

    assert!(outcome.continue_dialog);
    assert_eq!(outcome.conversation_state, Some(ConversationState::from("tok1")));
    assert_eq!(
        harness.playback.calls(),
        vec![
            PlaybackCall::Start,
            PlaybackCall::Send(b"X".to_vec()),
            PlaybackCall::Stop
        ]
    );
    assert_eq!(harness.notifier.count(InteractionState::Speaking), 1);
}

#[tokio::test]
async fn test_last_microphone_mode_wins() {
    let harness = Harness::new(
        TurnScript::respond(vec![
            microphone(MicrophoneMode::DialogFollowOn),
            microphone(MicrophoneMode::CloseMicrophone),
        ]),
        vec![],
    );

    let outcome = harness.run(None).await.unwrap();
    assert!(!outcome.continue_dialog);
}

#[tokio::test]
async fn test_config_sent_first_with_identity() {
    let harness = Harness::new(TurnScript::respond(vec![]), vec![]);

    harness.run(None).await.unwrap();

    let requests = harness.transport.requests();
    match &requests[0][0] {
        DialogRequest::Config(config) => {
            assert_eq!(config.device_id, "test-device");
            assert_eq!(config.locale, "en-US");
            assert_eq!(config.audio_in_config.sample_rate_hertz, 16000);
            assert!(config.conversation_state.is_none());
        }
        other => panic!("expected config, got {other:?}"),
    }
}

#[tokio::test]
async fn test_carried_token_sent_and_kept() {
    let harness = Harness::new(TurnScript::respond(vec![end_of_utterance()]), vec![]);
    let carried = ConversationState::from("tok0");

    let outcome = harness.run(Some(carried.clone())).await.unwrap();

    assert_eq!(harness.transport.carried_state(0), Some(carried.clone()));
    assert_eq!(outcome.conversation_state, Some(carried));
}

#[tokio::test]
async fn test_empty_token_ignored() {
    let harness = Harness::new(TurnScript::respond(vec![conversation_state("")]), vec![]);
    let carried = ConversationState::from("tok0");

    let outcome = harness.run(Some(carried.clone())).await.unwrap();

    assert_eq!(outcome.conversation_state, Some(carried));
}

#[tokio::test]
async fn test_audio_forwarded_in_capture_order() {
    let harness = Harness::new(
        TurnScript::respond(vec![end_of_utterance()]).after_audio(3),
        vec![chunk(4, 1), chunk(4, 2), chunk(4, 3)],
    );

    harness.run(None).await.unwrap();

    let audio = harness.transport.audio(0);
    assert_eq!(audio.len(), 3);
    for (i, frame) in audio.iter().enumerate() {
        let value = i16::try_from(i + 1).unwrap();
        let expected: Vec<u8> = std::iter::repeat_n(value.to_le_bytes(), 4).flatten().collect();
        assert_eq!(frame, &expected);
    }
}

#[tokio::test]
async fn test_repeated_end_of_utterance_stops_once() {
    let harness = Harness::new(
        TurnScript::respond(vec![
            end_of_utterance(),
            end_of_utterance(),
            end_of_utterance(),
        ])
        .after_audio(1),
        vec![chunk(4, 0)],
    );

    harness.run(None).await.unwrap();

    assert_eq!(harness.notifier.count(InteractionState::Thinking), 1);
    assert_eq!(harness.capture.opens(), 1);
    assert_eq!(harness.capture.closes(), 1);
}

#[tokio::test]
async fn test_speaking_notified_once_per_turn() {
    let harness = Harness::new(
        TurnScript::respond(vec![
            end_of_utterance(),
            audio_out(&[1]),
            audio_out(&[2]),
            audio_out(&[3]),
        ]),
        vec![],
    );

    harness.run(None).await.unwrap();

    assert_eq!(
        harness.notifier.states(),
        vec![InteractionState::Thinking, InteractionState::Speaking]
    );
    assert_eq!(harness.playback.sent(), vec![vec![1], vec![2], vec![3]]);
}

#[tokio::test]
async fn test_device_actions_surfaced() {
    let harness = Harness::new(
        TurnScript::respond(vec![DialogResponse {
            device_action: Some(r#"{"command":"volume_up"}"#.to_string()),
            ..DialogResponse::default()
        }]),
        vec![],
    );

    let outcome = harness.run(None).await.unwrap();

    assert_eq!(outcome.device_actions, vec![r#"{"command":"volume_up"}"#.to_string()]);
}

#[tokio::test]
async fn test_service_error_notifies() {
    let harness = Harness::new(
        TurnScript::respond(vec![DialogResponse {
            error: Some("quota exceeded".to_string()),
            ..DialogResponse::default()
        }]),
        vec![],
    );

    let outcome = harness.run(None).await.unwrap();

    assert!(!outcome.continue_dialog);
    assert_eq!(harness.notifier.states(), vec![InteractionState::Error]);
}

#[tokio::test]
async fn test_finish_failure_is_error() {
    let harness = Harness::new(
        TurnScript::respond(vec![microphone(MicrophoneMode::DialogFollowOn)]).failing("reset"),
        vec![],
    );

    let result = harness.run(None).await;

    assert!(matches!(result, Err(Error::Transport(_))));
    // Playback is still released
    assert_eq!(harness.playback.calls().last(), Some(&PlaybackCall::Stop));
    assert_eq!(harness.capture.closes(), harness.capture.opens());
}

#[tokio::test]
async fn test_open_failure_is_error() {
    let transport = ScriptedTransport::new(vec![]);
    let capture = Arc::new(ScriptedCapture::new(EventLog::default(), vec![]));
    let mut playback = RecordingPlayback::default();
    let notifier = RecordingNotifier::default();
    let settings = DialogSettings::default();

    let result = DialogSession::new(&transport, capture.clone(), &mut playback, &notifier, &settings)
        .run(None)
        .await;

    assert!(matches!(result, Err(Error::Transport(_))));
    assert!(playback.calls().is_empty());
    assert_eq!(capture.opens(), 0);
}

#[tokio::test]
async fn test_capture_open_failure_fails_turn() {
    let transport = ScriptedTransport::new(vec![TurnScript::respond(vec![end_of_utterance()])]);
    let capture = Arc::new(ScriptedCapture::failing(EventLog::default()));
    let mut playback = RecordingPlayback::default();
    let notifier = RecordingNotifier::default();
    let settings = DialogSettings::default();

    let result = DialogSession::new(&transport, capture, &mut playback, &notifier, &settings)
        .with_backoff(FAST)
        .run(None)
        .await;

    assert!(matches!(result, Err(Error::Device(_))));
    assert_eq!(transport.turns_opened(), 1);
    assert_eq!(transport.audio(0).len(), 0);
    assert_eq!(playback.calls(), vec![PlaybackCall::Start, PlaybackCall::Stop]);
    assert!(notifier.states().is_empty());
}

#[tokio::test]
async fn test_queued_audio_plays_before_release() {
    let backlog = Duration::from_millis(100);
    let harness = Harness::new(
        TurnScript::respond(vec![end_of_utterance(), audio_out(&[1, 2])]),
        vec![],
    )
    .with_playback(RecordingPlayback::with_backlog(backlog));

    let started = Instant::now();
    harness.run(None).await.unwrap();

    assert!(started.elapsed() >= backlog);
    assert_eq!(harness.playback.calls().last(), Some(&PlaybackCall::Stop));
}
