//! Integration tests for the conversation controller
//!
//! Drives the public API with an in-memory recognition engine and audio output.
//! The hardware test at the bottom needs a microphone and is ignored by default.

use parley_voice::{
    AudioOutput, CaptureConfig, ConversationConfig, ConversationController, DecodedFragment,
    FinalizeReason, PlaybackConfig, PlaceholderStt, RecognitionEngine, RecognitionErrorKind,
    RecognitionEvent, VadConfig, VoiceEar, VoiceError, VoiceResult,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Engine that forwards whatever the test sends on its latest session channel.
#[derive(Default)]
struct ScriptedEngine {
    sender: Mutex<Option<mpsc::UnboundedSender<RecognitionEvent>>>,
}

impl ScriptedEngine {
    fn say(&self, event: RecognitionEvent) {
        let sender = self.sender.lock().unwrap();
        sender.as_ref().expect("engine not started").send(event).unwrap();
    }
}

impl RecognitionEngine for ScriptedEngine {
    fn start(&self, events: mpsc::UnboundedSender<RecognitionEvent>) -> VoiceResult<()> {
        *self.sender.lock().unwrap() = Some(events);
        Ok(())
    }

    fn stop(&self) {}
}

/// Output whose fragments render until the test finishes them.
#[derive(Default)]
struct HeldOutput {
    log: Mutex<Vec<String>>,
    pending: Mutex<Vec<oneshot::Sender<()>>>,
}

impl HeldOutput {
    fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn finish_all(&self) {
        for done in self.pending.lock().unwrap().drain(..) {
            let _ = done.send(());
        }
    }
}

struct HeldFragment {
    name: String,
    output: Arc<HeldOutput>,
}

impl DecodedFragment for HeldFragment {
    fn start(&mut self) -> VoiceResult<oneshot::Receiver<()>> {
        self.output.log.lock().unwrap().push(format!("start {}", self.name));
        let (tx, rx) = oneshot::channel();
        self.output.pending.lock().unwrap().push(tx);
        Ok(rx)
    }

    fn stop(&mut self) {
        self.output.log.lock().unwrap().push(format!("stop {}", self.name));
    }
}

struct SharedOutput(Arc<HeldOutput>);

impl AudioOutput for SharedOutput {
    fn decode(&self, bytes: &[u8]) -> VoiceResult<Box<dyn DecodedFragment>> {
        if bytes.is_empty() {
            return Err(VoiceError::Decode("empty fragment".into()));
        }
        Ok(Box::new(HeldFragment {
            name: String::from_utf8_lossy(bytes).to_string(),
            output: Arc::clone(&self.0),
        }))
    }
}

fn setup() -> (ConversationController, Arc<ScriptedEngine>, Arc<HeldOutput>) {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let engine = Arc::new(ScriptedEngine::default());
    let output = Arc::new(HeldOutput::default());
    let config = ConversationConfig {
        capture: CaptureConfig {
            silence_timeout_ms: 1500,
            ..Default::default()
        },
        playback: PlaybackConfig {
            prebuffer_fragments: 3,
            prebuffer_timeout_ms: 400,
            ..Default::default()
        },
    };
    let controller = tokio_test::assert_ok!(ConversationController::new(
        config,
        engine.clone(),
        Arc::new(SharedOutput(Arc::clone(&output))),
    ));
    (controller, engine, output)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test(start_paused = true)]
async fn full_turn_with_barge_in() {
    let (mut controller, engine, output) = setup();
    let mut utterances = controller.take_utterance_receiver().unwrap();

    // The user speaks; results arrive through the engine channel.
    assert!(controller.toggle_capture());
    engine.say(RecognitionEvent::partial("Hel"));
    engine.say(RecognitionEvent::final_text("Hello"));
    engine.say(RecognitionEvent::partial("wor"));
    engine.say(RecognitionEvent::final_text("world"));
    settle().await;
    assert_eq!(controller.live_transcript(), "Hello world");

    // A transient hiccup keeps the session alive.
    engine.say(RecognitionEvent::Error(RecognitionErrorKind::NoSpeech));
    settle().await;
    assert!(controller.is_listening());

    tokio::time::sleep(Duration::from_millis(1600)).await;
    let utterance = utterances.try_recv().unwrap();
    assert_eq!(utterance.text, "Hello world");
    assert_eq!(utterance.reason, FinalizeReason::Silence);
    assert!(utterances.try_recv().is_err());
    assert!(!controller.is_listening());
    assert_eq!(controller.live_transcript(), "");

    // The reply streams in; three fragments reach the pre-buffer threshold.
    controller.prepare_new_segment();
    for name in ["r1", "r2", "r3", "r4"] {
        assert!(controller.enqueue_fragment(name.as_bytes().to_vec()));
    }
    settle().await;
    assert!(controller.is_speaking());
    assert_eq!(output.log(), vec!["start r1"]);

    output.finish_all();
    settle().await;
    assert_eq!(output.log(), vec!["start r1", "start r2"]);

    // The user interrupts.
    assert!(controller.toggle_capture());
    assert!(!controller.is_speaking());
    assert_eq!(output.log(), vec!["start r1", "start r2", "stop r2"]);
    assert!(!controller.enqueue_fragment(b"late".to_vec()));

    engine.say(RecognitionEvent::final_text("stop talking"));
    settle().await;
    controller.stop();
    assert_eq!(utterances.try_recv().unwrap().text, "stop talking");
    assert!(!controller.is_listening());
    assert!(!controller.is_speaking());
}

#[tokio::test(start_paused = true)]
async fn short_reply_plays_after_prebuffer_timeout() {
    let (controller, _engine, output) = setup();

    controller.prepare_new_segment();
    controller.enqueue_fragment(b"only".to_vec());
    controller.mark_stream_complete();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(output.log().is_empty());

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(output.log(), vec!["start only"]);

    output.finish_all();
    assert!(controller.wait_for_idle().await);
    assert!(!controller.is_speaking());
    // Ending on its own is not a cut.
    assert_eq!(output.log(), vec!["start only"]);
}

#[tokio::test(start_paused = true)]
async fn undecodable_fragment_is_skipped() {
    let (controller, _engine, output) = setup();

    controller.prepare_new_segment();
    controller.enqueue_fragment(b"a".to_vec());
    controller.enqueue_fragment(Vec::new());
    controller.enqueue_fragment(b"b".to_vec());
    controller.mark_stream_complete();
    settle().await;
    output.finish_all();
    settle().await;
    assert_eq!(output.log(), vec!["start a", "start b"]);

    output.finish_all();
    assert!(controller.wait_for_idle().await);
}

#[tokio::test]
#[ignore] // Requires a microphone
async fn ear_lifecycle_on_real_device() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let ear = VoiceEar::new(VadConfig::default(), Arc::new(PlaceholderStt::new()));
    if !ear.is_available() {
        return;
    }
    let mut controller = ConversationController::new(
        ConversationConfig::default(),
        Arc::new(ear),
        Arc::new(SharedOutput(Arc::new(HeldOutput::default()))),
    )
    .expect("controller");
    let _utterances = controller.take_utterance_receiver();

    assert!(controller.toggle_capture());
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(!controller.toggle_capture());
}
