//! **Conversation loop**: utterance in, synthesized reply out.
//!
//! Each finalized utterance is handed to a responder (an LLM, a command
//! handler, an echo). The reply is split into sentences, each sentence is
//! synthesized into one fragment, and the fragments stream into the
//! controller's playback scheduler as one segment.

use crate::capture::Utterance;
use crate::controller::ConversationController;
use crate::error::VoiceResult;
use crate::tts::{split_sentences, TtsBackend};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Speak `reply` as a fresh playback segment. Returns how many fragments were
/// enqueued. Synthesis stops early if the user takes the floor.
pub async fn speak_reply(
    controller: &ConversationController,
    tts: &Arc<dyn TtsBackend>,
    reply: &str,
) -> VoiceResult<usize> {
    let sentences = split_sentences(reply);
    if sentences.is_empty() {
        return Ok(0);
    }

    controller.prepare_new_segment();
    let mut enqueued = 0;

    for sentence in sentences {
        if controller.is_listening() {
            info!("⚡ User took the floor; abandoning reply");
            break;
        }
        let backend = Arc::clone(tts);
        let text = sentence.clone();
        let bytes = match tokio::task::spawn_blocking(move || backend.synthesize(&text)).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("TTS failed for {:?}: {}", sentence, e);
                continue;
            }
            Err(e) => {
                warn!("TTS task failed: {}", e);
                continue;
            }
        };
        if bytes.is_empty() {
            debug!("TTS returned no audio for {:?}", sentence);
            continue;
        }
        if !controller.enqueue_fragment(bytes) {
            break;
        }
        enqueued += 1;
    }

    controller.mark_stream_complete();
    Ok(enqueued)
}

/// Runs the voice loop until the utterance channel closes: receive utterance →
/// responder → TTS → playback, waiting for playback to go idle before the next turn.
///
/// - `on_utterance`: called with each finalized utterance; return the reply to
///   speak. An empty reply is skipped.
pub async fn run_conversation_loop<F, Fut>(
    controller: &ConversationController,
    mut utterances: mpsc::UnboundedReceiver<Utterance>,
    tts: Arc<dyn TtsBackend>,
    on_utterance: F,
) -> VoiceResult<()>
where
    F: Fn(Utterance) -> Fut,
    Fut: Future<Output = String>,
{
    while let Some(utterance) = utterances.recv().await {
        info!("🗣️ Utterance ({:?}): {}", utterance.reason, utterance.text);
        let reply = on_utterance(utterance).await;
        if reply.trim().is_empty() {
            continue;
        }
        let enqueued = speak_reply(controller, &tts, &reply).await?;
        if enqueued > 0 && !controller.wait_for_idle().await {
            warn!("Playback did not go idle in time");
        }
    }
    info!("Conversation loop ended: utterance channel closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::tests::MockEngine;
    use crate::capture::FinalizeReason;
    use crate::config::{ConversationConfig, PlaybackConfig};
    use crate::error::VoiceError;
    use crate::playback::tests::{MockOutput, SharedMockOutput};
    use std::sync::Mutex;

    /// Synthesizes each sentence to its own text; sentences containing "fail" error.
    #[derive(Default)]
    struct EchoTts {
        calls: Mutex<Vec<String>>,
    }

    impl TtsBackend for EchoTts {
        fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
            self.calls.lock().unwrap().push(text.to_string());
            if text.contains("fail") {
                return Err(VoiceError::Tts("synthesis failed".into()));
            }
            if text.contains("mute") {
                return Ok(Vec::new());
            }
            Ok(text.as_bytes().to_vec())
        }
    }

    fn controller(output: &Arc<MockOutput>) -> ConversationController {
        let config = ConversationConfig {
            playback: PlaybackConfig {
                prebuffer_fragments: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        ConversationController::new(
            config,
            Arc::new(MockEngine::default()),
            Arc::new(SharedMockOutput(Arc::clone(output))),
        )
        .unwrap()
    }

    fn utterance(text: &str) -> Utterance {
        Utterance {
            text: text.to_string(),
            timestamp: chrono::Utc::now(),
            reason: FinalizeReason::Silence,
        }
    }

    #[tokio::test]
    async fn reply_sentences_play_in_order() {
        let output = MockOutput::auto();
        let controller = controller(&output);
        let tts: Arc<dyn TtsBackend> = Arc::new(EchoTts::default());
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(utterance("hello")).unwrap();
        drop(tx);

        run_conversation_loop(&controller, rx, tts, |u| async move {
            format!("You said {}. Anything else?", u.text)
        })
        .await
        .unwrap();

        assert_eq!(output.started(), vec!["You said hello.", "Anything else?"]);
        assert!(!controller.is_speaking());
    }

    #[tokio::test]
    async fn empty_reply_is_skipped() {
        let output = MockOutput::auto();
        let controller = controller(&output);
        let echo = Arc::new(EchoTts::default());
        let tts: Arc<dyn TtsBackend> = echo.clone();
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(utterance("hmm")).unwrap();
        drop(tx);

        run_conversation_loop(&controller, rx, tts, |_| async { "   ".to_string() })
            .await
            .unwrap();

        assert!(echo.calls.lock().unwrap().is_empty());
        assert!(output.started().is_empty());
    }

    #[tokio::test]
    async fn failed_and_silent_sentences_are_skipped() {
        let output = MockOutput::auto();
        let controller = controller(&output);
        let tts: Arc<dyn TtsBackend> = Arc::new(EchoTts::default());

        let enqueued = speak_reply(&controller, &tts, "One. This will fail. mute please. Two.")
            .await
            .unwrap();
        assert_eq!(enqueued, 2);
        assert!(controller.wait_for_idle().await);
        assert_eq!(output.started(), vec!["One.", "Two."]);
    }

    #[tokio::test]
    async fn reply_abandoned_while_listening() {
        let output = MockOutput::auto();
        let controller = controller(&output);
        let echo = Arc::new(EchoTts::default());
        let tts: Arc<dyn TtsBackend> = echo.clone();

        assert!(controller.start_capture());
        let enqueued = speak_reply(&controller, &tts, "First. Second.").await.unwrap();
        assert_eq!(enqueued, 0);
        assert!(echo.calls.lock().unwrap().is_empty());
        assert!(output.started().is_empty());
    }
}
