//! Conversation Controller - the façade over capture and playback
//!
//! Owns one `UtteranceCapture` and one `PlaybackScheduler` and enforces the one
//! contract between them: the system never listens and speaks at once. Starting
//! to listen cuts playback short (barge-in), and fragments that arrive while the
//! user holds the floor are dropped.

use crate::capture::{CaptureState, Utterance, UtteranceCapture};
use crate::config::ConversationConfig;
use crate::error::VoiceResult;
use crate::output::AudioOutput;
use crate::playback::{Fragment, PlaybackScheduler};
use crate::recognition::RecognitionEngine;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

/// Receivers for the controller's observable state.
pub struct ConversationObservers {
    pub listening: watch::Receiver<bool>,
    pub speaking: watch::Receiver<bool>,
    pub live_transcript: watch::Receiver<String>,
}

/// The conversation coordinator
///
/// This coordinates:
/// - Utterance capture (recognition engine, silence deadline)
/// - Playback scheduling (pre-buffer, ordered drain)
/// - Barge-in (listening interrupts speaking)
pub struct ConversationController {
    capture: UtteranceCapture,
    playback: PlaybackScheduler,
    utterance_rx: Option<mpsc::UnboundedReceiver<Utterance>>,
}

impl ConversationController {
    /// Create a controller over the host's recognition and output capabilities.
    pub fn new(
        config: ConversationConfig,
        engine: Arc<dyn RecognitionEngine>,
        output: Arc<dyn AudioOutput>,
    ) -> VoiceResult<Self> {
        config.validate()?;
        info!("🎭 Initializing Conversation Controller");

        let (capture, utterance_rx) = UtteranceCapture::new(config.capture, engine);
        let playback = PlaybackScheduler::new(config.playback, output);

        Ok(Self {
            capture,
            playback,
            utterance_rx: Some(utterance_rx),
        })
    }

    /// Take the finalized-utterance receiver. Only the first call gets it.
    pub fn take_utterance_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<Utterance>> {
        self.utterance_rx.take()
    }

    /// Stop listening if listening; otherwise silence playback and start
    /// listening. Returns whether capture is active afterwards.
    pub fn toggle_capture(&self) -> bool {
        if self.capture.state() == CaptureState::Listening {
            self.stop_capture();
            false
        } else {
            self.start_capture()
        }
    }

    /// Barge in: playback is stopped before the microphone opens. Returns
    /// `false` if the engine could not be started; nothing stays held then.
    pub fn start_capture(&self) -> bool {
        if self.playback.is_speaking() {
            info!("⚡ Barge-in: silencing playback to listen");
        }
        self.playback.stop();
        self.capture.start()
    }

    /// Stop listening; pending text is emitted as an utterance before this returns.
    pub fn stop_capture(&self) {
        self.capture.stop();
    }

    pub fn stop_playback(&self) {
        self.playback.stop();
    }

    /// Queue a fragment for playback. Dropped (returns `false`) while the user
    /// is being listened to, so output never feeds back into capture.
    pub fn enqueue_fragment(&self, fragment: Fragment) -> bool {
        if self.capture.is_listening() {
            debug!("Controller: dropping fragment while listening");
            return false;
        }
        self.playback.enqueue_fragment(fragment);
        true
    }

    pub fn mark_stream_complete(&self) {
        self.playback.mark_stream_complete();
    }

    /// Resolve once playback is idle (bounded by the configured wait).
    pub async fn wait_for_idle(&self) -> bool {
        self.playback.wait_for_idle().await
    }

    pub fn prepare_new_segment(&self) {
        self.playback.prepare_new_segment();
    }

    /// Stop both halves. Safe to call repeatedly.
    pub fn stop(&self) {
        self.capture.stop();
        self.playback.stop();
    }

    pub fn is_listening(&self) -> bool {
        self.capture.is_listening()
    }

    pub fn is_speaking(&self) -> bool {
        self.playback.is_speaking()
    }

    pub fn live_transcript(&self) -> String {
        self.capture.live_transcript()
    }

    pub fn observe(&self) -> ConversationObservers {
        ConversationObservers {
            listening: self.capture.subscribe_listening(),
            speaking: self.playback.subscribe_speaking(),
            live_transcript: self.capture.subscribe_live_transcript(),
        }
    }

    /// Capture half, e.g. for a host that feeds engine events directly.
    pub fn capture(&self) -> &UtteranceCapture {
        &self.capture
    }

    /// Playback half, e.g. for a producer task streaming fragments.
    pub fn playback(&self) -> &PlaybackScheduler {
        &self.playback
    }
}

impl Drop for ConversationController {
    fn drop(&mut self) {
        self.stop();
    }
}
