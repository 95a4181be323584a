//! # Parley Voice - Conversation Coordination
//!
//! This crate coordinates a spoken conversation with an assistant: it turns an
//! interruptible speech recognition session into discrete utterances, and it
//! plays the assistant's streamed audio reply in order with a small pre-buffer.
//! The system never listens and speaks at the same time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                  Conversation Controller                      │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────┐     │
//! │  │ Recognition  │→ │ Utterance      │→ │  Utterances  │     │
//! │  │ Engine (Ear) │  │ Capture        │  │  (channel)   │     │
//! │  └──────────────┘  │ (silence timer)│  └──────────────┘     │
//! │                    └────────────────┘          ↓            │
//! │  ┌──────────────┐  ┌────────────────┐  ┌──────────────┐     │
//! │  │ Audio Output │← │ Playback       │← │  Responder   │     │
//! │  │   (rodio)    │  │ Scheduler      │  │  + TTS       │     │
//! │  └──────────────┘  └────────────────┘  └──────────────┘     │
//! │           ↑ barge-in: listening stops playback               │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod controller;
pub mod ear;
pub mod error;
pub mod output;
pub mod playback;
pub mod recognition;
pub mod session;
pub mod stt;
pub mod tts;
pub mod vad;

pub use capture::{CaptureState, FinalizeReason, Utterance, UtteranceCapture};
pub use config::{CaptureConfig, ConversationConfig, PlaybackConfig};
pub use controller::{ConversationController, ConversationObservers};
pub use ear::VoiceEar;
pub use error::{VoiceError, VoiceResult};
pub use output::{AudioOutput, DecodedFragment, RodioOutput};
pub use playback::{Fragment, PlaybackScheduler};
pub use recognition::{RecognitionEngine, RecognitionErrorKind, RecognitionEvent};
pub use session::{run_conversation_loop, speak_reply};
pub use stt::{create_best_stt, pcm_f32_to_wav, HttpStt, PlaceholderStt, SttBackend};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use tts::{split_sentences, HttpTts, PlaceholderTts, TtsBackend};
pub use vad::{SegmentEvent, Segmenter, VadConfig, VadDetector};
