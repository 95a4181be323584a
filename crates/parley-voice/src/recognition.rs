//! Recognition capability: the contract between a speech engine and `UtteranceCapture`.
//!
//! An engine is started with a channel to deliver `RecognitionEvent`s on. Hosts
//! that get callbacks from a platform engine may instead call
//! `UtteranceCapture::handle_event` directly.

use crate::error::VoiceResult;
use std::fmt;
use tokio::sync::mpsc;

/// Everything an engine can report about a running session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionEvent {
    /// Partial (`is_final == false`) or finalized text.
    Result { text: String, is_final: bool },
    /// The engine ended its session on its own (platform interruption, timeout, ...).
    End,
    /// The engine reported a failure.
    Error(RecognitionErrorKind),
}

impl RecognitionEvent {
    pub fn partial(text: impl Into<String>) -> Self {
        RecognitionEvent::Result {
            text: text.into(),
            is_final: false,
        }
    }

    pub fn final_text(text: impl Into<String>) -> Self {
        RecognitionEvent::Result {
            text: text.into(),
            is_final: true,
        }
    }
}

/// Typed engine errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecognitionErrorKind {
    /// No speech was heard in the engine's own window.
    NoSpeech,
    /// Session aborted internally, typically around a restart.
    Aborted,
    /// Microphone or recognition permission denied or revoked.
    PermissionDenied,
    /// The recognition service cannot be reached or refused the request.
    ServiceUnavailable,
    Network,
    Other(String),
}

impl RecognitionErrorKind {
    /// Transient errors leave the session untouched; everything else tears it down.
    pub fn is_transient(&self) -> bool {
        matches!(self, RecognitionErrorKind::NoSpeech | RecognitionErrorKind::Aborted)
    }
}

impl fmt::Display for RecognitionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecognitionErrorKind::NoSpeech => write!(f, "no-speech"),
            RecognitionErrorKind::Aborted => write!(f, "aborted"),
            RecognitionErrorKind::PermissionDenied => write!(f, "not-allowed"),
            RecognitionErrorKind::ServiceUnavailable => write!(f, "service-not-allowed"),
            RecognitionErrorKind::Network => write!(f, "network"),
            RecognitionErrorKind::Other(s) => write!(f, "{}", s),
        }
    }
}

/// A continuous speech-recognition engine provided by the host.
///
/// `start` acquires the underlying resource (microphone, platform session) and
/// must leave nothing held when it returns an error. Calling `start` again after
/// an `End` event restarts the same resource.
pub trait RecognitionEngine: Send + Sync {
    /// Whether the capability exists on this host at all.
    fn is_available(&self) -> bool {
        true
    }

    fn start(&self, events: mpsc::UnboundedSender<RecognitionEvent>) -> VoiceResult<()>;

    /// Release the resource. Must be safe to call when not started.
    fn stop(&self);
}
