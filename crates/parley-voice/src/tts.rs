//! **Text-to-Speech** backends that produce playback fragments.
//!
//! A reply is split into sentences and each sentence is synthesized into one
//! encoded fragment, so playback can start before the whole reply is rendered.

use crate::error::{VoiceError, VoiceResult};

/// Backend that turns text into encoded audio bytes (WAV/MP3).
pub trait TtsBackend: Send + Sync {
    /// Synthesize text to audio bytes. Return an empty vec to skip playback.
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so nothing plays.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

impl TtsBackend for PlaceholderTts {
    fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// OpenAI-compatible speech API (`POST {base}/audio/speech`).
/// Configured from `TTS_API_URL`, `TTS_API_KEY` (or `OPENAI_API_KEY`), `TTS_MODEL` and `TTS_VOICE`.
#[derive(Debug, Clone)]
pub struct HttpTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    pub api_key: String,
    /// tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    /// alloy, echo, fable, onyx, nova, shimmer, ...
    pub voice: String,
    /// Requested container; "wav" decodes without extra codecs.
    pub response_format: String,
    client: reqwest::blocking::Client,
}

impl HttpTts {
    pub fn from_env() -> VoiceResult<Self> {
        let base_url =
            std::env::var("TTS_API_URL").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("TTS_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .map_err(|_| {
                VoiceError::Config("TTS requires TTS_API_KEY or OPENAI_API_KEY".to_string())
            })?;
        let model = std::env::var("TTS_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let tts = Self::new(base_url, api_key, model)?;
        Ok(match std::env::var("TTS_VOICE") {
            Ok(voice) if !voice.trim().is_empty() => tts.with_voice(voice.trim()),
            _ => tts,
        })
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            voice: "alloy".to_string(),
            response_format: "wav".to_string(),
            client,
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

impl TtsBackend for HttpTts {
    fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": self.response_format,
        });
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Split a reply into sentence-sized pieces for per-fragment synthesis.
/// Terminators (`.`, `!`, `?`, newline) stay with their sentence; empty pieces are dropped.
pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '\n' {
            push_sentence(&mut sentences, &mut current);
            continue;
        }
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            // Keep runs like "?!" or "..." together.
            while let Some(&next) = chars.peek() {
                if matches!(next, '.' | '!' | '?') {
                    current.push(next);
                    chars.next();
                } else {
                    break;
                }
            }
            // "3.5" is not a sentence end.
            if chars.peek().map_or(true, |n| n.is_whitespace()) {
                push_sentence(&mut sentences, &mut current);
            }
        }
    }
    push_sentence(&mut sentences, &mut current);
    sentences
}

fn push_sentence(sentences: &mut Vec<String>, current: &mut String) {
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }
    current.clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_tts_returns_empty() {
        let tts = PlaceholderTts;
        let out = tts.synthesize("hello").unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn splits_on_terminators() {
        assert_eq!(
            split_sentences("Hello there. How are you? Great!"),
            vec!["Hello there.", "How are you?", "Great!"]
        );
    }

    #[test]
    fn keeps_decimals_and_punctuation_runs() {
        assert_eq!(
            split_sentences("It costs 3.5 dollars... Really?! Yes"),
            vec!["It costs 3.5 dollars...", "Really?!", "Yes"]
        );
    }

    #[test]
    fn newlines_split_and_blanks_vanish() {
        assert_eq!(split_sentences("first line\n\n  second line  \n"), vec!["first line", "second line"]);
        assert!(split_sentences("   \n ").is_empty());
    }

    #[test]
    fn voice_override() {
        let tts = HttpTts::new("http://localhost", "key", "tts-1")
            .unwrap()
            .with_voice("nova");
        assert_eq!(tts.voice, "nova");
        assert_eq!(tts.response_format, "wav");
    }
}
