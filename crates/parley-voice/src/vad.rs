//! Voice activity detection with WebRTC VAD, plus a segmenter that cuts the
//! microphone stream into speech segments for a transcription backend.
//!
//! This only decides where speech starts and stops; the audio itself is passed
//! through untouched.

use crate::error::{VoiceError, VoiceResult};
use tracing::{debug, info};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,

    /// Speech shorter than this is dropped as noise (default: 200ms)
    pub min_speech_ms: u32,

    /// Silence after speech that closes a segment (default: 600ms)
    pub segment_gap_ms: u32,

    /// Segments are force-closed at this length (default: 15s)
    pub max_segment_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            mode: 2,
            min_speech_ms: 200,
            segment_gap_ms: 600,
            max_segment_ms: 15_000,
        }
    }
}

/// Voice Activity Detector using WebRTC VAD
pub struct VadDetector {
    vad: Vad,
    config: VadConfig,
    chunk_size: usize,
}

impl VadDetector {
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
            config.sample_rate, config.mode
        );

        let sample_rate = match config.sample_rate {
            8000 => SampleRate::Rate8kHz,
            16000 => SampleRate::Rate16kHz,
            32000 => SampleRate::Rate32kHz,
            48000 => SampleRate::Rate48kHz,
            other => {
                return Err(VoiceError::VadInit(format!(
                    "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                    other
                )))
            }
        };

        let vad_mode = match config.mode {
            0 => VadMode::Quality,
            1 => VadMode::LowBitrate,
            2 => VadMode::Aggressive,
            3 => VadMode::VeryAggressive,
            other => {
                return Err(VoiceError::VadInit(format!(
                    "VAD mode must be 0-3, got {}",
                    other
                )))
            }
        };

        // WebRTC VAD takes 10, 20 or 30 ms frames; we use 30 ms.
        let chunk_size = (config.sample_rate as usize * 30) / 1000;

        let mut vad = Vad::new();
        vad.set_mode(vad_mode);
        vad.set_sample_rate(sample_rate);

        Ok(Self {
            vad,
            config,
            chunk_size,
        })
    }

    /// Classify one 30 ms frame.
    pub fn is_speech(&mut self, audio: &[f32]) -> VoiceResult<bool> {
        if audio.len() != self.chunk_size {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.chunk_size,
                audio.len()
            )));
        }

        let audio_i16: Vec<i16> = audio
            .iter()
            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        self.vad
            .is_voice_segment(&audio_i16)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn config(&self) -> &VadConfig {
        &self.config
    }
}

/// What feeding one frame into the segmenter produced.
#[derive(Debug, Clone, PartialEq)]
pub enum SegmentEvent {
    /// Speech began.
    Started,
    /// A segment closed; samples cover speech start to the end of the gap.
    Completed(Vec<f32>),
    /// A segment closed but was too short to be speech.
    Discarded,
}

/// Gap logic over per-frame speech decisions.
#[derive(Debug)]
pub struct Segmenter {
    frame_ms: u32,
    min_speech_ms: u32,
    gap_ms: u32,
    max_ms: u32,
    in_speech: bool,
    /// Voiced time in the open segment.
    speech_ms: u32,
    /// Current run of silence; reset by every voiced frame.
    silence_ms: u32,
    /// Wall length of the open segment, pauses included.
    elapsed_ms: u32,
    buffer: Vec<f32>,
}

impl Segmenter {
    pub fn new(config: &VadConfig) -> Self {
        Self {
            frame_ms: 30,
            min_speech_ms: config.min_speech_ms,
            gap_ms: config.segment_gap_ms,
            max_ms: config.max_segment_ms,
            in_speech: false,
            speech_ms: 0,
            silence_ms: 0,
            elapsed_ms: 0,
            buffer: Vec::new(),
        }
    }

    /// A segment is open.
    pub fn in_speech(&self) -> bool {
        self.in_speech
    }

    pub fn push(&mut self, is_speech: bool, frame: &[f32]) -> Option<SegmentEvent> {
        match (self.in_speech, is_speech) {
            (false, false) => None,
            (false, true) => {
                self.in_speech = true;
                self.speech_ms = self.frame_ms;
                self.silence_ms = 0;
                self.elapsed_ms = self.frame_ms;
                self.buffer.clear();
                self.buffer.extend_from_slice(frame);
                debug!("Segmenter: speech started");
                Some(SegmentEvent::Started)
            }
            (true, speech) => {
                self.buffer.extend_from_slice(frame);
                self.elapsed_ms += self.frame_ms;
                if speech {
                    self.speech_ms += self.frame_ms;
                    self.silence_ms = 0;
                } else {
                    self.silence_ms += self.frame_ms;
                }
                if self.silence_ms >= self.gap_ms || self.elapsed_ms >= self.max_ms {
                    Some(self.close())
                } else {
                    None
                }
            }
        }
    }

    fn close(&mut self) -> SegmentEvent {
        self.in_speech = false;
        let speech_ms = self.speech_ms;
        self.speech_ms = 0;
        self.silence_ms = 0;
        self.elapsed_ms = 0;
        let samples = std::mem::take(&mut self.buffer);
        if speech_ms < self.min_speech_ms {
            debug!("Segmenter: {}ms of speech is too short, dropped", speech_ms);
            SegmentEvent::Discarded
        } else {
            SegmentEvent::Completed(samples)
        }
    }
}
