//! **The Ear**: a local `RecognitionEngine` built from the default microphone,
//! WebRTC VAD segmentation and an `SttBackend`.
//!
//! Each closed speech segment is transcribed on a worker thread and reported as
//! one final result. While speech is in progress, and while any segment is
//! still being transcribed, the Ear sends empty partial results so the
//! capture's silence deadline keeps being rearmed. Slow transcription therefore
//! never ends an utterance early.

use crate::error::{VoiceError, VoiceResult};
use crate::recognition::{RecognitionEngine, RecognitionErrorKind, RecognitionEvent};
use crate::stt::SttBackend;
use crate::vad::{SegmentEvent, Segmenter, VadConfig, VadDetector};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{SampleFormat, Stream, StreamConfig};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Interval between keep-alive partials.
const KEEPALIVE_EVERY: Duration = Duration::from_millis(300);

/// How long the session thread waits for a frame before rechecking its stop flag.
const FRAME_WAIT: Duration = Duration::from_millis(100);

/// Microphone + VAD + STT recognition engine.
///
/// The cpal stream and the VAD are not `Send`, so both live on a dedicated
/// thread per session; `stop` signals that thread and returns immediately.
pub struct VoiceEar {
    vad: VadConfig,
    stt: Arc<dyn SttBackend>,
    running: Mutex<Option<Arc<AtomicBool>>>,
}

impl VoiceEar {
    pub fn new(vad: VadConfig, stt: Arc<dyn SttBackend>) -> Self {
        Self {
            vad,
            stt,
            running: Mutex::new(None),
        }
    }

    /// Names of the host's input devices.
    pub fn input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl RecognitionEngine for VoiceEar {
    fn is_available(&self) -> bool {
        cpal::default_host().default_input_device().is_some()
    }

    fn start(&self, events: mpsc::UnboundedSender<RecognitionEvent>) -> VoiceResult<()> {
        // A restart reuses the engine: the previous session thread is released first.
        self.stop();

        let stop = Arc::new(AtomicBool::new(false));
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let vad_config = self.vad.clone();
        let stt = Arc::clone(&self.stt);
        let thread_stop = Arc::clone(&stop);

        thread::Builder::new()
            .name("parley-ear".to_string())
            .spawn(move || run_session(vad_config, stt, events, thread_stop, ready_tx))?;

        ready_rx
            .recv()
            .map_err(|_| VoiceError::Recognition("ear thread exited during start".to_string()))??;

        *self.running.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop);
        info!("👂 Ear: listening");
        Ok(())
    }

    fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(stop) = running {
            stop.store(true, Ordering::SeqCst);
            debug!("Ear: stop requested");
        }
    }
}

/// Body of the per-session thread. Reports startup success or failure through
/// `ready` before entering the frame loop.
fn run_session(
    vad_config: VadConfig,
    stt: Arc<dyn SttBackend>,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    stop: Arc<AtomicBool>,
    ready: std_mpsc::Sender<VoiceResult<()>>,
) {
    let setup = (|| {
        let vad = VadDetector::new(vad_config.clone())?;
        let (frame_tx, frame_rx) = std_mpsc::channel::<Vec<f32>>();

        let ended = Arc::new(AtomicBool::new(false));
        let end_events = events.clone();
        let stream = open_microphone(vad_config.sample_rate, vad.chunk_size(), frame_tx, move || {
            if !ended.swap(true, Ordering::SeqCst) {
                let _ = end_events.send(RecognitionEvent::End);
            }
        })?;
        let transcriber =
            Transcriber::spawn(stt, vad_config.sample_rate, events.clone(), Arc::clone(&stop))?;
        Ok::<_, VoiceError>((vad, stream, frame_rx, transcriber))
    })();

    let (mut vad, stream, frame_rx, transcriber) = match setup {
        Ok(parts) => {
            let _ = ready.send(Ok(()));
            parts
        }
        Err(e) => {
            error!("Ear: failed to start: {}", e);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let mut pipeline = FramePipeline::new(&vad_config, transcriber, events);

    while !stop.load(Ordering::SeqCst) {
        match frame_rx.recv_timeout(FRAME_WAIT) {
            Ok(frame) => match vad.is_speech(&frame) {
                Ok(is_speech) => pipeline.push(is_speech, &frame),
                Err(e) => debug!("Ear: {}", e),
            },
            Err(std_mpsc::RecvTimeoutError::Timeout) => pipeline.tick(Instant::now()),
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    drop(stream);
    info!("👂 Ear: session ended");
}

/// Open the default input device in its native format and deliver mono frames
/// of `frame_len` samples at `sample_rate`. `on_error` runs on stream failure.
fn open_microphone<E>(
    sample_rate: u32,
    frame_len: usize,
    frames: std_mpsc::Sender<Vec<f32>>,
    on_error: E,
) -> VoiceResult<Stream>
where
    E: Fn() + Send + 'static,
{
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    let supported = device.default_input_config()?;
    let format = supported.sample_format();
    let config: StreamConfig = supported.config();
    info!(
        "🎤 Ear: {} ({} Hz, {} ch, {:?}) → {} Hz mono",
        device.name().unwrap_or_else(|_| "Unknown".to_string()),
        config.sample_rate.0,
        config.channels,
        format,
        sample_rate
    );

    let mut assembler =
        FrameAssembler::new(config.channels, config.sample_rate.0, sample_rate, frame_len);
    let mut deliver = move |frame: Vec<f32>| {
        // Receiver gone means the session is shutting down.
        let _ = frames.send(frame);
    };
    let on_stream_error = move |err: cpal::StreamError| {
        warn!("Ear: input stream error: {}", err);
        on_error();
    };

    let stream = match format {
        SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                assembler.push(data.iter().copied(), &mut deliver)
            },
            on_stream_error,
            None,
        )?,
        SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                assembler.push(data.iter().map(|&s| s as f32 / 32768.0), &mut deliver)
            },
            on_stream_error,
            None,
        )?,
        SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                assembler.push(
                    data.iter().map(|&s| (s as f32 - 32768.0) / 32768.0),
                    &mut deliver,
                )
            },
            on_stream_error,
            None,
        )?,
        other => {
            return Err(VoiceError::AudioDevice(format!(
                "Unsupported input sample format {:?}",
                other
            )))
        }
    };
    stream.play()?;
    Ok(stream)
}

/// Turns interleaved device samples into fixed-size mono frames at the VAD
/// rate. Channels are averaged; rate conversion averages the input samples
/// falling into each output slot (repeating the last one when upsampling).
struct FrameAssembler {
    channels: usize,
    /// Input samples per output sample.
    step: f64,
    until_next: f64,
    channel_sum: f32,
    channel_idx: usize,
    slot_sum: f32,
    slot_count: u32,
    last: f32,
    frame_len: usize,
    frame: Vec<f32>,
}

impl FrameAssembler {
    fn new(channels: u16, input_rate: u32, output_rate: u32, frame_len: usize) -> Self {
        let step = input_rate as f64 / output_rate.max(1) as f64;
        Self {
            channels: channels.max(1) as usize,
            step,
            until_next: step,
            channel_sum: 0.0,
            channel_idx: 0,
            slot_sum: 0.0,
            slot_count: 0,
            last: 0.0,
            frame_len,
            frame: Vec::with_capacity(frame_len),
        }
    }

    fn push(&mut self, samples: impl Iterator<Item = f32>, emit: &mut impl FnMut(Vec<f32>)) {
        for sample in samples {
            self.channel_sum += sample;
            self.channel_idx += 1;
            if self.channel_idx < self.channels {
                continue;
            }
            let mono = self.channel_sum / self.channels as f32;
            self.channel_sum = 0.0;
            self.channel_idx = 0;

            self.slot_sum += mono;
            self.slot_count += 1;
            self.until_next -= 1.0;
            while self.until_next <= 0.0 {
                let out = if self.slot_count > 0 {
                    self.slot_sum / self.slot_count as f32
                } else {
                    self.last
                };
                self.last = out;
                self.slot_sum = 0.0;
                self.slot_count = 0;
                self.until_next += self.step;

                self.frame.push(out);
                if self.frame.len() == self.frame_len {
                    emit(std::mem::replace(
                        &mut self.frame,
                        Vec::with_capacity(self.frame_len),
                    ));
                }
            }
        }
    }
}

/// Runs transcriptions one at a time, in segment order, off the frame loop.
struct Transcriber {
    jobs: std_mpsc::Sender<Vec<f32>>,
    /// Segments submitted whose result has not been sent yet.
    pending: Arc<AtomicUsize>,
}

impl Transcriber {
    fn spawn(
        stt: Arc<dyn SttBackend>,
        sample_rate: u32,
        events: mpsc::UnboundedSender<RecognitionEvent>,
        stop: Arc<AtomicBool>,
    ) -> VoiceResult<Self> {
        let (jobs, job_rx) = std_mpsc::channel::<Vec<f32>>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = Arc::clone(&pending);

        thread::Builder::new()
            .name("parley-stt".to_string())
            .spawn(move || {
                for samples in job_rx {
                    let event = match stt.transcribe(&samples, sample_rate) {
                        Ok(text) if text.trim().is_empty() => {
                            RecognitionEvent::Error(RecognitionErrorKind::NoSpeech)
                        }
                        Ok(text) => RecognitionEvent::final_text(text),
                        Err(e) => {
                            warn!("Ear: transcription failed: {}", e);
                            RecognitionEvent::Error(RecognitionErrorKind::ServiceUnavailable)
                        }
                    };
                    if !stop.load(Ordering::SeqCst) {
                        let _ = events.send(event);
                    }
                    // Only now may keep-alives stop.
                    worker_pending.fetch_sub(1, Ordering::SeqCst);
                }
            })?;

        Ok(Self { jobs, pending })
    }

    fn submit(&self, samples: Vec<f32>) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.jobs.send(samples).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            warn!("Ear: transcription worker gone, segment dropped");
        }
    }

    fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}

/// Per-session frame handling: segmentation, transcription hand-off and
/// keep-alive pacing. Independent of the device.
struct FramePipeline {
    segmenter: Segmenter,
    transcriber: Transcriber,
    events: mpsc::UnboundedSender<RecognitionEvent>,
    last_keepalive: Instant,
}

impl FramePipeline {
    fn new(
        config: &VadConfig,
        transcriber: Transcriber,
        events: mpsc::UnboundedSender<RecognitionEvent>,
    ) -> Self {
        Self {
            segmenter: Segmenter::new(config),
            transcriber,
            events,
            last_keepalive: Instant::now(),
        }
    }

    fn push(&mut self, is_speech: bool, frame: &[f32]) {
        match self.segmenter.push(is_speech, frame) {
            Some(SegmentEvent::Started) => self.keepalive(Instant::now()),
            Some(SegmentEvent::Completed(samples)) => {
                self.keepalive(Instant::now());
                self.transcriber.submit(samples);
            }
            Some(SegmentEvent::Discarded) => {
                let _ = self
                    .events
                    .send(RecognitionEvent::Error(RecognitionErrorKind::NoSpeech));
            }
            None => {}
        }
        self.tick(Instant::now());
    }

    /// Send a keep-alive if speech or a transcription is in flight and the last
    /// one is older than `KEEPALIVE_EVERY`.
    fn tick(&mut self, now: Instant) {
        let busy = self.segmenter.in_speech() || self.transcriber.pending() > 0;
        if busy && now.duration_since(self.last_keepalive) >= KEEPALIVE_EVERY {
            self.keepalive(now);
        }
    }

    fn keepalive(&mut self, now: Instant) {
        self.last_keepalive = now;
        let _ = self.events.send(RecognitionEvent::partial(""));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stt::PlaceholderStt;

    #[test]
    fn stop_without_start_is_harmless() {
        let ear = VoiceEar::new(VadConfig::default(), Arc::new(PlaceholderStt::new()));
        ear.stop();
        ear.stop();
    }

    #[test]
    fn invalid_vad_config_fails_start_cleanly() {
        let ear = VoiceEar::new(
            VadConfig {
                sample_rate: 44100,
                ..Default::default()
            },
            Arc::new(PlaceholderStt::new()),
        );
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(ear.start(tx), Err(VoiceError::VadInit(_))));
        assert!(ear.running.lock().unwrap().is_none());
    }

    fn collect(assembler: &mut FrameAssembler, samples: Vec<f32>) -> Vec<Vec<f32>> {
        let mut frames = Vec::new();
        assembler.push(samples.into_iter(), &mut |f| frames.push(f));
        frames
    }

    #[test]
    fn assembler_passes_mono_through() {
        let mut a = FrameAssembler::new(1, 16000, 16000, 4);
        let frames = collect(&mut a, vec![0.1, 0.2, 0.3, 0.4, 0.5]);
        assert_eq!(frames, vec![vec![0.1, 0.2, 0.3, 0.4]]);
        let frames = collect(&mut a, vec![0.6, 0.7, 0.8]);
        assert_eq!(frames, vec![vec![0.5, 0.6, 0.7, 0.8]]);
    }

    #[test]
    fn assembler_downmixes_and_decimates() {
        // 48 kHz stereo → 16 kHz mono: 3 input frames per output sample.
        let mut a = FrameAssembler::new(2, 48000, 16000, 2);
        let mut input = Vec::new();
        for _ in 0..6 {
            input.extend_from_slice(&[0.3, 0.1]);
        }
        let frames = collect(&mut a, input);
        assert_eq!(frames.len(), 1);
        for s in &frames[0] {
            assert!((s - 0.2).abs() < 1e-6);
        }
    }

    #[test]
    fn assembler_repeats_when_upsampling() {
        let mut a = FrameAssembler::new(1, 8000, 16000, 4);
        let frames = collect(&mut a, vec![0.5, -0.5]);
        assert_eq!(frames, vec![vec![0.5, 0.5, -0.5, -0.5]]);
    }

    /// Transcription that takes a while, like a remote API.
    struct SlowStt(Duration);

    impl SttBackend for SlowStt {
        fn transcribe(&self, _samples: &[f32], _sample_rate: u32) -> VoiceResult<String> {
            thread::sleep(self.0);
            Ok("turn on the lights".to_string())
        }
    }

    fn pipeline(
        stt: Arc<dyn SttBackend>,
    ) -> (FramePipeline, mpsc::UnboundedReceiver<RecognitionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(AtomicBool::new(false));
        let transcriber = Transcriber::spawn(stt, 16000, tx.clone(), stop).unwrap();
        let config = VadConfig {
            min_speech_ms: 90,
            segment_gap_ms: 90,
            ..Default::default()
        };
        (FramePipeline::new(&config, transcriber, tx), rx)
    }

    fn speak_one_segment(p: &mut FramePipeline) {
        let frame = [0.1f32; 4];
        for _ in 0..4 {
            p.push(true, &frame);
        }
        for _ in 0..3 {
            p.push(false, &frame);
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<RecognitionEvent>) -> Vec<RecognitionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn slow_transcription_is_kept_alive() {
        let (mut p, mut rx) = pipeline(Arc::new(SlowStt(Duration::from_millis(700))));
        speak_one_segment(&mut p);

        let mut events = Vec::new();
        for _ in 0..12 {
            thread::sleep(Duration::from_millis(100));
            p.tick(Instant::now());
            events.extend(drain(&mut rx));
        }
        assert_eq!(p.transcriber.pending(), 0);

        let final_at = events
            .iter()
            .position(|e| *e == RecognitionEvent::final_text("turn on the lights"))
            .expect("final result delivered");
        let keepalives = events[..final_at]
            .iter()
            .filter(|e| **e == RecognitionEvent::partial(""))
            .count();
        // Start, close, then at least two while the 700 ms call runs.
        assert!(keepalives >= 4, "only {} keep-alives", keepalives);

        // Nothing in flight: the Ear goes quiet so silence can end the utterance.
        thread::sleep(Duration::from_millis(400));
        p.tick(Instant::now());
        assert!(drain(&mut rx).is_empty());
    }

    #[test]
    fn empty_transcription_is_no_speech() {
        let (mut p, mut rx) = pipeline(Arc::new(PlaceholderStt::with_response("  ")));
        speak_one_segment(&mut p);
        drop(p);
        thread::sleep(Duration::from_millis(100));
        let events = drain(&mut rx);
        assert_eq!(
            events.last(),
            Some(&RecognitionEvent::Error(RecognitionErrorKind::NoSpeech))
        );
    }

    #[test]
    fn short_blip_reports_no_speech() {
        let (mut p, mut rx) = pipeline(Arc::new(PlaceholderStt::new()));
        let frame = [0.1f32; 4];
        p.push(true, &frame);
        for _ in 0..3 {
            p.push(false, &frame);
        }
        assert_eq!(
            drain(&mut rx),
            vec![
                RecognitionEvent::partial(""),
                RecognitionEvent::Error(RecognitionErrorKind::NoSpeech)
            ]
        );
        assert_eq!(p.transcriber.pending(), 0);
    }

    #[tokio::test]
    #[ignore] // Requires a microphone
    async fn listens_on_default_device() {
        let ear = VoiceEar::new(VadConfig::default(), Arc::new(PlaceholderStt::new()));
        let (tx, _rx) = mpsc::unbounded_channel();
        ear.start(tx).expect("microphone");
        tokio::time::sleep(Duration::from_millis(200)).await;
        ear.stop();
    }
}
