//! Utterance capture: turns a continuous, interruptible recognition session into
//! discrete finalized utterances.
//!
//! Every result (partial or final) rearms a silence deadline; the deadline firing
//! is the only natural end of an utterance. Spontaneous engine ends are absorbed by
//! restarting the same engine, so the user never sees the interruption.

use crate::config::CaptureConfig;
use crate::recognition::{RecognitionEngine, RecognitionErrorKind, RecognitionEvent};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a capture session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    Idle,
    Listening,
    /// Set while a session is being torn down so engine end signals are not
    /// mistaken for spontaneous interruptions.
    StoppingIntentionally,
}

/// Why an utterance was finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizeReason {
    Silence,
    Stopped,
    /// The engine ended and could not be restarted.
    EngineLost,
}

/// One finalized block of user speech.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub reason: FinalizeReason,
}

struct CaptureSession {
    state: CaptureState,
    /// Bumped on every start; events and timers from older sessions are dropped.
    generation: u64,
    /// Bumped on every rearm of the silence deadline.
    silence_epoch: u64,
    accumulated: String,
    silence: Option<CancellationToken>,
    pump: Option<CancellationToken>,
    restarts: VecDeque<Instant>,
}

impl CaptureSession {
    fn new() -> Self {
        Self {
            state: CaptureState::Idle,
            generation: 0,
            silence_epoch: 0,
            accumulated: String::new(),
            silence: None,
            pump: None,
            restarts: VecDeque::new(),
        }
    }

    fn cancel_timers(&mut self) {
        if let Some(token) = self.silence.take() {
            token.cancel();
        }
        if let Some(token) = self.pump.take() {
            token.cancel();
        }
    }
}

struct CaptureInner {
    config: CaptureConfig,
    engine: Arc<dyn RecognitionEngine>,
    session: Mutex<CaptureSession>,
    utterance_tx: mpsc::UnboundedSender<Utterance>,
    listening_tx: watch::Sender<bool>,
    live_tx: watch::Sender<String>,
}

/// Drives one recognition engine and emits `Utterance`s on a channel.
///
/// Cheap to clone; clones share the same session. Must be used from within a
/// tokio runtime (timers and the event pump are spawned tasks).
#[derive(Clone)]
pub struct UtteranceCapture {
    inner: Arc<CaptureInner>,
}

impl UtteranceCapture {
    /// Create a capture over `engine`. The receiver yields finalized utterances.
    pub fn new(
        config: CaptureConfig,
        engine: Arc<dyn RecognitionEngine>,
    ) -> (Self, mpsc::UnboundedReceiver<Utterance>) {
        let (utterance_tx, utterance_rx) = mpsc::unbounded_channel();
        let (listening_tx, _) = watch::channel(false);
        let (live_tx, _) = watch::channel(String::new());

        let capture = Self {
            inner: Arc::new(CaptureInner {
                config,
                engine,
                session: Mutex::new(CaptureSession::new()),
                utterance_tx,
                listening_tx,
                live_tx,
            }),
        };
        (capture, utterance_rx)
    }

    /// Start listening. Returns `false` (and stays idle) if the engine is
    /// unavailable or fails to acquire its resource; the caller may retry.
    ///
    /// No silence deadline is armed here: a microphone nobody has spoken into yet
    /// must not time out.
    pub fn start(&self) -> bool {
        if !self.inner.engine.is_available() {
            debug!("Capture: recognition engine unavailable, start ignored");
            return false;
        }

        let generation = {
            let mut session = self.inner.lock();
            match session.state {
                CaptureState::Listening => return true,
                CaptureState::StoppingIntentionally => return false,
                CaptureState::Idle => {}
            }
            session.generation += 1;
            session.accumulated.clear();
            session.restarts.clear();
            session.state = CaptureState::Listening;
            session.generation
        };

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(e) = self.inner.engine.start(events_tx) {
            warn!("Capture: engine failed to start: {}", e);
            let mut session = self.inner.lock();
            if session.generation == generation {
                session.state = CaptureState::Idle;
            }
            return false;
        }

        {
            let mut session = self.inner.lock();
            if session.generation != generation || session.state != CaptureState::Listening {
                return false;
            }
            session.pump = Some(self.inner.spawn_pump(generation, events_rx));
        }
        self.inner.live_tx.send_replace(String::new());
        self.inner.listening_tx.send_replace(true);
        info!("🎤 Capture started (session {})", generation);
        true
    }

    /// Stop intentionally. Any accumulated text is emitted before this returns.
    /// Safe to call when already idle.
    pub fn stop(&self) {
        let generation = self.inner.lock().generation;
        self.inner.finish(generation, true, FinalizeReason::Stopped);
    }

    /// Feed one engine event into the current session.
    pub fn handle_event(&self, event: RecognitionEvent) {
        let generation = self.inner.lock().generation;
        self.inner.apply(generation, event);
    }

    pub fn state(&self) -> CaptureState {
        self.inner.lock().state
    }

    pub fn is_listening(&self) -> bool {
        self.state() == CaptureState::Listening
    }

    /// Finalized text accumulated so far in the current session.
    pub fn accumulated_text(&self) -> String {
        self.inner.lock().accumulated.clone()
    }

    /// Accumulated text plus the current unfinalized partial, for display.
    pub fn live_transcript(&self) -> String {
        self.inner.live_tx.borrow().clone()
    }

    pub fn subscribe_listening(&self) -> watch::Receiver<bool> {
        self.inner.listening_tx.subscribe()
    }

    pub fn subscribe_live_transcript(&self) -> watch::Receiver<String> {
        self.inner.live_tx.subscribe()
    }
}

impl CaptureInner {
    fn lock(&self) -> MutexGuard<'_, CaptureSession> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The single transition function for engine events.
    fn apply(self: &Arc<Self>, generation: u64, event: RecognitionEvent) {
        match event {
            RecognitionEvent::Result { text, is_final } => {
                self.on_result(generation, &text, is_final)
            }
            RecognitionEvent::End => self.on_engine_end(generation),
            RecognitionEvent::Error(kind) => self.on_engine_error(generation, kind),
        }
    }

    fn on_result(self: &Arc<Self>, generation: u64, text: &str, is_final: bool) {
        let live = {
            let mut session = self.lock();
            if session.generation != generation || session.state != CaptureState::Listening {
                return;
            }
            let text = text.trim();
            if is_final && !text.is_empty() {
                if !session.accumulated.is_empty() {
                    session.accumulated.push(' ');
                }
                session.accumulated.push_str(text);
            }
            self.rearm_silence(&mut session);

            let mut live = session.accumulated.clone();
            if !is_final && !text.is_empty() {
                if !live.is_empty() {
                    live.push(' ');
                }
                live.push_str(text);
            }
            live
        };
        debug!("Capture: result (final: {}) -> {:?}", is_final, live);
        self.live_tx.send_replace(live);
    }

    fn on_engine_end(self: &Arc<Self>, generation: u64) {
        {
            let mut session = self.lock();
            if session.generation != generation || session.state != CaptureState::Listening {
                return;
            }
            let now = Instant::now();
            let window = self.config.restart_window();
            while let Some(&oldest) = session.restarts.front() {
                if now.duration_since(oldest) > window {
                    session.restarts.pop_front();
                } else {
                    break;
                }
            }
            session.restarts.push_back(now);
            if session.restarts.len() > self.config.max_restarts as usize {
                drop(session);
                warn!(
                    "Capture: engine ended more than {} times in {:?}, giving up",
                    self.config.max_restarts, window
                );
                self.finish(generation, false, FinalizeReason::EngineLost);
                return;
            }
        }

        debug!("Capture: engine ended while listening, restarting");
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        match self.engine.start(events_tx) {
            Ok(()) => {
                let mut session = self.lock();
                if session.generation != generation || session.state != CaptureState::Listening {
                    return;
                }
                if let Some(old) = session.pump.take() {
                    old.cancel();
                }
                session.pump = Some(self.spawn_pump(generation, events_rx));
            }
            Err(e) => {
                warn!("Capture: restart failed ({}), finalizing session", e);
                self.finish(generation, true, FinalizeReason::EngineLost);
            }
        }
    }

    fn on_engine_error(self: &Arc<Self>, generation: u64, kind: RecognitionErrorKind) {
        if kind.is_transient() {
            debug!("Capture: transient engine error ({}), continuing", kind);
            return;
        }
        warn!("Capture: fatal engine error ({}), dropping session", kind);
        self.finish(generation, false, FinalizeReason::EngineLost);
    }

    fn on_silence(self: &Arc<Self>, generation: u64, epoch: u64) {
        {
            let session = self.lock();
            if session.generation != generation
                || session.silence_epoch != epoch
                || session.state != CaptureState::Listening
            {
                return;
            }
        }
        debug!("Capture: silence deadline reached");
        self.finish(generation, true, FinalizeReason::Silence);
    }

    /// Tear the session down. With `flush`, non-empty accumulated text is
    /// emitted exactly once; otherwise it is discarded.
    fn finish(self: &Arc<Self>, generation: u64, flush: bool, reason: FinalizeReason) {
        let text = {
            let mut session = self.lock();
            if session.generation != generation || session.state != CaptureState::Listening {
                return;
            }
            session.state = CaptureState::StoppingIntentionally;
            session.cancel_timers();
            session.restarts.clear();
            std::mem::take(&mut session.accumulated)
        };

        if flush && !text.is_empty() {
            info!("🎯 Utterance finalized ({:?}): {} chars", reason, text.len());
            let utterance = Utterance {
                text,
                timestamp: Utc::now(),
                reason,
            };
            if let Err(e) = self.utterance_tx.send(utterance) {
                warn!("Capture: utterance receiver dropped: {}", e);
            }
        }

        self.engine.stop();

        {
            let mut session = self.lock();
            if session.generation == generation {
                session.state = CaptureState::Idle;
            }
        }
        self.live_tx.send_replace(String::new());
        self.listening_tx.send_replace(false);
        info!("🛑 Capture idle (session {})", generation);
    }

    fn rearm_silence(self: &Arc<Self>, session: &mut CaptureSession) {
        if let Some(old) = session.silence.take() {
            old.cancel();
        }
        session.silence_epoch += 1;

        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Capture: no tokio runtime, silence deadline not armed");
            return;
        };
        let token = CancellationToken::new();
        let generation = session.generation;
        let epoch = session.silence_epoch;
        let timeout = self.config.silence_timeout();
        let inner = Arc::clone(self);
        let cancelled = token.clone();
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => inner.on_silence(generation, epoch),
            }
        });
        session.silence = Some(token);
    }

    /// Forward engine events from `rx` into the transition function until the
    /// channel closes or the pump is cancelled.
    fn spawn_pump(
        self: &Arc<Self>,
        generation: u64,
        mut rx: mpsc::UnboundedReceiver<RecognitionEvent>,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Capture: no tokio runtime, engine events must be fed via handle_event");
            return token;
        };
        let inner = Arc::clone(self);
        let cancelled = token.clone();
        runtime.spawn(async move {
            loop {
                let event = tokio::select! {
                    biased;
                    _ = cancelled.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                inner.apply(generation, event);
            }
        });
        token
    }
}
