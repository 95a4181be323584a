//! Playback scheduling: gapless, strictly ordered rendering of encoded fragments
//! that arrive at irregular intervals.
//!
//! Fragments are pre-buffered until either `prebuffer_fragments` are queued or
//! `prebuffer_timeout` has passed since the first one, then drained one at a time.
//! When the queue runs dry the drain loop polls for a while (longer while the
//! producer is still streaming) before going quiet.

use crate::config::PlaybackConfig;
use crate::output::{AudioOutput, DecodedFragment};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One opaque encoded unit of synthesized speech.
pub type Fragment = Vec<u8>;

/// FIFO of fragments not yet handed to the output.
#[derive(Debug)]
struct FragmentQueue {
    fragments: VecDeque<Fragment>,
    buffering: bool,
    stream_complete: bool,
}

impl FragmentQueue {
    fn new() -> Self {
        Self {
            fragments: VecDeque::new(),
            buffering: true,
            stream_complete: false,
        }
    }
}

/// Ownership of the fragment currently rendering. Dropping it after a natural
/// end releases the output; `cut` ends rendering early.
struct PlaybackHandle {
    id: u64,
    fragment: Box<dyn DecodedFragment>,
}

impl PlaybackHandle {
    fn cut(mut self) {
        self.fragment.stop();
    }
}

struct SchedulerState {
    queue: FragmentQueue,
    /// The drain loop is running (rendering or polling an empty queue).
    playing: bool,
    /// A fragment has been dequeued and is being decoded or started.
    starting: bool,
    rendering: Option<PlaybackHandle>,
    prebuffer: Option<CancellationToken>,
    drain: Option<CancellationToken>,
    /// Bumped by `stop`; work started under an older epoch is discarded.
    epoch: u64,
    next_handle_id: u64,
}

impl SchedulerState {
    fn is_idle(&self) -> bool {
        self.queue.fragments.is_empty() && !self.starting && self.rendering.is_none()
    }

    /// Audio is rendering or about to: queued fragments only count once the
    /// drain loop owns them.
    fn is_speaking(&self) -> bool {
        self.rendering.is_some()
            || self.starting
            || (self.playing && !self.queue.fragments.is_empty())
    }
}

struct SchedulerInner {
    config: PlaybackConfig,
    output: Arc<dyn AudioOutput>,
    state: Mutex<SchedulerState>,
    speaking_tx: watch::Sender<bool>,
}

/// Plays enqueued fragments in arrival order with a pre-buffer in front.
///
/// Cheap to clone; clones share one queue. Must be used from within a tokio runtime.
#[derive(Clone)]
pub struct PlaybackScheduler {
    inner: Arc<SchedulerInner>,
}

impl PlaybackScheduler {
    pub fn new(config: PlaybackConfig, output: Arc<dyn AudioOutput>) -> Self {
        let (speaking_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                output,
                state: Mutex::new(SchedulerState {
                    queue: FragmentQueue::new(),
                    playing: false,
                    starting: false,
                    rendering: None,
                    prebuffer: None,
                    drain: None,
                    epoch: 0,
                    next_handle_id: 0,
                }),
                speaking_tx,
            }),
        }
    }

    /// Append a fragment. New data means the stream is active again.
    pub fn enqueue_fragment(&self, fragment: Fragment) {
        let mut state = self.inner.lock();
        state.queue.fragments.push_back(fragment);
        state.queue.stream_complete = false;

        if state.queue.buffering {
            if state.queue.fragments.len() >= self.inner.config.prebuffer_fragments {
                debug!(
                    "Playback: pre-buffer threshold reached ({} fragments)",
                    state.queue.fragments.len()
                );
                self.inner.end_buffering(&mut state);
            } else if state.prebuffer.is_none() {
                self.inner.arm_prebuffer(&mut state);
            }
        } else if !state.playing {
            self.inner.start_drain(&mut state);
        }
        self.inner.publish_speaking(&state);
    }

    /// The producer will send nothing more for the current reply.
    pub fn mark_stream_complete(&self) {
        self.inner.lock().queue.stream_complete = true;
        debug!("Playback: stream marked complete");
    }

    /// Discard everything: queued fragments, the pre-buffer timer and the fragment
    /// currently rendering. The next fragment re-buffers. Idempotent.
    pub fn stop(&self) {
        let rendering = {
            let mut state = self.inner.lock();
            state.epoch += 1;
            state.queue.fragments.clear();
            state.queue.buffering = true;
            state.queue.stream_complete = false;
            if let Some(timer) = state.prebuffer.take() {
                timer.cancel();
            }
            if let Some(drain) = state.drain.take() {
                drain.cancel();
            }
            state.playing = false;
            state.starting = false;
            state.rendering.take()
        };
        if let Some(handle) = rendering {
            debug!("Playback: cutting fragment {} short", handle.id);
            handle.cut();
        }
        if self.inner.speaking_tx.send_replace(false) {
            info!("⏹️ Playback stopped");
        }
    }

    /// Re-apply the pre-buffer policy to the next fragments without touching
    /// whatever is still queued from the previous reply.
    pub fn prepare_new_segment(&self) {
        let mut state = self.inner.lock();
        state.queue.buffering = true;
        if let Some(timer) = state.prebuffer.take() {
            timer.cancel();
        }
        debug!("Playback: new segment, buffering re-armed");
    }

    /// Resolve once nothing is queued and nothing renders, or after
    /// `idle_wait_timeout`. Returns whether idle was reached.
    pub async fn wait_for_idle(&self) -> bool {
        let deadline = Instant::now() + self.inner.config.idle_wait_timeout();
        loop {
            if self.is_idle() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Playback: still busy after {:?}, giving up wait", self.inner.config.idle_wait_timeout());
                return false;
            }
            let step = self.inner.config.idle_poll().min(deadline - now);
            tokio::time::sleep(step).await;
        }
    }

    /// Nothing queued and nothing rendering.
    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    /// A fragment is rendering, or the drain loop is about to render one.
    pub fn is_speaking(&self) -> bool {
        self.inner.lock().is_speaking()
    }

    /// The drain loop is active, including while it polls an empty queue.
    pub fn is_draining(&self) -> bool {
        self.inner.lock().playing
    }

    pub fn is_buffering(&self) -> bool {
        self.inner.lock().queue.buffering
    }

    pub fn is_rendering(&self) -> bool {
        self.inner.lock().rendering.is_some()
    }

    pub fn queued(&self) -> usize {
        self.inner.lock().queue.fragments.len()
    }

    pub fn subscribe_speaking(&self) -> watch::Receiver<bool> {
        self.inner.speaking_tx.subscribe()
    }
}

impl SchedulerInner {
    fn lock(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_speaking(&self, state: &SchedulerState) {
        let speaking = state.is_speaking();
        let was = self.speaking_tx.send_replace(speaking);
        if speaking && !was {
            info!("▶️ Playback started");
        } else if !speaking && was {
            debug!("Playback: fell silent");
        }
    }

    /// Clear the dequeued-fragment marker after it failed to reach the output.
    fn abandon_start(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch == epoch {
            state.starting = false;
            self.publish_speaking(&state);
        }
    }

    fn end_buffering(self: &Arc<Self>, state: &mut SchedulerState) {
        state.queue.buffering = false;
        if let Some(timer) = state.prebuffer.take() {
            timer.cancel();
        }
        if !state.playing && !state.queue.fragments.is_empty() {
            self.start_drain(state);
        }
    }

    fn arm_prebuffer(self: &Arc<Self>, state: &mut SchedulerState) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Playback: no tokio runtime, pre-buffer timer not armed");
            return;
        };
        let token = CancellationToken::new();
        let cancelled = token.clone();
        let epoch = state.epoch;
        let timeout = self.config.prebuffer_timeout();
        let inner = Arc::clone(self);
        runtime.spawn(async move {
            tokio::select! {
                biased;
                _ = cancelled.cancelled() => {}
                _ = tokio::time::sleep(timeout) => {
                    let mut state = inner.lock();
                    if state.epoch == epoch && state.queue.buffering && !cancelled.is_cancelled() {
                        debug!("Playback: pre-buffer timeout, starting with {} fragments", state.queue.fragments.len());
                        state.prebuffer = None;
                        inner.end_buffering(&mut state);
                    }
                }
            }
        });
        state.prebuffer = Some(token);
    }

    fn start_drain(self: &Arc<Self>, state: &mut SchedulerState) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("Playback: no tokio runtime, cannot drain queue");
            return;
        };
        let token = CancellationToken::new();
        state.playing = true;
        state.drain = Some(token.clone());
        let epoch = state.epoch;
        let inner = Arc::clone(self);
        runtime.spawn(async move { inner.drain(epoch, token).await });
        self.publish_speaking(state);
    }

    async fn drain(self: Arc<Self>, epoch: u64, cancel: CancellationToken) {
        loop {
            let next = {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return;
                }
                let next = state.queue.fragments.pop_front();
                state.starting = next.is_some();
                next
            };

            match next {
                Some(bytes) => {
                    if !self.render(epoch, &cancel, &bytes).await {
                        return;
                    }
                }
                None => {
                    if !self.await_more(epoch, &cancel).await {
                        return;
                    }
                }
            }
        }
    }

    /// Decode and render one fragment to completion. Returns `false` when the
    /// loop has been cancelled.
    async fn render(&self, epoch: u64, cancel: &CancellationToken, bytes: &[u8]) -> bool {
        let mut fragment = match self.output.decode(bytes) {
            Ok(fragment) => fragment,
            Err(e) => {
                warn!("Playback: skipping undecodable fragment ({} bytes): {}", bytes.len(), e);
                self.abandon_start(epoch);
                return !cancel.is_cancelled();
            }
        };

        let (id, done) = {
            let mut state = self.lock();
            if state.epoch != epoch {
                return false;
            }
            state.starting = false;
            let done = match fragment.start() {
                Ok(done) => done,
                Err(e) => {
                    warn!("Playback: fragment failed to start: {}", e);
                    self.publish_speaking(&state);
                    return true;
                }
            };
            state.next_handle_id += 1;
            let id = state.next_handle_id;
            state.rendering = Some(PlaybackHandle { id, fragment });
            (id, done)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            _ = done => {}
        }

        let finished = {
            let mut state = self.lock();
            let finished = match state.rendering.as_ref() {
                Some(handle) if state.epoch == epoch && handle.id == id => state.rendering.take(),
                _ => None,
            };
            self.publish_speaking(&state);
            finished
        };
        drop(finished);
        !cancel.is_cancelled()
    }

    /// Poll an empty queue with the current retry budget. Returns `true` when a
    /// fragment arrived, `false` when the loop has ended.
    async fn await_more(&self, epoch: u64, cancel: &CancellationToken) -> bool {
        let mut attempts = 0u32;
        loop {
            let (interval, budget) = {
                let mut state = self.lock();
                if state.epoch != epoch {
                    return false;
                }
                if !state.queue.fragments.is_empty() {
                    return true;
                }
                let (interval, budget) = self.config.empty_poll(state.queue.stream_complete);
                // A new segment is buffering: go quiet now and let it re-buffer.
                if state.queue.buffering || attempts >= budget {
                    state.playing = false;
                    state.drain = None;
                    self.publish_speaking(&state);
                    debug!("Playback: queue drained, loop idle");
                    return false;
                }
                (interval, budget)
            };

            attempts += 1;
            debug!("Playback: queue empty, poll {}/{}", attempts, budget);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}
