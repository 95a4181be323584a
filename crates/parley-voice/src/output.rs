//! **Audio output capability** and its rodio implementation.
//!
//! The scheduler hands opaque encoded bytes to `AudioOutput::decode` and gets a
//! `DecodedFragment` back: something it can start, stop, and await. `RodioOutput`
//! plays each fragment through its own `rodio::Sink` on the default device.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sample, Sink, Source};
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info};

/// Turns encoded bytes (WAV/MP3/...) into something renderable.
pub trait AudioOutput: Send + Sync {
    fn decode(&self, bytes: &[u8]) -> VoiceResult<Box<dyn DecodedFragment>>;
}

/// One decoded fragment ready to render.
pub trait DecodedFragment: Send {
    /// Begin rendering. The receiver resolves once rendering has ended, whether
    /// naturally or because of `stop`.
    fn start(&mut self) -> VoiceResult<oneshot::Receiver<()>>;

    /// End rendering immediately. Safe to call repeatedly.
    fn stop(&mut self);
}

/// Plays fragments on the default output device.
///
/// The `OutputStream` is not `Send`, so it lives on a dedicated thread for as
/// long as this value exists; only the handle is shared.
pub struct RodioOutput {
    handle: OutputStreamHandle,
    _shutdown: std_mpsc::Sender<()>,
}

impl RodioOutput {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("parley-output".to_string())
            .spawn(move || match OutputStream::try_default() {
                Ok((stream, handle)) => {
                    let _ = ready_tx.send(Ok(handle));
                    // Blocks until the owning RodioOutput is dropped.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                }
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|e| VoiceError::Playback(e.to_string()))??;
        info!("🔊 RodioOutput: default output device ready");
        Ok(Self {
            handle,
            _shutdown: shutdown_tx,
        })
    }
}

impl AudioOutput for RodioOutput {
    fn decode(&self, bytes: &[u8]) -> VoiceResult<Box<dyn DecodedFragment>> {
        if bytes.is_empty() {
            return Err(VoiceError::Decode("empty fragment".to_string()));
        }
        let decoder = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| VoiceError::Decode(e.to_string()))?;
        let sink = Sink::try_new(&self.handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        Ok(Box::new(RodioFragment {
            sink,
            source: Some(decoder),
        }))
    }
}

struct RodioFragment {
    sink: Sink,
    source: Option<rodio::Decoder<Cursor<Vec<u8>>>>,
}

impl DecodedFragment for RodioFragment {
    fn start(&mut self) -> VoiceResult<oneshot::Receiver<()>> {
        let source = self
            .source
            .take()
            .ok_or_else(|| VoiceError::Playback("fragment already started".to_string()))?;
        let (done_tx, done_rx) = oneshot::channel();
        self.sink
            .append(NotifyOnEnd::new(source.convert_samples::<f32>(), done_tx));
        self.sink.play();
        Ok(done_rx)
    }

    fn stop(&mut self) {
        self.source = None;
        self.sink.stop();
        debug!("RodioOutput: fragment stopped");
    }
}

/// Source wrapper that signals when the inner source runs out or is dropped by
/// the mixer (which is what `Sink::stop` leads to).
struct NotifyOnEnd<S> {
    inner: S,
    done: Option<oneshot::Sender<()>>,
}

impl<S> NotifyOnEnd<S> {
    fn new(inner: S, done: oneshot::Sender<()>) -> Self {
        Self {
            inner,
            done: Some(done),
        }
    }

    fn notify(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl<S: Iterator> Iterator for NotifyOnEnd<S> {
    type Item = S::Item;

    fn next(&mut self) -> Option<Self::Item> {
        let sample = self.inner.next();
        if sample.is_none() {
            self.notify();
        }
        sample
    }
}

impl<S> Source for NotifyOnEnd<S>
where
    S: Source,
    S::Item: Sample,
{
    fn current_frame_len(&self) -> Option<usize> {
        self.inner.current_frame_len()
    }

    fn channels(&self) -> u16 {
        self.inner.channels()
    }

    fn sample_rate(&self) -> u32 {
        self.inner.sample_rate()
    }

    fn total_duration(&self) -> Option<Duration> {
        self.inner.total_duration()
    }
}

impl<S> Drop for NotifyOnEnd<S> {
    fn drop(&mut self) {
        self.notify();
    }
}
