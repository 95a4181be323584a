//! Conversation Demo: microphone → utterances → echo reply → TTS → speakers.
//!
//! Press Enter to toggle listening. Speaking while a reply plays is a barge-in:
//! toggling on silences playback first.
//!
//! - **STT**: WhisperStt (if `whisper` feature and `WHISPER_MODEL_PATH`), else HttpStt (if
//!   `STT_API_KEY`/`OPENAI_API_KEY`), else PlaceholderStt.
//! - **TTS**: HttpTts if `TTS_API_KEY`/`OPENAI_API_KEY` is set, else PlaceholderTts (silent).
//! - **Timing**: `PARLEY_CONFIG=path.toml`, or `PARLEY_*` environment variables.

use anyhow::Context;
use parley_voice::{
    create_best_stt, run_conversation_loop, ConversationConfig,
    ConversationController, HttpTts, PlaceholderTts, RodioOutput, SttBackend, TtsBackend,
    Utterance, VadConfig, VoiceEar,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = match std::env::var("PARLEY_CONFIG") {
        Ok(path) => ConversationConfig::load(&path).with_context(|| format!("loading {}", path))?,
        Err(_) => ConversationConfig::from_env(),
    };

    match VoiceEar::input_devices() {
        Ok(devices) => info!("🎙️ Input devices: {:?}", devices),
        Err(e) => info!("Could not list input devices: {}", e),
    }

    let stt: Arc<dyn SttBackend> = Arc::from(create_best_stt());
    let ear = Arc::new(VoiceEar::new(VadConfig::default(), stt));
    let output = Arc::new(RodioOutput::new().context("opening audio output")?);

    let tts: Arc<dyn TtsBackend> = match HttpTts::from_env() {
        Ok(t) => {
            info!("Using HttpTts (voice: {})", t.voice);
            Arc::new(t)
        }
        Err(_) => {
            info!("Using PlaceholderTts (set TTS_API_KEY to hear replies)");
            Arc::new(PlaceholderTts)
        }
    };

    let mut controller = ConversationController::new(config, ear, output)?;
    let utterances = controller
        .take_utterance_receiver()
        .context("utterance receiver already taken")?;

    let mut listening = WatchStream::new(controller.observe().listening);
    tokio::spawn(async move {
        while let Some(on) = listening.next().await {
            if on {
                info!("🎤 Listening... (Enter to stop)");
            } else {
                info!("🔇 Not listening (Enter to talk)");
            }
        }
    });

    let responder = |utterance: Utterance| async move {
        let reply = format!("You said: {}.", utterance.text.trim());
        info!("Reply: {}", reply);
        reply
    };

    let toggles = async {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(_)) = lines.next_line().await {
            controller.toggle_capture();
        }
    };

    tokio::select! {
        result = run_conversation_loop(&controller, utterances, tts, responder) => result?,
        _ = toggles => info!("stdin closed"),
        _ = tokio::signal::ctrl_c() => info!("Ctrl+C"),
    }

    controller.stop();
    info!("👋 Goodbye!");
    Ok(())
}
