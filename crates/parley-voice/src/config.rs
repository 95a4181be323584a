//! Tunables for capture and playback, loaded from `.env` or a TOML file.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLEY_SILENCE_TIMEOUT_MS | 1500 | Inactivity after the last result before an utterance is finalized. |
//! | PARLEY_MAX_RESTARTS | 3 | Transparent engine restarts allowed inside one restart window. |
//! | PARLEY_RESTART_WINDOW_MS | 5000 | Window for counting restarts; exceeding the cap is fatal. |
//! | PARLEY_PREBUFFER_FRAGMENTS | 3 | Fragments queued before playback starts. |
//! | PARLEY_PREBUFFER_TIMEOUT_MS | 400 | Max wait after the first fragment before playback starts anyway. |
//! | PARLEY_ACTIVE_POLL_MS / PARLEY_ACTIVE_POLL_RETRIES | 100 / 10 | Empty-queue poll while the stream is still open. |
//! | PARLEY_COMPLETE_POLL_MS / PARLEY_COMPLETE_POLL_RETRIES | 25 / 2 | Empty-queue poll once the stream is marked complete. |
//! | PARLEY_IDLE_WAIT_TIMEOUT_MS | 10000 | Upper bound for `wait_for_idle`. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

fn default_silence_timeout_ms() -> u64 {
    1500
}

fn default_max_restarts() -> u32 {
    3
}

fn default_restart_window_ms() -> u64 {
    5000
}

fn default_prebuffer_fragments() -> usize {
    3
}

fn default_prebuffer_timeout_ms() -> u64 {
    400
}

fn default_active_poll_ms() -> u64 {
    100
}

fn default_active_poll_retries() -> u32 {
    10
}

fn default_complete_poll_ms() -> u64 {
    25
}

fn default_complete_poll_retries() -> u32 {
    2
}

fn default_idle_wait_timeout_ms() -> u64 {
    10_000
}

fn default_idle_poll_ms() -> u64 {
    50
}

/// Utterance capture tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// No new result within this window finalizes the utterance.
    #[serde(default = "default_silence_timeout_ms")]
    pub silence_timeout_ms: u64,
    /// Transparent restarts tolerated within `restart_window_ms`.
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window_ms")]
    pub restart_window_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            silence_timeout_ms: default_silence_timeout_ms(),
            max_restarts: default_max_restarts(),
            restart_window_ms: default_restart_window_ms(),
        }
    }
}

impl CaptureConfig {
    pub fn silence_timeout(&self) -> Duration {
        Duration::from_millis(self.silence_timeout_ms)
    }

    pub fn restart_window(&self) -> Duration {
        Duration::from_millis(self.restart_window_ms)
    }
}

/// Playback scheduling tunables.
///
/// The empty-queue poll budgets are policy, not contract: a longer budget while
/// the producer may still deliver, a short one once it marked the stream complete.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Fragments that must be queued before the first one plays.
    #[serde(default = "default_prebuffer_fragments")]
    pub prebuffer_fragments: usize,
    /// Started on the first fragment of a buffering phase; playback starts when it elapses.
    #[serde(default = "default_prebuffer_timeout_ms")]
    pub prebuffer_timeout_ms: u64,
    #[serde(default = "default_active_poll_ms")]
    pub active_poll_ms: u64,
    #[serde(default = "default_active_poll_retries")]
    pub active_poll_retries: u32,
    #[serde(default = "default_complete_poll_ms")]
    pub complete_poll_ms: u64,
    #[serde(default = "default_complete_poll_retries")]
    pub complete_poll_retries: u32,
    #[serde(default = "default_idle_wait_timeout_ms")]
    pub idle_wait_timeout_ms: u64,
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            prebuffer_fragments: default_prebuffer_fragments(),
            prebuffer_timeout_ms: default_prebuffer_timeout_ms(),
            active_poll_ms: default_active_poll_ms(),
            active_poll_retries: default_active_poll_retries(),
            complete_poll_ms: default_complete_poll_ms(),
            complete_poll_retries: default_complete_poll_retries(),
            idle_wait_timeout_ms: default_idle_wait_timeout_ms(),
            idle_poll_ms: default_idle_poll_ms(),
        }
    }
}

impl PlaybackConfig {
    pub fn prebuffer_timeout(&self) -> Duration {
        Duration::from_millis(self.prebuffer_timeout_ms)
    }

    /// Poll interval and retry count for an empty queue.
    pub fn empty_poll(&self, stream_complete: bool) -> (Duration, u32) {
        if stream_complete {
            (
                Duration::from_millis(self.complete_poll_ms),
                self.complete_poll_retries,
            )
        } else {
            (
                Duration::from_millis(self.active_poll_ms),
                self.active_poll_retries,
            )
        }
    }

    pub fn idle_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_wait_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }
}

/// Configuration for the whole conversation controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationConfig {
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub playback: PlaybackConfig,
}

impl ConversationConfig {
    /// Load from environment. Unset or unparsable variables fall back to defaults.
    pub fn from_env() -> Self {
        let capture = CaptureConfig {
            silence_timeout_ms: env_u64("PARLEY_SILENCE_TIMEOUT_MS", default_silence_timeout_ms()),
            max_restarts: env_u32("PARLEY_MAX_RESTARTS", default_max_restarts()),
            restart_window_ms: env_u64("PARLEY_RESTART_WINDOW_MS", default_restart_window_ms()),
        };
        let playback = PlaybackConfig {
            prebuffer_fragments: env_u64(
                "PARLEY_PREBUFFER_FRAGMENTS",
                default_prebuffer_fragments() as u64,
            ) as usize,
            prebuffer_timeout_ms: env_u64(
                "PARLEY_PREBUFFER_TIMEOUT_MS",
                default_prebuffer_timeout_ms(),
            ),
            active_poll_ms: env_u64("PARLEY_ACTIVE_POLL_MS", default_active_poll_ms()),
            active_poll_retries: env_u32("PARLEY_ACTIVE_POLL_RETRIES", default_active_poll_retries()),
            complete_poll_ms: env_u64("PARLEY_COMPLETE_POLL_MS", default_complete_poll_ms()),
            complete_poll_retries: env_u32(
                "PARLEY_COMPLETE_POLL_RETRIES",
                default_complete_poll_retries(),
            ),
            idle_wait_timeout_ms: env_u64(
                "PARLEY_IDLE_WAIT_TIMEOUT_MS",
                default_idle_wait_timeout_ms(),
            ),
            idle_poll_ms: default_idle_poll_ms(),
        };
        Self { capture, playback }
    }

    /// Parse a TOML document with optional `[capture]` and `[playback]` tables.
    pub fn from_toml_str(s: &str) -> VoiceResult<Self> {
        let config: Self = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> VoiceResult<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&raw)
    }

    /// Reject values that would make the timers or the pre-buffer degenerate.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.capture.silence_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "silence_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.playback.prebuffer_fragments == 0 {
            return Err(VoiceError::Config(
                "prebuffer_fragments must be at least 1".to_string(),
            ));
        }
        if self.playback.idle_poll_ms == 0 || self.playback.idle_wait_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "idle wait timeout and poll interval must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

fn env_u32(name: &str, default: u32) -> u32 {
    match std::env::var(name) {
        Ok(v) => v.trim().parse().unwrap_or(default),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = ConversationConfig::default();
        assert_eq!(c.capture.silence_timeout(), Duration::from_millis(1500));
        assert_eq!(c.playback.prebuffer_fragments, 3);
        assert_eq!(c.playback.prebuffer_timeout(), Duration::from_millis(400));
        assert!(c.validate().is_ok());
    }

    #[test]
    fn empty_poll_budget_shrinks_when_complete() {
        let p = PlaybackConfig::default();
        let (active_every, active_tries) = p.empty_poll(false);
        let (done_every, done_tries) = p.empty_poll(true);
        assert!(done_every < active_every);
        assert!(done_tries < active_tries);
    }

    #[test]
    fn toml_partial_tables_fill_defaults() {
        let c = ConversationConfig::from_toml_str(
            r#"
            [capture]
            silence_timeout_ms = 900

            [playback]
            prebuffer_fragments = 5
            "#,
        )
        .unwrap();
        assert_eq!(c.capture.silence_timeout_ms, 900);
        assert_eq!(c.capture.max_restarts, 3);
        assert_eq!(c.playback.prebuffer_fragments, 5);
        assert_eq!(c.playback.prebuffer_timeout_ms, 400);
    }

    #[test]
    fn toml_rejects_zero_prebuffer() {
        let err = ConversationConfig::from_toml_str("[playback]\nprebuffer_fragments = 0\n");
        assert!(matches!(err, Err(VoiceError::Config(_))));
    }

    #[test]
    fn toml_syntax_error_is_config_error() {
        let err = ConversationConfig::from_toml_str("[capture\n");
        assert!(matches!(err, Err(VoiceError::Config(_))));
    }
}
