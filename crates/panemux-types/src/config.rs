use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::{
    DEFAULT_BACKEND_TIMEOUT_MS, DEFAULT_CLOSE_GRACE_MS, DEFAULT_FLUSH_INTERVAL_MS,
    DEFAULT_LIVENESS_POLL_MS, DEFAULT_MAX_DIMENSION, DEFAULT_SCROLLBACK_LINES,
    MAX_CONCURRENT_SESSIONS,
};

/// Engine configuration.
///
/// Loaded from a TOML file with every field optional, then overridable via
/// `PANEMUX_*` environment variables (a `.env` file is honored through
/// dotenvy). Durations are in milliseconds so tests can shrink the poll and
/// flush intervals without a separate test-only knob.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound for pane rows and cols.
    pub max_dimension: u16,
    /// Lines of raw output retained per pane for capture/replay.
    pub scrollback_lines: usize,
    /// Interval between snapshot flushes of the state store.
    pub flush_interval_ms: u64,
    /// Interval between pane liveness polls.
    pub liveness_poll_ms: u64,
    /// Deadline for a single external multiplexer invocation.
    pub backend_timeout_ms: u64,
    /// Grace period between terminate request and forced kill.
    pub close_grace_ms: u64,
    /// Bound of each subscriber's event queue.
    pub subscriber_queue_depth: usize,
    /// Bound of each pane's input (write) queue.
    pub input_queue_depth: usize,
    /// Bound of each pane's output channel, in chunks.
    pub output_queue_depth: usize,
    /// Maximum concurrently live sessions.
    pub max_sessions: usize,
    /// Directory for per-pane JSONL transcripts; `None` disables them.
    pub transcript_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_dimension: DEFAULT_MAX_DIMENSION,
            scrollback_lines: DEFAULT_SCROLLBACK_LINES,
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            liveness_poll_ms: DEFAULT_LIVENESS_POLL_MS,
            backend_timeout_ms: DEFAULT_BACKEND_TIMEOUT_MS,
            close_grace_ms: DEFAULT_CLOSE_GRACE_MS,
            subscriber_queue_depth: 256,
            input_queue_depth: 64,
            output_queue_depth: 256,
            max_sessions: MAX_CONCURRENT_SESSIONS,
            transcript_dir: None,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file, then apply env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::storage(format!("failed to read {}: {e}", path.display())))?;
        let mut config: Config = toml::from_str(&text)
            .map_err(|e| Error::storage(format!("failed to parse {}: {e}", path.display())))?;
        config.apply_env();
        Ok(config)
    }

    /// Defaults plus env overrides, for embedders without a config file.
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn apply_env(&mut self) {
        // .env is optional; ignore a missing file.
        let _ = dotenvy::dotenv();

        if let Some(v) = env_parse("PANEMUX_MAX_DIMENSION") {
            self.max_dimension = v;
        }
        if let Some(v) = env_parse("PANEMUX_SCROLLBACK_LINES") {
            self.scrollback_lines = v;
        }
        if let Some(v) = env_parse("PANEMUX_FLUSH_INTERVAL_MS") {
            self.flush_interval_ms = v;
        }
        if let Some(v) = env_parse("PANEMUX_LIVENESS_POLL_MS") {
            self.liveness_poll_ms = v;
        }
        if let Some(v) = env_parse("PANEMUX_BACKEND_TIMEOUT_MS") {
            self.backend_timeout_ms = v;
        }
        if let Some(v) = env_parse("PANEMUX_MAX_SESSIONS") {
            self.max_sessions = v;
        }
        if let Ok(dir) = std::env::var("PANEMUX_TRANSCRIPT_DIR") {
            if !dir.is_empty() {
                self.transcript_dir = Some(PathBuf::from(dir));
            }
        }
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn liveness_poll(&self) -> Duration {
        Duration::from_millis(self.liveness_poll_ms)
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_millis(self.backend_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_dimension, 1000);
        assert_eq!(config.scrollback_lines, 10_000);
        assert_eq!(config.flush_interval(), Duration::from_millis(16));
        assert_eq!(config.liveness_poll(), Duration::from_secs(5));
        assert_eq!(config.backend_timeout(), Duration::from_secs(5));
        assert_eq!(config.close_grace(), Duration::from_secs(2));
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_dimension = 500\nscrollback_lines = 2000").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.max_dimension, 500);
        assert_eq!(config.scrollback_lines, 2000);
        assert_eq!(config.max_sessions, MAX_CONCURRENT_SESSIONS);
    }

    #[test]
    fn unreadable_file_is_a_storage_error() {
        let err = Config::load(Path::new("/nonexistent/panemux.toml")).unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
    }
}
