//! Sequencer configuration.
//!
//! Values come from [`SequencerConfig::default`], an optional JSON file and
//! `SEQUENCER_*` environment overrides, in that order.

use super::error::ConfigError;
use super::journal::{DEFAULT_SEGMENT_SIZE, LogCodec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Prefix of every environment override.
pub const ENV_PREFIX: &str = "SEQUENCER_";

/// Default gateway wait for a result.
pub const DEFAULT_GATEWAY_TIMEOUT_MS: u64 = 5_000;

/// Default number of applied commands between snapshots.
pub const DEFAULT_SNAPSHOT_INTERVAL: u64 = 10_000;

/// Retry policy of the response processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first failed attempt.
    pub max_retries: u32,
    /// Pause between attempts, in milliseconds.
    pub retry_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 4,
            retry_delay_ms: 100,
        }
    }
}

impl RetryPolicy {
    /// Total attempts per result: `max_retries + 1`.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Pause between attempts.
    #[must_use]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Configuration shared by the sequencer, gateway and response processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// Base directory of the `input/`, `correlation/`, `output/` logs and
    /// `snapshots/`.
    pub log_dir: PathBuf,
    /// Pre-allocated size of each log segment in bytes.
    pub segment_size: usize,
    /// Payload encoding of every log.
    pub codec: LogCodec,
    /// How long a gateway call waits for its result.
    pub gateway_timeout_ms: u64,
    /// Applied commands between snapshots; 0 disables snapshots.
    pub snapshot_interval: u64,
    /// Accept `Reset` and `GetState`.
    pub sandbox: bool,
    /// Compare replayed results with the logged ones and halt on mismatch.
    pub strict_replay: bool,
    /// Longest idle wait of the sequencer and processor loops, in milliseconds.
    pub idle_wait_ms: u64,
    /// Response processor retries.
    pub retry: RetryPolicy,
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("sequencer-data"),
            segment_size: DEFAULT_SEGMENT_SIZE,
            codec: LogCodec::default(),
            gateway_timeout_ms: DEFAULT_GATEWAY_TIMEOUT_MS,
            snapshot_interval: DEFAULT_SNAPSHOT_INTERVAL,
            sandbox: false,
            strict_replay: false,
            idle_wait_ms: 10,
            retry: RetryPolicy::default(),
        }
    }
}

impl SequencerConfig {
    /// Default configuration rooted at `log_dir`.
    pub fn new<P: Into<PathBuf>>(log_dir: P) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    /// Sets the segment size.
    #[must_use]
    pub fn with_segment_size(mut self, segment_size: usize) -> Self {
        self.segment_size = segment_size;
        self
    }

    /// Sets the payload codec.
    #[must_use]
    pub fn with_codec(mut self, codec: LogCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Sets the gateway timeout.
    #[must_use]
    pub fn with_gateway_timeout(mut self, timeout: Duration) -> Self {
        self.gateway_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the snapshot interval.
    #[must_use]
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval;
        self
    }

    /// Enables sandbox-only commands.
    #[must_use]
    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    /// Enables strict replay validation.
    #[must_use]
    pub fn with_strict_replay(mut self, strict: bool) -> Self {
        self.strict_replay = strict;
        self
    }

    /// Sets the processor retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Gateway timeout as a [`Duration`].
    #[must_use]
    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway_timeout_ms)
    }

    /// Idle wait as a [`Duration`].
    #[must_use]
    pub fn idle_wait(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms.max(1))
    }

    /// Directory of the input log.
    #[must_use]
    pub fn input_dir(&self) -> PathBuf {
        self.log_dir.join("input")
    }

    /// Directory of the correlation log.
    #[must_use]
    pub fn correlation_dir(&self) -> PathBuf {
        self.log_dir.join("correlation")
    }

    /// Directory of the output log.
    #[must_use]
    pub fn output_dir(&self) -> PathBuf {
        self.log_dir.join("output")
    }

    /// Directory of state snapshots.
    #[must_use]
    pub fn snapshot_dir(&self) -> PathBuf {
        self.log_dir.join("snapshots")
    }

    /// Reads a JSON configuration file; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Default configuration with `SEQUENCER_*` environment overrides.
    #[must_use]
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Applies `SEQUENCER_*` environment overrides to `self`.
    #[must_use]
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Applies overrides looked up by full variable name.
    ///
    /// Unparseable values are logged and ignored.
    #[must_use]
    pub fn with_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(dir) = get("LOG_DIR") {
            self.log_dir = PathBuf::from(dir);
        }
        override_parsed(&get, "SEGMENT_SIZE", &mut self.segment_size);
        override_parsed(&get, "GATEWAY_TIMEOUT_MS", &mut self.gateway_timeout_ms);
        override_parsed(&get, "SNAPSHOT_INTERVAL", &mut self.snapshot_interval);
        override_parsed(&get, "SANDBOX", &mut self.sandbox);
        override_parsed(&get, "STRICT_REPLAY", &mut self.strict_replay);
        override_parsed(&get, "IDLE_WAIT_MS", &mut self.idle_wait_ms);
        override_parsed(&get, "MAX_RETRIES", &mut self.retry.max_retries);
        override_parsed(&get, "RETRY_DELAY_MS", &mut self.retry.retry_delay_ms);
        if let Some(codec) = get("CODEC") {
            match serde_json::from_value::<LogCodec>(serde_json::Value::String(codec.clone())) {
                Ok(parsed) => self.codec = parsed,
                Err(_) => warn!(variable = "CODEC", value = %codec, "ignoring invalid override"),
            }
        }
        self
    }
}

fn override_parsed<T, G>(get: &G, name: &str, target: &mut T)
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(name) else {
        return;
    };
    match raw.trim().parse::<T>() {
        Ok(value) => *target = value,
        Err(_) => warn!(variable = name, value = %raw, "ignoring invalid override"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = SequencerConfig::default();
        assert_eq!(config.retry.max_retries, 4);
        assert_eq!(config.retry.max_attempts(), 5);
        assert_eq!(config.retry.retry_delay(), Duration::from_millis(100));
        assert_eq!(config.gateway_timeout(), Duration::from_secs(5));
        assert!(!config.sandbox);
    }

    #[test]
    fn test_directories_under_log_dir() {
        let config = SequencerConfig::new("/data/seq");
        assert_eq!(config.input_dir(), PathBuf::from("/data/seq/input"));
        assert_eq!(config.correlation_dir(), PathBuf::from("/data/seq/correlation"));
        assert_eq!(config.output_dir(), PathBuf::from("/data/seq/output"));
        assert_eq!(config.snapshot_dir(), PathBuf::from("/data/seq/snapshots"));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("SEQUENCER_LOG_DIR", "/tmp/x"),
            ("SEQUENCER_SANDBOX", "true"),
            ("SEQUENCER_MAX_RETRIES", "9"),
            ("SEQUENCER_GATEWAY_TIMEOUT_MS", "not-a-number"),
            ("SEQUENCER_CODEC", "json"),
        ]);
        let config = SequencerConfig::default()
            .with_overrides(|key| vars.get(key).map(|v| (*v).to_string()));
        assert_eq!(config.log_dir, PathBuf::from("/tmp/x"));
        assert!(config.sandbox);
        assert_eq!(config.retry.max_retries, 9);
        assert_eq!(config.gateway_timeout_ms, DEFAULT_GATEWAY_TIMEOUT_MS);
        assert_eq!(config.codec, LogCodec::Json);
    }

    #[test]
    fn test_json_file_with_partial_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("sequencer.json");
        std::fs::write(
            &path,
            r#"{"log_dir": "/var/seq", "snapshot_interval": 50, "retry": {"max_retries": 1}}"#,
        )
        .expect("write");
        let config = SequencerConfig::from_json_file(&path).expect("load");
        assert_eq!(config.log_dir, PathBuf::from("/var/seq"));
        assert_eq!(config.snapshot_interval, 50);
        assert_eq!(config.retry.max_retries, 1);
        assert_eq!(config.retry.retry_delay_ms, 100);
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
    }

    #[test]
    fn test_builders() {
        let config = SequencerConfig::new("d")
            .with_gateway_timeout(Duration::from_millis(250))
            .with_snapshot_interval(3)
            .with_strict_replay(true)
            .with_segment_size(4096);
        assert_eq!(config.gateway_timeout_ms, 250);
        assert_eq!(config.snapshot_interval, 3);
        assert!(config.strict_replay);
        assert_eq!(config.segment_size, 4096);
    }
}
