//! Configuration system for Ferry.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FERRY_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/ferry/config.toml
//!   3. ~/.config/ferry/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub transfer: TransferConfig,
    pub channels: ChannelConfig,
    pub pacing: PacingConfig,
    pub timing: TimingConfig,
    pub retry: RetryConfig,
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Nominal chunk size before any RTT adaptation.
    pub chunk_size: u32,
    /// Floor for adaptive chunk sizing.
    pub chunk_size_min: u32,
    /// Ceiling for adaptive chunk sizing.
    pub chunk_size_max: u32,
    /// Files larger than this skip end-to-end digest verification.
    /// 0 = always verify.
    pub verify_cap_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Parallel data channels to request from the transport (engine accepts 1–6).
    pub parallel_channels: usize,
    /// Per-channel buffered-bytes ceiling; a channel at or above it is
    /// skipped, and when all are, the sender suspends.
    pub max_buffer: usize,
    /// Buffered-bytes threshold under which a channel signals buffered-low.
    pub buffer_low: usize,
    /// Largest message the transport will carry; chunks are capped to this
    /// minus framing overhead.
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    /// Token bucket capacity in bytes.
    pub bucket_capacity: u64,
    /// Fill rate before any RTT samples exist, bytes/sec.
    pub bootstrap_rate: u64,
    /// Fill rate ceiling the stability heuristic scales, bytes/sec.
    pub peak_rate: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Base retransmission interval, milliseconds. Doubles per retry up to
    /// the backoff cap.
    pub retransmit_base_ms: u64,
    /// Pending-ACK flush interval, milliseconds.
    pub sack_flush_ms: u64,
    /// Control-channel keepalive interval, seconds.
    pub keepalive_secs: u64,
    /// Session inactivity timeout, seconds.
    pub session_timeout_secs: u64,
    /// Upper bound on a backpressure suspension before re-probing, ms.
    pub backpressure_fallback_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Initial window size before RTT measurements steer it.
    pub initial_window: usize,
    /// Pending ACKs that force an immediate SACK flush.
    pub sack_batch_size: usize,
    /// Retries after which a warning is surfaced for a chunk.
    pub soft_retry_limit: u32,
    /// Retries after which the transfer fails as peer-unresponsive.
    pub hard_retry_limit: u32,
    /// Consecutive decrypt failures across distinct seqs that imply a key
    /// mismatch.
    pub decrypt_failure_limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory for receiver-side chunk persistence.
    pub root: PathBuf,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            transfer: TransferConfig::default(),
            channels: ChannelConfig::default(),
            pacing: PacingConfig::default(),
            timing: TimingConfig::default(),
            retry: RetryConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: 256 * 1024,
            chunk_size_min: 128 * 1024,
            chunk_size_max: 1024 * 1024,
            verify_cap_bytes: 250 * 1024 * 1024,
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            parallel_channels: 2,
            max_buffer: 4 * 1024 * 1024,
            buffer_low: 2 * 1024 * 1024,
            max_message_size: 262_144,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            bucket_capacity: 50 * 1024 * 1024,
            bootstrap_rate: 10 * 1024 * 1024,
            peak_rate: 20 * 1024 * 1024,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            retransmit_base_ms: 1000,
            sack_flush_ms: 100,
            keepalive_secs: 5,
            session_timeout_secs: 600,
            backpressure_fallback_ms: 500,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_window: 16,
            sack_batch_size: 50,
            soft_retry_limit: 5,
            hard_retry_limit: 50,
            decrypt_failure_limit: 8,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: data_dir().join("chunks"),
        }
    }
}

// ── Duration accessors ────────────────────────────────────────────────────────

impl TimingConfig {
    pub fn retransmit_base(&self) -> Duration {
        Duration::from_millis(self.retransmit_base_ms)
    }

    pub fn sack_flush(&self) -> Duration {
        Duration::from_millis(self.sack_flush_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive_secs)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn backpressure_fallback(&self) -> Duration {
        Duration::from_millis(self.backpressure_fallback_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("ferry")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".local").join("share"))
        .join("ferry")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl EngineConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            EngineConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FERRY_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&EngineConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FERRY_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_u32("FERRY_TRANSFER__CHUNK_SIZE") {
            self.transfer.chunk_size = v;
        }
        if let Some(v) = env_u32("FERRY_TRANSFER__CHUNK_SIZE_MIN") {
            self.transfer.chunk_size_min = v;
        }
        if let Some(v) = env_u32("FERRY_TRANSFER__CHUNK_SIZE_MAX") {
            self.transfer.chunk_size_max = v;
        }
        if let Some(v) = env_u64("FERRY_TRANSFER__VERIFY_CAP_BYTES") {
            self.transfer.verify_cap_bytes = v;
        }
        if let Some(v) = env_u64("FERRY_CHANNELS__PARALLEL") {
            self.channels.parallel_channels = v as usize;
        }
        if let Some(v) = env_u64("FERRY_CHANNELS__MAX_BUFFER") {
            self.channels.max_buffer = v as usize;
        }
        if let Some(v) = env_u64("FERRY_CHANNELS__BUFFER_LOW") {
            self.channels.buffer_low = v as usize;
        }
        if let Some(v) = env_u64("FERRY_TIMING__RETRANSMIT_BASE_MS") {
            self.timing.retransmit_base_ms = v;
        }
        if let Some(v) = env_u64("FERRY_TIMING__SESSION_TIMEOUT_SECS") {
            self.timing.session_timeout_secs = v;
        }
        if let Ok(v) = std::env::var("FERRY_STORE__ROOT") {
            self.store.root = PathBuf::from(v);
        }
    }
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}
