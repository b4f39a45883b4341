//! Queue tuning knobs.

use std::time::Duration;

use ferry_protocol::constants::MAX_BINARY_PAYLOAD;
use serde::{Deserialize, Serialize};

/// Upload queue configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum transfers running at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Files of at least this many bytes use a chunked session.
    #[serde(default = "default_chunked_threshold")]
    pub chunked_threshold: u64,

    /// Chunk size requested from the server (it may clamp it).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Automatic retries per run before a transfer fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base retry delay; attempt `n` waits `n * retry_backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Minimum spacing between rate samples.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
}

fn default_concurrency() -> usize {
    3
}

fn default_chunked_threshold() -> u64 {
    50 * 1024 * 1024
}

fn default_chunk_size() -> u64 {
    ferry_transfer::DEFAULT_CHUNK_SIZE
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_progress_interval_ms() -> u64 {
    250
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            chunked_threshold: default_chunked_threshold(),
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            progress_interval_ms: default_progress_interval_ms(),
        }
    }
}

impl QueueConfig {
    /// Pulls `chunk_size` and `chunked_threshold` down to what one binary
    /// frame can carry, so no request outgrows the server's message limit.
    pub fn clamped(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(1, MAX_BINARY_PAYLOAD);
        self.chunked_threshold = self.chunked_threshold.min(MAX_BINARY_PAYLOAD);
        self
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}
