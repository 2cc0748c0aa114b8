//! Transfer and engine configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default number of simultaneous segment connections per transfer.
pub const DEFAULT_CONNECTIONS: usize = 8;

/// Default segment size (5 MiB).
pub const DEFAULT_SEGMENT_SIZE: u64 = 5 * 1024 * 1024;

/// Default number of failed attempts before a segment is marked as errored.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Resources smaller than this are fetched as a single segment (1 MiB).
pub const MIN_SIZE_FOR_SEGMENTATION: u64 = 1024 * 1024;

/// Per-connection throughput considered healthy (10 KiB/s).
pub const MIN_HEALTHY_SPEED: f64 = 10.0 * 1024.0;

/// Upper bound for the adaptive connection limit.
pub const MAX_CONNECTIONS: usize = 16;

/// Maximum redirect hops followed by the probe and by segment workers.
pub const MAX_REDIRECTS: usize = 5;

pub const INITIAL_BACKOFF_MS: u64 = 1000;
pub const MAX_BACKOFF_MS: u64 = 10_000;

/// Many servers reject requests that do not look like they come from a browser.
pub const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Input for a single transfer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferSpec {
    pub url: String,
    pub filename: String,
    pub directory: PathBuf,
    #[serde(default = "default_connections")]
    pub connections: usize,
    #[serde(default = "default_segment_size")]
    pub segment_size: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_dynamic")]
    pub dynamic_connections: bool,
}

fn default_connections() -> usize {
    DEFAULT_CONNECTIONS
}

fn default_segment_size() -> u64 {
    DEFAULT_SEGMENT_SIZE
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_dynamic() -> bool {
    true
}

impl TransferSpec {
    pub fn new(url: impl Into<String>, filename: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            filename: filename.into(),
            directory: directory.into(),
            connections: DEFAULT_CONNECTIONS,
            segment_size: DEFAULT_SEGMENT_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            dynamic_connections: true,
        }
    }

    pub fn with_connections(mut self, connections: usize) -> Self {
        self.connections = connections.max(1);
        self
    }

    pub fn with_segment_size(mut self, segment_size: u64) -> Self {
        self.segment_size = segment_size.max(1);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_dynamic_connections(mut self, enabled: bool) -> Self {
        self.dynamic_connections = enabled;
        self
    }

    /// `<directory>/.temp/<transfer_id>`
    pub fn temp_directory(&self, transfer_id: &str) -> PathBuf {
        self.directory.join(".temp").join(transfer_id)
    }

    pub fn destination(&self) -> PathBuf {
        self.directory.join(&self.filename)
    }
}

/// Engine-wide tunables shared by every task a coordinator runs.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub segmentation_threshold: u64,
    pub probe_timeout: Duration,
    /// Applies to connecting and to each body read; a stalled transfer counts as a failed attempt.
    pub request_timeout: Duration,
    pub max_redirects: usize,
    pub progress_interval: Duration,
    pub health_check_interval: Duration,
    pub healthy_speed: f64,
    pub max_connections: usize,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub user_agent: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            segmentation_threshold: MIN_SIZE_FOR_SEGMENTATION,
            probe_timeout: Duration::from_secs(15),
            request_timeout: Duration::from_secs(30),
            max_redirects: MAX_REDIRECTS,
            progress_interval: Duration::from_secs(1),
            health_check_interval: Duration::from_secs(5),
            healthy_speed: MIN_HEALTHY_SPEED,
            max_connections: MAX_CONNECTIONS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            user_agent: USER_AGENT.to_string(),
        }
    }
}

impl EngineConfig {
    /// Delay before the next attempt after `failures` failed attempts:
    /// `min(initial * 2^failures, max)`.
    pub fn backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.checked_pow(failures).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}
