use crate::engine::TimerMode;
use crate::humanize::ByteSize;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Transfer engine tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Ceiling applied to every timeout the lower layer requests
    #[serde(default = "default_max_timer_delay_ms")]
    pub max_timer_delay_ms: u64,
    #[serde(default)]
    pub timer_mode: TimerMode,
}

impl EngineConfig {
    pub fn timer_ceiling(&self) -> Duration {
        Duration::from_millis(self.max_timer_delay_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_timer_delay_ms: default_max_timer_delay_ms(),
            timer_mode: TimerMode::default(),
        }
    }
}

fn default_max_timer_delay_ms() -> u64 {
    1000
}

/// Per-request options applied by the fetcher
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransferConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    #[serde(default = "default_follow_redirects")]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: u32,
    /// Bodies larger than this are aborted mid-transfer
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: ByteSize,
}

impl TransferConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            follow_redirects: default_follow_redirects(),
            max_redirects: default_max_redirects(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_user_agent() -> String {
    concat!("evfetch/", env!("CARGO_PKG_VERSION")).to_string()
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_request_timeout_ms() -> u64 {
    60_000
}

fn default_follow_redirects() -> bool {
    true
}

fn default_max_redirects() -> u32 {
    10
}

fn default_max_body_bytes() -> ByteSize {
    ByteSize(64 * 1024 * 1024) // 64 MB
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// `tracing_subscriber::EnvFilter` directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: default_log_filter(),
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}
