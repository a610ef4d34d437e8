//! Engine counters and tracing setup

use std::sync::atomic::{AtomicU64, Ordering};

use tracing_subscriber::EnvFilter;

use crate::config::TelemetryConfig;

/// Counters maintained by one [`TransferEngine`](crate::engine::TransferEngine)
#[derive(Debug, Default)]
pub struct EngineMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    callback_faults: AtomicU64,
    advance_errors: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn transfer_submitted(&self) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "submitted", "Metric incremented");
    }

    pub fn transfer_completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "completed", "Metric incremented");
    }

    pub fn transfer_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "failed", "Metric incremented");
    }

    pub fn callback_fault(&self) {
        self.callback_faults.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "callback_faults", "Metric incremented");
    }

    pub fn advance_failed(&self) {
        self.advance_errors.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "advance_errors", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            submitted: self.submitted.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            callback_faults: self.callback_faults.load(Ordering::Relaxed),
            advance_errors: self.advance_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize)]
pub struct MetricsSnapshot {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub callback_faults: u64,
    pub advance_errors: u64,
}

/// Build the log filter: `RUST_LOG` wins over the configured directive
pub fn env_filter(config: &TelemetryConfig) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter))
}

/// Install the global fmt subscriber, logging to stderr
pub fn init_tracing(config: &TelemetryConfig) {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(config))
        .with_writer(std::io::stderr)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts() {
        let metrics = EngineMetrics::new();
        metrics.transfer_submitted();
        metrics.transfer_submitted();
        metrics.transfer_completed();
        metrics.transfer_failed();
        metrics.callback_fault();
        metrics.advance_failed();

        assert_eq!(
            metrics.snapshot(),
            MetricsSnapshot {
                submitted: 2,
                completed: 1,
                failed: 1,
                callback_faults: 1,
                advance_errors: 1,
            }
        );
    }

    #[test]
    fn test_init_tracing_twice_is_harmless() {
        let config = TelemetryConfig::default();
        init_tracing(&config);
        init_tracing(&config);
    }
}
