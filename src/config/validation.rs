use super::models::{Config, EngineConfig, TelemetryConfig, TransferConfig};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

/// Longest timer ceiling accepted, in milliseconds
pub const MAX_TIMER_CEILING_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("engine.max_timer_delay_ms must be between 1 and {limit}, got {actual}")]
    InvalidTimerCeiling { actual: u64, limit: u64 },

    #[error("Timeout must be positive: {field} = 0")]
    ZeroTimeout { field: String },

    #[error("connect_timeout_ms ({connect}) exceeds request_timeout_ms ({request})")]
    ConnectExceedsRequest { connect: u64, request: u64 },

    #[error("transfer.user_agent must not be empty")]
    EmptyUserAgent,

    #[error("transfer.max_body_bytes must be positive")]
    ZeroBodyLimit,

    #[error("Invalid telemetry.log_filter '{filter}': {reason}")]
    InvalidLogFilter { filter: String, reason: String },
}

/// Validate the entire configuration
pub fn validate(config: &Config) -> Result<(), ValidationError> {
    validate_engine(&config.engine)?;
    validate_transfer(&config.transfer)?;
    validate_telemetry(&config.telemetry)?;
    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ValidationError> {
    if engine.max_timer_delay_ms == 0 || engine.max_timer_delay_ms > MAX_TIMER_CEILING_MS {
        return Err(ValidationError::InvalidTimerCeiling {
            actual: engine.max_timer_delay_ms,
            limit: MAX_TIMER_CEILING_MS,
        });
    }
    Ok(())
}

fn validate_transfer(transfer: &TransferConfig) -> Result<(), ValidationError> {
    for (field, value) in [
        ("connect_timeout_ms", transfer.connect_timeout_ms),
        ("request_timeout_ms", transfer.request_timeout_ms),
    ] {
        if value == 0 {
            return Err(ValidationError::ZeroTimeout {
                field: field.to_string(),
            });
        }
    }

    if transfer.connect_timeout_ms > transfer.request_timeout_ms {
        return Err(ValidationError::ConnectExceedsRequest {
            connect: transfer.connect_timeout_ms,
            request: transfer.request_timeout_ms,
        });
    }

    if transfer.user_agent.trim().is_empty() {
        return Err(ValidationError::EmptyUserAgent);
    }

    if transfer.max_body_bytes.as_u64() == 0 {
        return Err(ValidationError::ZeroBodyLimit);
    }

    Ok(())
}

fn validate_telemetry(telemetry: &TelemetryConfig) -> Result<(), ValidationError> {
    EnvFilter::try_new(&telemetry.log_filter).map_err(|e| ValidationError::InvalidLogFilter {
        filter: telemetry.log_filter.clone(),
        reason: e.to_string(),
    })?;
    Ok(())
}
