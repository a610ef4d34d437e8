use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the reactor re-arms the shared timer after it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerMode {
    /// Fire once; the lower layer must request every further timeout
    #[default]
    OneShot,
    /// Keep firing at the armed delay until disarmed
    Repeating,
}

/// Engine-side view of the single shared deadline
#[derive(Debug, Clone)]
pub struct Timer {
    ceiling: Duration,
    mode: TimerMode,
    armed: Option<Duration>,
}

impl Timer {
    pub fn new(ceiling: Duration, mode: TimerMode) -> Self {
        Self {
            ceiling,
            mode,
            armed: None,
        }
    }

    pub fn clamp(&self, requested: Duration) -> Duration {
        requested.min(self.ceiling)
    }

    /// Arm for `requested` (clamped), replacing any previous arming.
    /// Returns the effective delay.
    pub fn arm(&mut self, requested: Duration) -> Duration {
        let delay = self.clamp(requested);
        self.armed = Some(delay);
        delay
    }

    /// Returns whether the timer was armed
    pub fn disarm(&mut self) -> bool {
        self.armed.take().is_some()
    }

    /// Record that the reactor fired the timer
    pub fn expire(&mut self) {
        if self.mode == TimerMode::OneShot {
            self.armed = None;
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Effective delay of the current arming
    pub fn delay(&self) -> Option<Duration> {
        self.armed
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    pub fn mode(&self) -> TimerMode {
        self.mode
    }
}
