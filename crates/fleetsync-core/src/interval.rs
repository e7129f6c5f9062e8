use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Wire value selecting automatic (controller-driven) polling.
pub const AUTOMATIC_INTERVAL: i64 = -1;
/// Wire value disabling autonomous polling.
pub const OFF_INTERVAL: i64 = 0;
pub const DEFAULT_ALLOWED_INTERVALS: [u64; 4] = [5, 10, 15, 60];

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "seconds", rename_all = "snake_case")]
pub enum PollMode {
    Manual(u64),
    Automatic,
    Off,
}

impl Default for PollMode {
    fn default() -> Self {
        Self::Off
    }
}

impl PollMode {
    /// Maps the client's `set-interval` value onto a mode, rejecting manual
    /// intervals outside the allow-list.
    pub fn from_wire(value: i64, allowed: &[u64]) -> Result<Self, IntervalError> {
        match value {
            AUTOMATIC_INTERVAL => Ok(PollMode::Automatic),
            OFF_INTERVAL => Ok(PollMode::Off),
            seconds if seconds > 0 && allowed.contains(&(seconds as u64)) => {
                Ok(PollMode::Manual(seconds as u64))
            }
            requested => Err(IntervalError::NotAllowed {
                requested,
                allowed: allowed.to_vec(),
            }),
        }
    }

    pub fn normalized(self) -> Self {
        match self {
            PollMode::Manual(0) => PollMode::Off,
            other => other,
        }
    }

    pub fn as_wire(&self) -> i64 {
        match self.normalized() {
            PollMode::Manual(seconds) => seconds as i64,
            PollMode::Automatic => AUTOMATIC_INTERVAL,
            PollMode::Off => OFF_INTERVAL,
        }
    }

    /// Delay until the next autonomous execution, if the mode has one.
    pub fn period_seconds(&self, automatic_interval: u64) -> Option<u64> {
        match self.normalized() {
            PollMode::Manual(seconds) => Some(seconds),
            PollMode::Automatic => Some(automatic_interval),
            PollMode::Off => None,
        }
    }

    pub fn is_automatic(&self) -> bool {
        matches!(self, PollMode::Automatic)
    }
}

impl fmt::Display for PollMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.normalized() {
            PollMode::Manual(seconds) => write!(f, "manual({seconds}s)"),
            PollMode::Automatic => f.write_str("automatic"),
            PollMode::Off => f.write_str("off"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntervalError {
    #[error("interval {requested} is not allowed; choose one of {allowed:?}, -1 (automatic) or 0 (off)")]
    NotAllowed { requested: i64, allowed: Vec<u64> },
}

impl IntervalError {
    pub fn allowed(&self) -> &[u64] {
        match self {
            IntervalError::NotAllowed { allowed, .. } => allowed,
        }
    }
}

/// Per-identity status attached to every outbound push.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub mode: PollMode,
    /// Effective delay between autonomous executions; 0 when off.
    pub interval_seconds: u64,
    pub executing: bool,
    pub channel_count: usize,
    pub automatic_interval_seconds: u64,
    pub progressive_loading: bool,
}
