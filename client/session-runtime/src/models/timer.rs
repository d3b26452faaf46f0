use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerState {
    pub total_seconds: u64,
    /// Advisory between server fetches; the server's value decides expiry.
    pub remaining_seconds: u64,
    pub is_on_break: bool,
    pub break_start: Option<DateTime<Utc>>,
    pub remaining_break_budget: u64,
    pub max_single_break_seconds: u64,
    pub used_break_seconds: u64,
    pub break_count: u32,
}

impl TimerState {
    pub fn new(total_seconds: u64, remaining_break_budget: u64, max_single_break_seconds: u64) -> Self {
        Self {
            total_seconds,
            remaining_seconds: total_seconds,
            is_on_break: false,
            break_start: None,
            remaining_break_budget,
            max_single_break_seconds,
            used_break_seconds: 0,
            break_count: 0,
        }
    }

    /// Longest the current break may last before it is flagged as overtime.
    pub fn break_cap_seconds(&self) -> u64 {
        self.max_single_break_seconds.min(self.remaining_break_budget)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimerTick {
    pub remaining_seconds: u64,
    pub elapsed_seconds: u64,
    pub total_seconds: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakTick {
    pub elapsed_seconds: u64,
    pub cap_seconds: u64,
    pub overtime: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeExpired {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// Snapshot of an ongoing break for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakStatus {
    pub elapsed_seconds: u64,
    pub cap_seconds: u64,
    pub overtime: bool,
}
