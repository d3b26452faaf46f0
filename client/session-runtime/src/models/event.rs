use serde::{Deserialize, Serialize};

use super::answer::{QuestionId, SyncStatus};
use super::batch::{BatchProgress, BatchReport};
use super::integrity::{ViolationRecord, WarningLevel};
use super::session::{CompletionTrigger, TerminalStatus};
use super::timer::{BreakTick, TimeExpired, TimerTick};

/// Everything the runtime tells the presentation layer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SessionEvent {
    TimerTick(TimerTick),
    TimeExpired(TimeExpired),
    BreakTick(BreakTick),
    BreakStarted {
        cap_seconds: u64,
    },
    BreakEnded {
        elapsed_seconds: u64,
        remaining_break_budget: u64,
    },
    SyncStatusChanged {
        question_id: QuestionId,
        status: SyncStatus,
    },
    Violation {
        record: ViolationRecord,
        level: WarningLevel,
    },
    WarningLevelChanged {
        level: WarningLevel,
    },
    BatchProgress(BatchProgress),
    BatchFinished(BatchReport),
    SessionTerminated {
        status: TerminalStatus,
        trigger: Option<CompletionTrigger>,
        reason: Option<String>,
    },
    Fatal {
        message: String,
    },
}

impl SessionEvent {
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            SessionEvent::TimerTick(_) => "timer-tick",
            SessionEvent::TimeExpired(_) => "time-expired",
            SessionEvent::BreakTick(_) => "break-tick",
            SessionEvent::BreakStarted { .. } => "break-started",
            SessionEvent::BreakEnded { .. } => "break-ended",
            SessionEvent::SyncStatusChanged { .. } => "sync-status-changed",
            SessionEvent::Violation { .. } => "violation",
            SessionEvent::WarningLevelChanged { .. } => "warning-level-changed",
            SessionEvent::BatchProgress(_) => "batch-progress",
            SessionEvent::BatchFinished(_) => "batch-finished",
            SessionEvent::SessionTerminated { .. } => "session-terminated",
            SessionEvent::Fatal { .. } => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_tag_matches_event_name() {
        let event = SessionEvent::SyncStatusChanged {
            question_id: 4,
            status: SyncStatus::Retrying,
        };
        let value: serde_json::Value = serde_json::from_str(&event.to_json()).unwrap();
        assert_eq!(value["type"], event.event_name());
        assert_eq!(value["status"], "retrying");
    }
}
