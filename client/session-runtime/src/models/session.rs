use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::answer::QuestionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    InProgress,
    OnBreak,
    Completed,
    Expired,
    Disqualified,
}

impl SessionStatus {
    pub fn terminal(&self) -> Option<TerminalStatus> {
        match self {
            SessionStatus::Completed => Some(TerminalStatus::Completed),
            SessionStatus::Expired => Some(TerminalStatus::Expired),
            SessionStatus::Disqualified => Some(TerminalStatus::Disqualified),
            _ => None,
        }
    }
}

/// Sticky end state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Completed,
    Expired,
    Disqualified,
}

impl From<TerminalStatus> for SessionStatus {
    fn from(status: TerminalStatus) -> Self {
        match status {
            TerminalStatus::Completed => SessionStatus::Completed,
            TerminalStatus::Expired => SessionStatus::Expired,
            TerminalStatus::Disqualified => SessionStatus::Disqualified,
        }
    }
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TerminalStatus::Completed => "completed",
            TerminalStatus::Expired => "expired",
            TerminalStatus::Disqualified => "disqualified",
        };
        f.write_str(label)
    }
}

/// Who asked for the session to be finalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionTrigger {
    TimerExpiry,
    ManualSubmit,
    Disqualification,
}

impl CompletionTrigger {
    pub fn terminal_status(&self) -> TerminalStatus {
        match self {
            CompletionTrigger::TimerExpiry => TerminalStatus::Expired,
            CompletionTrigger::ManualSubmit => TerminalStatus::Completed,
            CompletionTrigger::Disqualification => TerminalStatus::Disqualified,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionTrigger::TimerExpiry => "timer_expiry",
            CompletionTrigger::ManualSubmit => "manual_submit",
            CompletionTrigger::Disqualification => "disqualification",
        }
    }
}

/// Answer state the server holds for one question.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteAnswer {
    #[serde(default)]
    pub candidate_answer: Option<String>,
    #[serde(default)]
    pub candidate_code: Option<String>,
    #[serde(default)]
    pub is_submitted: bool,
    #[serde(default)]
    pub time_spent_seconds: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionPayload {
    pub id: QuestionId,
    pub category: String,
    #[serde(default)]
    pub question_order: u32,
    #[serde(default)]
    pub question_text: String,
    #[serde(default)]
    pub answer: Option<RemoteAnswer>,
}

/// Response of `getSession`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    #[serde(default)]
    pub current_section: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<u64>,
    #[serde(rename = "time_remaining_seconds", default)]
    pub remaining_seconds: Option<u64>,

    #[serde(default)]
    pub is_on_break: bool,
    #[serde(default)]
    pub current_break_start: Option<DateTime<Utc>>,
    #[serde(rename = "remaining_break_time_seconds", default)]
    pub remaining_break_seconds: u64,
    #[serde(default = "default_max_single_break_seconds")]
    pub max_single_break_seconds: u64,
    #[serde(default)]
    pub used_break_time_seconds: u64,
    #[serde(default)]
    pub break_count: u32,

    #[serde(default)]
    pub is_disqualified: bool,
    #[serde(default)]
    pub disqualification_reason: Option<String>,

    #[serde(default)]
    pub questions_by_section: BTreeMap<String, Vec<QuestionPayload>>,
}

fn default_max_single_break_seconds() -> u64 {
    1200
}

impl SessionSnapshot {
    /// Questions in section then question order.
    pub fn questions(&self) -> Vec<&QuestionPayload> {
        let mut questions: Vec<(usize, &QuestionPayload)> = Vec::new();
        for (section_index, section) in self.questions_by_section.values().enumerate() {
            for question in section {
                questions.push((section_index, question));
            }
        }
        questions.sort_by_key(|(section, q)| (*section, q.question_order, q.id));
        questions.into_iter().map(|(_, q)| q).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakStarted {
    #[serde(rename = "break_start_time")]
    pub break_start: DateTime<Utc>,
    #[serde(rename = "remaining_break_time_seconds")]
    pub remaining_break_seconds: u64,
    #[serde(default = "default_max_single_break_seconds")]
    pub max_single_break_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakEnded {
    #[serde(rename = "remaining_break_time_seconds")]
    pub remaining_break_seconds: u64,
    #[serde(default)]
    pub break_duration_seconds: u64,
}

/// Idempotent acknowledgement of `completeSession`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionAck {
    Completed,
    AlreadyCompleted,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_parses_backend_shape() {
        let body = r#"{
            "status": "in_progress",
            "current_section": "coding",
            "time_remaining_seconds": 5400,
            "is_on_break": false,
            "remaining_break_time_seconds": 3600,
            "questions_by_section": {
                "brain_teaser": [{"id": 2, "category": "brain_teaser", "question_order": 1}],
                "coding": [
                    {"id": 7, "category": "coding", "question_order": 0,
                     "answer": {"candidate_code": "print(1)", "is_submitted": true}}
                ]
            }
        }"#;

        let snapshot: SessionSnapshot = serde_json::from_str(body).unwrap();
        assert_eq!(snapshot.status, SessionStatus::InProgress);
        assert_eq!(snapshot.remaining_seconds, Some(5400));
        assert_eq!(snapshot.max_single_break_seconds, 1200);

        let ids: Vec<_> = snapshot.questions().iter().map(|q| q.id).collect();
        assert_eq!(ids, vec![2, 7]);
        assert!(snapshot.questions()[1].answer.as_ref().unwrap().is_submitted);
    }

    #[test]
    fn triggers_map_to_terminal_statuses() {
        assert_eq!(
            CompletionTrigger::TimerExpiry.terminal_status(),
            TerminalStatus::Expired
        );
        assert_eq!(
            CompletionTrigger::Disqualification.terminal_status(),
            TerminalStatus::Disqualified
        );
        assert_eq!(
            SessionStatus::Completed.terminal(),
            Some(TerminalStatus::Completed)
        );
        assert_eq!(SessionStatus::OnBreak.terminal(), None);
    }
}
