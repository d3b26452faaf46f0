use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

pub type QuestionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Edited locally, no sync scheduled yet.
    Local,
    /// Debounce timer running.
    Pending,
    Syncing,
    Synced,
    Retrying,
    /// Retries exhausted or rejected. The local draft is still intact.
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionState {
    Unsubmitted,
    Submitted,
    EditedAfterSubmit,
}

/// Optimistic submit attempt for one question.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitAttempt {
    Pending,
    Committed,
    RolledBack,
}

/// Answer and code text as one unit; sync compares snapshots of this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnswerText {
    pub answer: String,
    pub code: String,
}

impl AnswerText {
    pub fn new(answer: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            code: code.into(),
        }
    }

    pub fn has_content(&self) -> bool {
        !self.answer.trim().is_empty() || !self.code.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuestionSessionEntry {
    pub id: QuestionId,
    pub category: String,
    pub order: u32,
    pub text: AnswerText,
    pub sync_status: SyncStatus,
    pub last_synced_snapshot: Option<AnswerText>,
    pub submission_state: SubmissionState,
    pub submit_attempt: Option<SubmitAttempt>,
    pub elapsed_seconds: u64,
}

impl QuestionSessionEntry {
    pub fn new(id: QuestionId, category: impl Into<String>, order: u32) -> Self {
        Self {
            id,
            category: category.into(),
            order,
            text: AnswerText::default(),
            sync_status: SyncStatus::Synced,
            last_synced_snapshot: None,
            submission_state: SubmissionState::Unsubmitted,
            submit_attempt: None,
            elapsed_seconds: 0,
        }
    }

    /// Text differs from what the server last acknowledged.
    pub fn is_dirty(&self) -> bool {
        match &self.last_synced_snapshot {
            Some(snapshot) => snapshot != &self.text,
            None => self.text.has_content(),
        }
    }

    pub fn needs_sync(&self) -> bool {
        self.is_dirty() && self.text.has_content()
    }

    pub fn is_submittable(&self) -> bool {
        self.text.has_content() && self.submission_state != SubmissionState::Submitted
    }
}

/// Durable per-question record: one per (session token, question id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub answer: String,
    pub code: String,
    pub timestamp: DateTime<Utc>,
    pub synced: bool,
}

impl DraftRecord {
    pub fn from_text(text: &AnswerText, synced: bool) -> Self {
        Self {
            answer: text.answer.clone(),
            code: text.code.clone(),
            timestamp: Utc::now(),
            synced,
        }
    }

    pub fn text(&self) -> AnswerText {
        AnswerText::new(self.answer.clone(), self.code.clone())
    }
}

/// Durable session-level UI record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionUiState {
    pub current_section: Option<String>,
    pub feedback_enabled: bool,
    pub timestamp: DateTime<Utc>,
}

// ---- Draft/Submit API wire types ----

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftPayload {
    pub question_id: QuestionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_code: Option<String>,
}

impl DraftPayload {
    pub fn new(question_id: QuestionId, text: &AnswerText) -> Self {
        Self {
            question_id,
            candidate_answer: non_empty(&text.answer),
            candidate_code: non_empty(&text.code),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DraftAck {
    pub success: bool,
    pub question_id: QuestionId,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDraftResultItem {
    pub question_id: QuestionId,
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchDraftAck {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchDraftResultItem>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnswerSubmission {
    pub question_id: QuestionId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_answer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub candidate_code: Option<String>,
    pub time_spent_seconds: u64,
}

impl AnswerSubmission {
    pub fn new(question_id: QuestionId, text: &AnswerText, time_spent_seconds: u64) -> Self {
        Self {
            question_id,
            candidate_answer: non_empty(&text.answer),
            candidate_code: non_empty(&text.code),
            time_spent_seconds,
        }
    }

    pub fn text(&self) -> AnswerText {
        AnswerText::new(
            self.candidate_answer.clone().unwrap_or_default(),
            self.candidate_code.clone().unwrap_or_default(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitResult {
    pub question_id: QuestionId,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchAnswerResultItem {
    pub question_id: QuestionId,
    pub success: bool,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub feedback: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSubmitAck {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub results: Vec<BatchAnswerResultItem>,
}

/// What a sync request for one question ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncOutcome {
    Synced,
    /// Nothing new to send, or nothing to send at all.
    Skipped,
    /// Another sync for this question is outstanding; this request was a no-op.
    InFlight,
    Failed(SessionError),
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn whitespace_only_text_has_no_content() {
        assert!(!AnswerText::new("   ", "\n").has_content());
        assert!(AnswerText::new("", "fn main() {}").has_content());
    }

    #[test]
    fn dirty_compares_against_snapshot() {
        let mut entry = QuestionSessionEntry::new(1, "coding", 0);
        assert!(!entry.is_dirty());

        entry.text = AnswerText::new("draft", "");
        assert!(entry.is_dirty());

        entry.last_synced_snapshot = Some(entry.text.clone());
        assert!(!entry.is_dirty());

        entry.text.answer.push_str(" more");
        assert!(entry.needs_sync());
    }

    #[test]
    fn draft_payload_omits_empty_fields() {
        let payload = DraftPayload::new(3, &AnswerText::new("because", ""));
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["candidate_answer"], "because");
        assert!(json.get("candidate_code").is_none());
    }
}
