//! JSON-lines command protocol between a presentation layer and the runtime.
//!
//! One [`DriverCommand`] per input line; [`apply`] runs it and returns the
//! response body. Events are streamed separately.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Result, SessionError};
use crate::models::answer::{AnswerText, QuestionId, SyncOutcome};
use crate::models::integrity::{RawSignal, Signal, SignalOutcome};
use crate::services::SessionRuntime;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DriverCommand {
    Edit {
        question_id: QuestionId,
        #[serde(default)]
        answer: String,
        #[serde(default)]
        code: String,
    },
    Signal {
        /// Defaults to the time the line was read.
        #[serde(default)]
        at: Option<DateTime<Utc>>,
        #[serde(flatten)]
        raw: RawSignal,
    },
    FocusQuestion {
        #[serde(default)]
        question_id: Option<QuestionId>,
    },
    Navigate {
        #[serde(default)]
        section: Option<String>,
        #[serde(default)]
        feedback_enabled: bool,
    },
    Checkpoint,
    BreakStart,
    BreakEnd,
    SubmitQuestion {
        question_id: QuestionId,
    },
    SubmitAnswers,
    SubmitTest,
    Refresh,
    Status,
}

impl DriverCommand {
    pub fn parse(line: &str) -> Result<Self> {
        serde_json::from_str(line)
            .map_err(|e| SessionError::Validation(format!("unrecognized command: {}", e)))
    }

    pub fn name(&self) -> &'static str {
        match self {
            DriverCommand::Edit { .. } => "edit",
            DriverCommand::Signal { .. } => "signal",
            DriverCommand::FocusQuestion { .. } => "focus_question",
            DriverCommand::Navigate { .. } => "navigate",
            DriverCommand::Checkpoint => "checkpoint",
            DriverCommand::BreakStart => "break_start",
            DriverCommand::BreakEnd => "break_end",
            DriverCommand::SubmitQuestion { .. } => "submit_question",
            DriverCommand::SubmitAnswers => "submit_answers",
            DriverCommand::SubmitTest => "submit_test",
            DriverCommand::Refresh => "refresh",
            DriverCommand::Status => "status",
        }
    }
}

fn outcome_json(question_id: QuestionId, outcome: &SyncOutcome) -> Value {
    match outcome {
        SyncOutcome::Synced => json!({ "question_id": question_id, "outcome": "synced" }),
        SyncOutcome::Skipped => json!({ "question_id": question_id, "outcome": "skipped" }),
        SyncOutcome::InFlight => json!({ "question_id": question_id, "outcome": "in_flight" }),
        SyncOutcome::Failed(e) => json!({
            "question_id": question_id,
            "outcome": "failed",
            "error": e.to_string(),
        }),
    }
}

fn outcomes_json(outcomes: &[(QuestionId, SyncOutcome)]) -> Value {
    Value::Array(
        outcomes
            .iter()
            .map(|(id, outcome)| outcome_json(*id, outcome))
            .collect(),
    )
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value).map_err(|e| SessionError::Validation(e.to_string()))
}

/// Runs one command against the runtime.
pub async fn apply(runtime: &SessionRuntime, command: DriverCommand) -> Result<Value> {
    tracing::debug!("Driver command: {}", command.name());

    match command {
        DriverCommand::Edit {
            question_id,
            answer,
            code,
        } => {
            runtime.edit(question_id, AnswerText::new(answer, code)).await?;
            let status = runtime.answers().entry(question_id).map(|e| e.sync_status);
            Ok(json!({ "question_id": question_id, "sync_status": status }))
        }
        DriverCommand::Signal { at, raw } => {
            let signal = Signal {
                at: at.unwrap_or_else(Utc::now),
                raw,
            };
            let outcome = runtime.handle_signal(signal).await;
            Ok(match outcome {
                SignalOutcome::Ignored => json!({ "recorded": false }),
                SignalOutcome::Recorded { record, level, .. } => json!({
                    "recorded": true,
                    "kind": record.kind,
                    "level": level,
                }),
            })
        }
        DriverCommand::FocusQuestion { question_id } => {
            runtime.focus_question(question_id);
            Ok(json!({ "focused": question_id }))
        }
        DriverCommand::Navigate {
            section,
            feedback_enabled,
        } => {
            let outcomes = runtime.navigate(section.clone(), feedback_enabled).await;
            Ok(json!({ "section": section, "synced": outcomes_json(&outcomes) }))
        }
        DriverCommand::Checkpoint => {
            let outcomes = runtime.checkpoint().await;
            Ok(json!({ "synced": outcomes_json(&outcomes) }))
        }
        DriverCommand::BreakStart => {
            let cap = runtime.start_break().await?;
            Ok(json!({ "cap_seconds": cap }))
        }
        DriverCommand::BreakEnd => {
            let elapsed = runtime.end_break().await?;
            Ok(json!({
                "elapsed_seconds": elapsed,
                "remaining_break_budget": runtime.timer().state().remaining_break_budget,
            }))
        }
        DriverCommand::SubmitQuestion { question_id } => {
            let result = runtime.submit_question(question_id).await?;
            to_value(&result)
        }
        DriverCommand::SubmitAnswers => {
            let report = runtime.submit_answers().await?;
            to_value(&report)
        }
        DriverCommand::SubmitTest => {
            let status = runtime.submit_test().await?;
            Ok(json!({ "status": status }))
        }
        DriverCommand::Refresh => {
            runtime.refresh().await?;
            to_value(&runtime.overview())
        }
        DriverCommand::Status => to_value(&runtime.overview()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::integrity::PasteTarget;

    #[test]
    fn parses_edit_with_missing_code() {
        let command = DriverCommand::parse(r#"{"cmd":"edit","question_id":3,"answer":"draft"}"#).unwrap();
        assert_eq!(
            command,
            DriverCommand::Edit {
                question_id: 3,
                answer: "draft".into(),
                code: String::new(),
            }
        );
    }

    #[test]
    fn parses_signal_without_timestamp() {
        let command =
            DriverCommand::parse(r#"{"cmd":"signal","signal":"paste","target":"answer_field"}"#).unwrap();
        match command {
            DriverCommand::Signal { at, raw } => {
                assert!(at.is_none());
                assert_eq!(
                    raw,
                    RawSignal::Paste {
                        target: PasteTarget::AnswerField
                    }
                );
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn parses_unit_commands() {
        assert_eq!(DriverCommand::parse(r#"{"cmd":"submit_test"}"#).unwrap(), DriverCommand::SubmitTest);
        assert_eq!(DriverCommand::parse(r#"{"cmd":"break_start"}"#).unwrap().name(), "break_start");
    }

    #[test]
    fn unknown_command_is_a_validation_error() {
        let err = DriverCommand::parse(r#"{"cmd":"teleport"}"#).unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[test]
    fn failed_outcome_carries_error_text() {
        let value = outcome_json(5, &SyncOutcome::Failed(SessionError::transient("saveDraft", "timed out")));
        assert_eq!(value["outcome"], "failed");
        assert_eq!(value["error"], "network failure calling saveDraft: timed out");
    }
}
