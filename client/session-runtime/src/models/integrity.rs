use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    TabSwitch,
    FocusLoss,
    CopyAttempt,
    PasteAttempt,
    RightClick,
    DevToolsOpen,
}

impl ViolationKind {
    pub const ALL: [ViolationKind; 6] = [
        ViolationKind::TabSwitch,
        ViolationKind::FocusLoss,
        ViolationKind::CopyAttempt,
        ViolationKind::PasteAttempt,
        ViolationKind::RightClick,
        ViolationKind::DevToolsOpen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::TabSwitch => "tab_switch",
            ViolationKind::FocusLoss => "focus_loss",
            ViolationKind::CopyAttempt => "copy_attempt",
            ViolationKind::PasteAttempt => "paste_attempt",
            ViolationKind::RightClick => "right_click",
            ViolationKind::DevToolsOpen => "dev_tools_open",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit entry. Never mutated once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub kind: ViolationKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Where a paste landed. Only pastes into an answer field count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PasteTarget {
    AnswerField,
    Other,
}

/// Raw environment signal as reported by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum RawSignal {
    VisibilityHidden,
    WindowBlur,
    WindowFocus,
    Copy,
    Cut,
    Paste {
        target: PasteTarget,
    },
    ContextMenu,
    ViewportSample {
        outer_width: u32,
        inner_width: u32,
        outer_height: u32,
        inner_height: u32,
    },
    Shortcut {
        key: String,
        #[serde(default)]
        ctrl: bool,
        #[serde(default)]
        shift: bool,
        #[serde(default)]
        alt: bool,
        #[serde(default)]
        meta: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Signal {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub raw: RawSignal,
}

impl Signal {
    pub fn now(raw: RawSignal) -> Self {
        Self { at: Utc::now(), raw }
    }
}

/// Position in the warning state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "warnings", rename_all = "snake_case")]
pub enum WarningLevel {
    Clean,
    Warned(u32),
    Disqualified,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IntegrityState {
    pub per_kind_counts: BTreeMap<ViolationKind, u32>,
    pub weighted_score: f64,
    pub warning_count: u32,
    pub disqualified: bool,
    pub disqualification_reason: Option<String>,
}

impl IntegrityState {
    pub fn count(&self, kind: ViolationKind) -> u32 {
        self.per_kind_counts.get(&kind).copied().unwrap_or(0)
    }

    pub fn total_violations(&self) -> u32 {
        self.per_kind_counts.values().sum()
    }

    pub fn level(&self) -> WarningLevel {
        if self.disqualified {
            WarningLevel::Disqualified
        } else if self.warning_count == 0 {
            WarningLevel::Clean
        } else {
            WarningLevel::Warned(self.warning_count)
        }
    }
}

/// Result of feeding one signal to the monitor.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    /// Inactive session, already disqualified, or not a violation.
    Ignored,
    Recorded {
        record: ViolationRecord,
        level: WarningLevel,
        /// Set when this record moved the state machine.
        transition: Option<WarningLevel>,
    },
}

impl SignalOutcome {
    pub fn disqualified_now(&self) -> bool {
        matches!(
            self,
            SignalOutcome::Recorded {
                transition: Some(WarningLevel::Disqualified),
                ..
            }
        )
    }
}

/// Event body sent to the audit-log endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: ViolationKind,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl From<&ViolationRecord> for AuditEvent {
    fn from(record: &ViolationRecord) -> Self {
        Self {
            event_type: record.kind,
            timestamp: record.timestamp,
            detail: record.detail.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_parse_from_tagged_json() {
        let signal: Signal = serde_json::from_str(
            r#"{"at":"2026-01-05T10:00:00Z","signal":"paste","target":"answer_field"}"#,
        )
        .unwrap();
        assert_eq!(
            signal.raw,
            RawSignal::Paste {
                target: PasteTarget::AnswerField
            }
        );

        let shortcut: Signal = serde_json::from_str(
            r#"{"at":"2026-01-05T10:00:00Z","signal":"shortcut","key":"I","ctrl":true,"shift":true}"#,
        )
        .unwrap();
        assert!(matches!(shortcut.raw, RawSignal::Shortcut { ctrl: true, shift: true, alt: false, .. }));
    }

    #[test]
    fn level_follows_warning_count() {
        let mut state = IntegrityState::default();
        assert_eq!(state.level(), WarningLevel::Clean);
        state.warning_count = 2;
        assert_eq!(state.level(), WarningLevel::Warned(2));
        state.disqualified = true;
        assert_eq!(state.level(), WarningLevel::Disqualified);
    }
}
