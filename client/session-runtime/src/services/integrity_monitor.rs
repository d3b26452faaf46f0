//! Turns raw environment signals into violation records and drives the
//! warning/disqualification state machine.
//!
//! `record` is synchronous: classification, counting and the state machine
//! all happen inside one short critical section, so signals are applied in
//! the order they arrive. Remote reporting is handed to the
//! [`AuditReporter`] queue and never affects local state.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;

use crate::config::IntegritySettings;
use crate::metrics::{INTEGRITY_TRANSITIONS_TOTAL, VIOLATIONS_TOTAL};
use crate::models::event::SessionEvent;
use crate::models::integrity::{
    IntegrityState, PasteTarget, RawSignal, Signal, SignalOutcome, ViolationKind,
    ViolationRecord, WarningLevel,
};

use super::audit_reporter::AuditReporter;
use super::ActiveFlag;

/// Window geometry as read from the host environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportDimensions {
    pub outer_width: u32,
    pub inner_width: u32,
    pub outer_height: u32,
    pub inner_height: u32,
}

impl From<ViewportDimensions> for RawSignal {
    fn from(d: ViewportDimensions) -> Self {
        RawSignal::ViewportSample {
            outer_width: d.outer_width,
            inner_width: d.inner_width,
            outer_height: d.outer_height,
            inner_height: d.inner_height,
        }
    }
}

/// Source of periodic viewport samples.
pub trait ViewportProbe: Send + Sync {
    /// `None` when the host cannot report geometry right now.
    fn sample(&self) -> Option<ViewportDimensions>;
}

#[derive(Default)]
struct MonitorState {
    integrity: IntegrityState,
    records: Vec<ViolationRecord>,
    last_viewport_flag: Option<DateTime<Utc>>,
}

struct MonitorInner {
    settings: IntegritySettings,
    active: ActiveFlag,
    state: Mutex<MonitorState>,
    audit: Option<AuditReporter>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct IntegrityMonitor {
    inner: Arc<MonitorInner>,
}

impl IntegrityMonitor {
    pub fn new(
        settings: IntegritySettings,
        active: ActiveFlag,
        audit: Option<AuditReporter>,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(MonitorInner {
                settings,
                active,
                state: Mutex::new(MonitorState::default()),
                audit,
                events,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.inner.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn integrity(&self) -> IntegrityState {
        self.state().integrity.clone()
    }

    pub fn level(&self) -> WarningLevel {
        self.state().integrity.level()
    }

    pub fn is_disqualified(&self) -> bool {
        self.state().integrity.disqualified
    }

    /// Every violation recorded so far, oldest first.
    pub fn records(&self) -> Vec<ViolationRecord> {
        self.state().records.clone()
    }

    pub fn record(&self, signal: Signal) -> SignalOutcome {
        if !self.inner.active.is_active() {
            return SignalOutcome::Ignored;
        }

        let outcome = {
            let mut state = self.state();
            if state.integrity.disqualified {
                return SignalOutcome::Ignored;
            }

            let Some((kind, detail)) = classify(&self.inner.settings, &mut state, &signal) else {
                return SignalOutcome::Ignored;
            };

            let record = ViolationRecord {
                kind,
                timestamp: signal.at,
                detail,
            };
            let before = state.integrity.level();
            apply(&self.inner.settings, &mut state.integrity, kind);
            state.records.push(record.clone());
            // Queued under the lock so audit order matches `records`
            if let Some(audit) = &self.inner.audit {
                audit.report(&record);
            }
            let level = state.integrity.level();

            SignalOutcome::Recorded {
                record,
                level,
                transition: (level != before).then_some(level),
            }
        };

        if let SignalOutcome::Recorded {
            record,
            level,
            transition,
        } = &outcome
        {
            self.publish(record, *level, *transition);
        }

        outcome
    }

    fn publish(&self, record: &ViolationRecord, level: WarningLevel, transition: Option<WarningLevel>) {
        VIOLATIONS_TOTAL.with_label_values(&[record.kind.as_str()]).inc();

        tracing::info!(
            "Integrity violation: kind={}, level={:?}, detail={:?}",
            record.kind,
            level,
            record.detail
        );

        let _ = self.inner.events.send(SessionEvent::Violation {
            record: record.clone(),
            level,
        });

        if let Some(level) = transition {
            let label = match level {
                WarningLevel::Clean => "clean",
                WarningLevel::Warned(_) => "warned",
                WarningLevel::Disqualified => "disqualified",
            };
            INTEGRITY_TRANSITIONS_TOTAL.with_label_values(&[label]).inc();

            if level == WarningLevel::Disqualified {
                tracing::warn!(
                    "Candidate disqualified: {}",
                    self.integrity().disqualification_reason.unwrap_or_default()
                );
            } else {
                tracing::warn!("Integrity warning issued: {:?}", level);
            }
            let _ = self
                .inner
                .events
                .send(SessionEvent::WarningLevelChanged { level });
        }
    }

    /// Applies a disqualification the server already holds. Returns `true`
    /// when this changed local state.
    pub fn adopt_server_disqualification(&self, reason: Option<String>) -> bool {
        let mut state = self.state();
        if state.integrity.disqualified {
            return false;
        }
        state.integrity.disqualified = true;
        state.integrity.warning_count = self.inner.settings.max_warnings;
        state.integrity.disqualification_reason =
            Some(reason.unwrap_or_else(|| "Disqualified by the assessment server".to_string()));
        true
    }
}

fn classify(
    settings: &IntegritySettings,
    state: &mut MonitorState,
    signal: &Signal,
) -> Option<(ViolationKind, Option<String>)> {
    match &signal.raw {
        RawSignal::VisibilityHidden => Some((ViolationKind::TabSwitch, None)),
        RawSignal::WindowBlur => Some((ViolationKind::FocusLoss, None)),
        RawSignal::WindowFocus => None,
        RawSignal::Copy => Some((ViolationKind::CopyAttempt, Some("copy".into()))),
        RawSignal::Cut => Some((ViolationKind::CopyAttempt, Some("cut".into()))),
        RawSignal::Paste {
            target: PasteTarget::AnswerField,
        } => Some((ViolationKind::PasteAttempt, None)),
        RawSignal::Paste {
            target: PasteTarget::Other,
        } => None,
        RawSignal::ContextMenu => Some((ViolationKind::RightClick, None)),
        RawSignal::ViewportSample {
            outer_width,
            inner_width,
            outer_height,
            inner_height,
        } => {
            let delta = outer_width
                .saturating_sub(*inner_width)
                .max(outer_height.saturating_sub(*inner_height));
            if delta <= settings.viewport_delta_px {
                return None;
            }
            let suppression = chrono::Duration::from_std(settings.viewport_suppression())
                .unwrap_or_else(|_| chrono::Duration::zero());
            if let Some(last) = state.last_viewport_flag {
                if signal.at - last < suppression {
                    return None;
                }
            }
            state.last_viewport_flag = Some(signal.at);
            Some((
                ViolationKind::DevToolsOpen,
                Some(format!("viewport delta {}px", delta)),
            ))
        }
        RawSignal::Shortcut {
            key,
            ctrl,
            shift,
            alt,
            meta,
        } => devtools_shortcut(key, *ctrl, *shift, *alt, *meta)
            .map(|combo| (ViolationKind::DevToolsOpen, Some(format!("shortcut {}", combo)))),
    }
}

/// F12, Ctrl/Cmd+Shift+I/J/C, Cmd+Alt+I/J/C and Ctrl/Cmd+U.
fn devtools_shortcut(key: &str, ctrl: bool, shift: bool, alt: bool, meta: bool) -> Option<String> {
    let key = key.to_ascii_uppercase();
    let inspector_key = matches!(key.as_str(), "I" | "J" | "C");
    let command = if meta { "Cmd" } else { "Ctrl" };

    if key == "F12" {
        Some("F12".to_string())
    } else if (ctrl || meta) && shift && inspector_key {
        Some(format!("{}+Shift+{}", command, key))
    } else if meta && alt && inspector_key {
        Some(format!("Cmd+Alt+{}", key))
    } else if (ctrl || meta) && !shift && !alt && key == "U" {
        Some(format!("{}+U", command))
    } else {
        None
    }
}

/// Counts the violation and advances through every threshold it crossed.
fn apply(settings: &IntegritySettings, integrity: &mut IntegrityState, kind: ViolationKind) {
    *integrity.per_kind_counts.entry(kind).or_insert(0) += 1;
    integrity.weighted_score += settings.weights.weight(kind);

    let max_warnings = settings.max_warnings;
    while integrity.warning_count < max_warnings {
        let next = settings.warning_thresholds[integrity.warning_count as usize];
        if integrity.weighted_score < next {
            break;
        }
        integrity.warning_count += 1;
    }

    if integrity.warning_count >= max_warnings {
        integrity.disqualified = true;
        integrity.disqualification_reason = Some(disqualification_reason(integrity));
    }
}

fn disqualification_reason(integrity: &IntegrityState) -> String {
    let breakdown = integrity
        .per_kind_counts
        .iter()
        .map(|(kind, count)| format!("{} x{}", kind, count))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "Disqualified after {} integrity violations (score {:.1}): {}",
        integrity.total_violations(),
        integrity.weighted_score,
        breakdown
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ViolationWeights;

    fn settings(thresholds: &[f64]) -> IntegritySettings {
        IntegritySettings {
            weights: ViolationWeights::uniform(1.0),
            warning_thresholds: thresholds.to_vec(),
            max_warnings: thresholds.len() as u32,
            ..IntegritySettings::default()
        }
    }

    #[test]
    fn audit_queue_follows_record_order_across_threads() {
        let (tx, _rx) = broadcast::channel(1024);
        let (queue, mut audit_rx) = tokio::sync::mpsc::unbounded_channel();
        let monitor = IntegrityMonitor::new(
            settings(&[1e6, 2e6, 3e6]),
            ActiveFlag::new(true),
            Some(AuditReporter::from_queue(queue)),
            tx,
        );

        let signals = [
            RawSignal::Copy,
            RawSignal::ContextMenu,
            RawSignal::WindowBlur,
            RawSignal::VisibilityHidden,
        ];
        std::thread::scope(|scope| {
            for raw in &signals {
                let monitor = monitor.clone();
                scope.spawn(move || {
                    for _ in 0..200 {
                        monitor.record(Signal::now(raw.clone()));
                    }
                });
            }
        });

        let recorded: Vec<ViolationKind> = monitor.records().iter().map(|r| r.kind).collect();
        let mut queued = Vec::new();
        while let Ok(event) = audit_rx.try_recv() {
            queued.push(event.event_type);
        }
        assert_eq!(recorded.len(), 800);
        assert_eq!(queued, recorded);
    }

    fn monitor(thresholds: &[f64]) -> (IntegrityMonitor, broadcast::Receiver<SessionEvent>) {
        let (tx, rx) = broadcast::channel(64);
        let monitor = IntegrityMonitor::new(settings(thresholds), ActiveFlag::new(true), None, tx);
        (monitor, rx)
    }

    #[test]
    fn focus_and_foreign_paste_are_not_violations() {
        let (monitor, _rx) = monitor(&[3.0, 6.0, 10.0]);
        assert_eq!(monitor.record(Signal::now(RawSignal::WindowFocus)), SignalOutcome::Ignored);
        assert_eq!(
            monitor.record(Signal::now(RawSignal::Paste {
                target: PasteTarget::Other
            })),
            SignalOutcome::Ignored
        );
        assert!(monitor.records().is_empty());
    }

    #[test]
    fn inactive_session_ignores_signals() {
        let (tx, _rx) = broadcast::channel(8);
        let active = ActiveFlag::new(false);
        let monitor = IntegrityMonitor::new(settings(&[1.0]), active.clone(), None, tx);

        assert_eq!(monitor.record(Signal::now(RawSignal::WindowBlur)), SignalOutcome::Ignored);
        active.set(true);
        assert!(matches!(
            monitor.record(Signal::now(RawSignal::WindowBlur)),
            SignalOutcome::Recorded { .. }
        ));
    }

    #[test]
    fn heavy_signal_crosses_two_thresholds() {
        let (tx, _rx) = broadcast::channel(8);
        let mut s = settings(&[1.0, 2.0, 10.0]);
        s.weights.dev_tools_open = 2.5;
        let monitor = IntegrityMonitor::new(s, ActiveFlag::new(true), None, tx);

        let outcome = monitor.record(Signal::now(RawSignal::Shortcut {
            key: "F12".into(),
            ctrl: false,
            shift: false,
            alt: false,
            meta: false,
        }));
        assert!(matches!(
            outcome,
            SignalOutcome::Recorded {
                transition: Some(WarningLevel::Warned(2)),
                ..
            }
        ));
    }

    #[test]
    fn disqualified_state_is_frozen() {
        let (monitor, _rx) = monitor(&[1.0]);
        let outcome = monitor.record(Signal::now(RawSignal::ContextMenu));
        assert!(outcome.disqualified_now());

        let frozen = monitor.integrity();
        assert_eq!(monitor.record(Signal::now(RawSignal::Copy)), SignalOutcome::Ignored);
        assert_eq!(monitor.integrity(), frozen);
        assert!(frozen
            .disqualification_reason
            .unwrap()
            .contains("right_click x1"));
    }

    #[test]
    fn devtools_shortcuts_are_recognised() {
        assert!(devtools_shortcut("i", true, true, false, false).is_some());
        assert!(devtools_shortcut("J", false, false, true, true).is_some());
        assert!(devtools_shortcut("u", true, false, false, false).is_some());
        assert!(devtools_shortcut("F12", false, false, false, false).is_some());
        assert!(devtools_shortcut("c", true, false, false, false).is_none());
        assert!(devtools_shortcut("I", false, true, false, false).is_none());
    }

    #[test]
    fn viewport_flags_are_suppressed_within_window() {
        let (monitor, _rx) = monitor(&[100.0]);
        let wide = |at| Signal {
            at,
            raw: RawSignal::ViewportSample {
                outer_width: 1600,
                inner_width: 1200,
                outer_height: 900,
                inner_height: 880,
            },
        };
        let t0 = Utc::now();

        assert!(matches!(monitor.record(wide(t0)), SignalOutcome::Recorded { .. }));
        assert_eq!(
            monitor.record(wide(t0 + chrono::Duration::seconds(2))),
            SignalOutcome::Ignored
        );
        assert!(matches!(
            monitor.record(wide(t0 + chrono::Duration::seconds(6))),
            SignalOutcome::Recorded { .. }
        ));
        assert_eq!(monitor.integrity().count(ViolationKind::DevToolsOpen), 2);
    }

    #[test]
    fn small_viewport_delta_is_ignored() {
        let (monitor, _rx) = monitor(&[100.0]);
        let outcome = monitor.record(Signal::now(RawSignal::ViewportSample {
            outer_width: 1280,
            inner_width: 1264,
            outer_height: 800,
            inner_height: 720,
        }));
        assert_eq!(outcome, SignalOutcome::Ignored);
    }

    #[test]
    fn server_disqualification_is_adopted_once() {
        let (monitor, _rx) = monitor(&[3.0]);
        assert!(monitor.adopt_server_disqualification(Some("proctor decision".into())));
        assert!(!monitor.adopt_server_disqualification(None));
        assert_eq!(monitor.level(), WarningLevel::Disqualified);
        assert_eq!(
            monitor.integrity().disqualification_reason.as_deref(),
            Some("proctor decision")
        );
    }
}
