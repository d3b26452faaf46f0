use std::sync::Arc;
use std::time::Duration;

use proctor_session::error::SessionError;
use proctor_session::models::integrity::{PasteTarget, RawSignal, Signal, SignalOutcome, ViolationKind, WarningLevel};
use proctor_session::models::session::{CompletionTrigger, TerminalStatus};
use proctor_session::models::SessionEvent;
use proctor_session::services::integrity_monitor::{ViewportDimensions, ViewportProbe};
use proctor_session::storage::MemoryStore;

mod common;

use common::{connect, drain_events, snapshot, test_config, wait_until, FakeBackend};

#[tokio::test]
async fn warnings_escalate_to_disqualification() {
    let backend = FakeBackend::new(snapshot(2, 1800));
    let runtime = connect(&backend, Arc::new(MemoryStore::new()), test_config()).await;
    let mut events = runtime.subscribe();

    let mut transitions = Vec::new();
    for _ in 0..6 {
        let outcome = runtime.handle_signal(Signal::now(RawSignal::ContextMenu)).await;
        if let SignalOutcome::Recorded {
            transition: Some(level),
            ..
        } = outcome
        {
            transitions.push(level);
        }
    }

    assert_eq!(
        transitions,
        vec![
            WarningLevel::Warned(1),
            WarningLevel::Warned(2),
            WarningLevel::Disqualified
        ]
    );
    assert_eq!(runtime.terminal_status(), Some(TerminalStatus::Disqualified));
    assert_eq!(backend.calls("completeSession"), 1);

    let integrity = runtime.monitor().integrity();
    assert_eq!(integrity.count(ViolationKind::RightClick), 6);
    assert_eq!(integrity.weighted_score, 6.0);
    assert!(integrity
        .disqualification_reason
        .as_deref()
        .unwrap_or_default()
        .contains("right_click x6"));

    // Frozen once disqualified
    let late = runtime.handle_signal(Signal::now(RawSignal::ContextMenu)).await;
    assert_eq!(late, SignalOutcome::Ignored);
    assert_eq!(runtime.monitor().records().len(), 6);

    let terminated: Vec<SessionEvent> = drain_events(&mut events)
        .into_iter()
        .filter(|e| matches!(e, SessionEvent::SessionTerminated { .. }))
        .collect();
    assert_eq!(terminated.len(), 1);
    match &terminated[0] {
        SessionEvent::SessionTerminated {
            status,
            trigger,
            reason,
        } => {
            assert_eq!(*status, TerminalStatus::Disqualified);
            assert_eq!(*trigger, Some(CompletionTrigger::Disqualification));
            assert!(reason.is_some());
        }
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn audit_events_are_delivered_in_order_and_failures_are_ignored() {
    let backend = FakeBackend::new(snapshot(1, 1800));
    backend.fail_times("logEvent", 1, SessionError::transient("logEvent", "connection refused"));
    let mut config = test_config();
    config.integrity.warning_thresholds = vec![10.0, 20.0, 30.0];
    let runtime = connect(&backend, Arc::new(MemoryStore::new()), config).await;

    runtime.handle_signal(Signal::now(RawSignal::Copy)).await;
    runtime
        .handle_signal(Signal::now(RawSignal::Paste {
            target: PasteTarget::AnswerField,
        }))
        .await;
    runtime.handle_signal(Signal::now(RawSignal::ContextMenu)).await;

    wait_until(|| backend.calls("logEvent") == 3).await;
    wait_until(|| backend.audit_events().len() == 2).await;

    let delivered: Vec<ViolationKind> = backend.audit_events().iter().map(|e| e.event_type).collect();
    assert_eq!(delivered, vec![ViolationKind::PasteAttempt, ViolationKind::RightClick]);

    // The failed delivery did not touch local state
    assert_eq!(runtime.monitor().records().len(), 3);
    assert_eq!(runtime.monitor().level(), WarningLevel::Clean);
}

#[tokio::test]
async fn benign_signals_are_not_violations() {
    let backend = FakeBackend::new(snapshot(1, 1800));
    let runtime = connect(&backend, Arc::new(MemoryStore::new()), test_config()).await;

    let focus = runtime.handle_signal(Signal::now(RawSignal::WindowFocus)).await;
    let paste = runtime
        .handle_signal(Signal::now(RawSignal::Paste {
            target: PasteTarget::Other,
        }))
        .await;
    let typing = runtime
        .handle_signal(Signal::now(RawSignal::Shortcut {
            key: "s".to_string(),
            ctrl: true,
            shift: false,
            alt: false,
            meta: false,
        }))
        .await;

    assert_eq!(focus, SignalOutcome::Ignored);
    assert_eq!(paste, SignalOutcome::Ignored);
    assert_eq!(typing, SignalOutcome::Ignored);
    assert_eq!(runtime.monitor().integrity().total_violations(), 0);
}

#[tokio::test]
async fn server_disqualification_finalizes_on_connect() {
    let mut remote = snapshot(1, 1800);
    remote.is_disqualified = true;
    remote.disqualification_reason = Some("Flagged by proctor".to_string());
    let backend = FakeBackend::new(remote);

    let runtime = connect(&backend, Arc::new(MemoryStore::new()), test_config()).await;

    assert_eq!(runtime.terminal_status(), Some(TerminalStatus::Disqualified));
    assert_eq!(backend.calls("completeSession"), 1);
    assert_eq!(
        runtime.monitor().integrity().disqualification_reason.as_deref(),
        Some("Flagged by proctor")
    );
    assert!(!runtime.is_active());
}

/// Window with a docked inspector panel.
struct DockedInspector;

impl ViewportProbe for DockedInspector {
    fn sample(&self) -> Option<ViewportDimensions> {
        Some(ViewportDimensions {
            outer_width: 1600,
            inner_width: 1100,
            outer_height: 900,
            inner_height: 820,
        })
    }
}

#[tokio::test(start_paused = true)]
async fn viewport_sampler_flags_devtools_once_per_window() {
    let backend = FakeBackend::new(snapshot(1, 1800));
    let runtime = connect(&backend, Arc::new(MemoryStore::new()), test_config()).await;

    runtime.attach_viewport_probe(Arc::new(DockedInspector));
    tokio::time::sleep(Duration::from_secs(3)).await;

    let records = runtime.monitor().records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].kind, ViolationKind::DevToolsOpen);
    wait_until(|| backend.calls("logEvent") == 1).await;
}
