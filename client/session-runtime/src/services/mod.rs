use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::{Result, SessionError};
use crate::models::answer::{AnswerText, QuestionId, QuestionSessionEntry, SubmitResult, SyncOutcome};
use crate::models::batch::BatchReport;
use crate::models::event::SessionEvent;
use crate::models::integrity::{IntegrityState, RawSignal, Signal, SignalOutcome};
use crate::models::session::{CompletionTrigger, SessionSnapshot, SessionStatus, TerminalStatus};
use crate::models::timer::{BreakStatus, TimerState};
use crate::storage::{DraftRepository, LocalStore};
use crate::utils::time::with_timeout;

pub mod answer_store;
pub mod audit_reporter;
pub mod batch_submitter;
pub mod completion;
pub mod flush_registry;
pub mod http_client;
pub mod integrity_monitor;
pub mod remote;
pub mod session_timer;

use self::answer_store::AnswerStore;
use self::audit_reporter::AuditReporter;
use self::batch_submitter::BatchSubmitter;
use self::completion::{CompletionController, CompletionDeps};
use self::flush_registry::FlushRegistry;
use self::integrity_monitor::{IntegrityMonitor, ViewportProbe};
use self::remote::RemoteApis;
use self::session_timer::SessionTimer;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Whether monitoring and the countdown are live. Shared by every component.
#[derive(Debug, Clone, Default)]
pub struct ActiveFlag(Arc<AtomicBool>);

impl ActiveFlag {
    pub fn new(active: bool) -> Self {
        Self(Arc::new(AtomicBool::new(active)))
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn set(&self, active: bool) {
        self.0.store(active, Ordering::SeqCst);
    }
}

/// Point-in-time view of the whole session, for display.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOverview {
    pub status: SessionStatus,
    pub active: bool,
    pub timer: TimerState,
    pub break_status: Option<BreakStatus>,
    pub integrity: IntegrityState,
    pub questions: Vec<QuestionSessionEntry>,
}

/// Owns the five session components and wires them together.
pub struct SessionRuntime {
    token: String,
    config: Config,
    apis: RemoteApis,
    events: broadcast::Sender<SessionEvent>,
    active: ActiveFlag,
    status: Mutex<SessionStatus>,
    current_section: Mutex<Option<String>>,
    monitor: IntegrityMonitor,
    store: AnswerStore,
    timer: SessionTimer,
    batch: BatchSubmitter,
    completion: CompletionController,
    registry: Arc<FlushRegistry>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SessionRuntime {
    /// Fetches the session, restores local drafts and adopts whatever state
    /// the server reports (break, disqualification, terminal status).
    pub async fn connect(
        config: Config,
        token: impl Into<String>,
        apis: RemoteApis,
        local: Arc<dyn LocalStore>,
    ) -> Result<Arc<Self>> {
        let token = token.into();
        let request_timeout = config.api.request_timeout();

        let snapshot = with_timeout(
            "getSession",
            request_timeout,
            apis.session.get_session(&token),
        )
        .await?;

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let active = ActiveFlag::new(false);

        let (audit, audit_task) =
            AuditReporter::spawn(apis.audit.clone(), token.clone(), request_timeout);
        let monitor = IntegrityMonitor::new(
            config.integrity.clone(),
            active.clone(),
            Some(audit),
            events.clone(),
        );

        let repo = DraftRepository::new(local, token.clone(), config.storage.freshness_window());
        let store = AnswerStore::new(
            apis.drafts.clone(),
            repo,
            config.sync.clone(),
            request_timeout,
            events.clone(),
        );

        let timer = SessionTimer::new(
            token.clone(),
            apis.session.clone(),
            config.timer.clone(),
            request_timeout,
            active.clone(),
            events.clone(),
        );

        let registry = Arc::new(FlushRegistry::new());
        let completion = CompletionController::new(CompletionDeps {
            token: token.clone(),
            api: apis.session.clone(),
            settings: config.completion.clone(),
            request_timeout,
            store: store.clone(),
            registry: registry.clone(),
            timer: timer.clone(),
            monitor: monitor.clone(),
            active: active.clone(),
            events: events.clone(),
        });

        let batch = BatchSubmitter::new(
            token.clone(),
            apis.drafts.clone(),
            store.clone(),
            config.batch.chunk_size,
            request_timeout,
            events.clone(),
        );

        store.load(&snapshot).await?;
        store.register_flush_handles(&registry);
        let current_section = match store.restore_ui_state().await {
            Some(ui) => ui.current_section.or_else(|| snapshot.current_section.clone()),
            None => snapshot.current_section.clone(),
        };

        let runtime = Arc::new(Self {
            token,
            config,
            apis,
            events,
            active,
            status: Mutex::new(snapshot.status),
            current_section: Mutex::new(current_section),
            monitor,
            store,
            timer,
            batch,
            completion,
            registry,
            background: Mutex::new(vec![audit_task]),
        });

        runtime.reconcile(&snapshot).await;

        tracing::info!(
            "Session runtime connected: token={}, status={:?}, questions={}",
            runtime.token,
            runtime.status(),
            runtime.registry.len()
        );
        Ok(runtime)
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn is_active(&self) -> bool {
        self.active.is_active()
    }

    pub fn status(&self) -> SessionStatus {
        match self.completion.terminal_status() {
            Some(terminal) => terminal.into(),
            None => *Self::lock(&self.status),
        }
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        self.completion.terminal_status()
    }

    pub fn monitor(&self) -> &IntegrityMonitor {
        &self.monitor
    }

    pub fn answers(&self) -> &AnswerStore {
        &self.store
    }

    pub fn timer(&self) -> &SessionTimer {
        &self.timer
    }

    pub fn flush_registry(&self) -> &FlushRegistry {
        &self.registry
    }

    pub fn overview(&self) -> SessionOverview {
        SessionOverview {
            status: self.status(),
            active: self.is_active(),
            timer: self.timer.state(),
            break_status: self.timer.break_status(),
            integrity: self.monitor.integrity(),
            questions: self.store.entries(),
        }
    }

    /// Applies a server snapshot to every component.
    async fn reconcile(&self, snapshot: &SessionSnapshot) {
        *Self::lock(&self.status) = snapshot.status;

        if snapshot.is_disqualified {
            self.monitor
                .adopt_server_disqualification(snapshot.disqualification_reason.clone());
        }

        if let Some(terminal) = snapshot.status.terminal() {
            self.completion.adopt_terminal(terminal).await;
            return;
        }
        if self.completion.terminal_status().is_some() {
            return;
        }

        if self.monitor.is_disqualified() {
            if let Err(e) = self.completion.finalize(CompletionTrigger::Disqualification).await {
                tracing::error!("Failed to finalize disqualified session: {}", e);
            }
            return;
        }

        self.active
            .set(snapshot.status == SessionStatus::InProgress && !snapshot.is_on_break);
        self.timer.anchor(snapshot).await;
    }

    /// Starts a pending session, then refreshes from the server.
    pub async fn start(&self) -> Result<()> {
        if self.status() == SessionStatus::Pending {
            with_timeout(
                "startSession",
                self.config.api.request_timeout(),
                self.apis.session.start_session(&self.token),
            )
            .await?;
            tracing::info!("Session started: {}", self.token);
        }
        self.refresh().await
    }

    /// Full refresh from the server.
    pub async fn refresh(&self) -> Result<()> {
        let result = with_timeout(
            "getSession",
            self.config.api.request_timeout(),
            self.apis.session.get_session(&self.token),
        )
        .await;

        match result {
            Ok(snapshot) => {
                self.reconcile(&snapshot).await;
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    self.fail(&e);
                }
                Err(e)
            }
        }
    }

    fn fail(&self, err: &SessionError) {
        tracing::error!("Session {} is no longer valid: {}", self.token, err);
        self.active.set(false);
        self.timer.halt();
        self.store.shutdown();
        let _ = self.events.send(SessionEvent::Fatal {
            message: err.to_string(),
        });
    }

    /// Feeds one environment signal to the monitor. Focus-loss signals also
    /// checkpoint drafts in the background.
    pub async fn handle_signal(&self, signal: Signal) -> SignalOutcome {
        let flushes = matches!(signal.raw, RawSignal::VisibilityHidden | RawSignal::WindowBlur);
        let outcome = self.monitor.record(signal);

        if flushes && self.completion.terminal_status().is_none() {
            let store = self.store.clone();
            tokio::spawn(async move {
                store.checkpoint().await;
            });
        }

        if outcome.disqualified_now() {
            if let Err(e) = self.completion.finalize(CompletionTrigger::Disqualification).await {
                tracing::error!("Failed to finalize after disqualification: {}", e);
            }
        }
        outcome
    }

    fn ensure_open(&self) -> Result<()> {
        match self.completion.terminal_status() {
            Some(status) => Err(SessionError::Validation(format!("session is {}", status))),
            None => Ok(()),
        }
    }

    pub async fn edit(&self, question_id: QuestionId, text: AnswerText) -> Result<()> {
        self.ensure_open()?;
        self.store.edit(question_id, text).await
    }

    pub fn focus_question(&self, question_id: Option<QuestionId>) {
        self.store.focus_question(question_id);
    }

    /// Section navigation: persists the UI record and checkpoints drafts.
    pub async fn navigate(&self, section: Option<String>, feedback_enabled: bool) -> Vec<(QuestionId, SyncOutcome)> {
        *Self::lock(&self.current_section) = section.clone();
        if let Err(e) = self.store.save_ui_state(section, feedback_enabled).await {
            tracing::warn!("Failed to persist UI state: {}", e);
        }
        self.store.checkpoint().await
    }

    pub fn current_section(&self) -> Option<String> {
        Self::lock(&self.current_section).clone()
    }

    pub async fn checkpoint(&self) -> Vec<(QuestionId, SyncOutcome)> {
        self.store.checkpoint().await
    }

    pub async fn start_break(&self) -> Result<u64> {
        self.ensure_open()?;
        let cap = self.timer.start_break().await?;
        self.active.set(false);
        self.store.pause_focus();
        *Self::lock(&self.status) = SessionStatus::OnBreak;
        self.store.checkpoint().await;
        Ok(cap)
    }

    pub async fn end_break(&self) -> Result<u64> {
        let elapsed = self.timer.end_break().await?;
        if self.completion.terminal_status().is_none() {
            *Self::lock(&self.status) = SessionStatus::InProgress;
            self.active.set(true);
        }
        Ok(elapsed)
    }

    pub async fn submit_question(&self, question_id: QuestionId) -> Result<SubmitResult> {
        self.ensure_open()?;
        self.batch.submit_question(question_id).await
    }

    pub async fn submit_answers(&self) -> Result<BatchReport> {
        self.ensure_open()?;
        self.batch.submit_all().await
    }

    /// Manual "submit test": grades outstanding answers, then finalizes.
    pub async fn submit_test(&self) -> Result<TerminalStatus> {
        if let Some(status) = self.completion.terminal_status() {
            return Ok(status);
        }

        match self.batch.submit_all().await {
            Ok(report) if !report.all_succeeded() => {
                tracing::warn!("{} answers failed to submit before completion", report.failed.len())
            }
            Ok(_) | Err(SessionError::Validation(_)) => {}
            Err(e) => tracing::warn!("Submitting answers before completion failed: {}", e),
        }

        self.completion.finalize(CompletionTrigger::ManualSubmit).await
    }

    /// Starts the ticker and the periodic refresh.
    pub fn spawn_background(self: &Arc<Self>) {
        let mut handles = vec![self.timer.spawn_ticker()];

        if let Some(every) = self.config.timer.refresh_interval() {
            let runtime = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + every, every);
                loop {
                    interval.tick().await;
                    if runtime.terminal_status().is_some() || runtime.timer.is_halted() {
                        break;
                    }
                    if let Err(e) = runtime.refresh().await {
                        tracing::warn!("Periodic session refresh failed: {}", e);
                        if e.is_fatal() {
                            break;
                        }
                    }
                }
            }));
        }

        Self::lock(&self.background).extend(handles);
    }

    /// Samples the viewport at the configured cadence and feeds the monitor.
    pub fn attach_viewport_probe(self: &Arc<Self>, probe: Arc<dyn ViewportProbe>) {
        let runtime = Arc::clone(self);
        let every = self.config.integrity.viewport_sample_interval();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                if runtime.terminal_status().is_some() {
                    break;
                }
                if let Some(dimensions) = probe.sample() {
                    runtime.handle_signal(Signal::now(dimensions.into())).await;
                }
            }
        });
        Self::lock(&self.background).push(handle);
    }

    /// Stops background work. Local drafts are left in place.
    pub fn shutdown(&self) {
        for handle in Self::lock(&self.background).drain(..) {
            handle.abort();
        }
        self.store.shutdown();
        tracing::info!("Session runtime stopped: {}", self.token);
    }
}
