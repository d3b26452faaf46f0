//! Exactly-once session finalization.
//!
//! Timer expiry, manual submit and disqualification all funnel into
//! [`CompletionController::finalize`]. The terminal status lives in a
//! `OnceCell`: the first caller runs the completion, concurrent callers wait
//! on it, and everyone observes the same result.

use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, OnceCell};

use crate::config::CompletionSettings;
use crate::error::{Result, SessionError};
use crate::metrics::COMPLETIONS_TOTAL;
use crate::models::event::SessionEvent;
use crate::models::session::{CompletionAck, CompletionTrigger, TerminalStatus};
use crate::utils::retry::{retry_async_when, BackoffStrategy, RetryConfig};
use crate::utils::time::with_timeout;

use super::answer_store::AnswerStore;
use super::flush_registry::FlushRegistry;
use super::integrity_monitor::IntegrityMonitor;
use super::remote::SessionApi;
use super::session_timer::{ExpiryHook, SessionTimer};
use super::ActiveFlag;

pub(crate) struct CompletionInner {
    token: String,
    api: Arc<dyn SessionApi>,
    settings: CompletionSettings,
    request_timeout: Duration,
    store: AnswerStore,
    registry: Arc<FlushRegistry>,
    timer: SessionTimer,
    monitor: IntegrityMonitor,
    active: ActiveFlag,
    terminal: OnceCell<TerminalStatus>,
    events: broadcast::Sender<SessionEvent>,
}

#[derive(Clone)]
pub struct CompletionController {
    inner: Arc<CompletionInner>,
}

pub struct CompletionDeps {
    pub token: String,
    pub api: Arc<dyn SessionApi>,
    pub settings: CompletionSettings,
    pub request_timeout: Duration,
    pub store: AnswerStore,
    pub registry: Arc<FlushRegistry>,
    pub timer: SessionTimer,
    pub monitor: IntegrityMonitor,
    pub active: ActiveFlag,
    pub events: broadcast::Sender<SessionEvent>,
}

impl CompletionController {
    /// Also attaches itself to the timer as its expiry hook.
    pub fn new(deps: CompletionDeps) -> Self {
        let inner = Arc::new(CompletionInner {
            token: deps.token,
            api: deps.api,
            settings: deps.settings,
            request_timeout: deps.request_timeout,
            store: deps.store,
            registry: deps.registry,
            timer: deps.timer,
            monitor: deps.monitor,
            active: deps.active,
            terminal: OnceCell::new(),
            events: deps.events,
        });

        let weak = Arc::downgrade(&inner);
        let hook: Weak<dyn ExpiryHook> = weak;
        inner.timer.set_expiry_hook(hook);

        Self { inner }
    }

    pub fn terminal_status(&self) -> Option<TerminalStatus> {
        self.inner.terminal.get().copied()
    }

    pub async fn finalize(&self, trigger: CompletionTrigger) -> Result<TerminalStatus> {
        self.inner.finalize(trigger).await
    }

    /// Adopts a terminal status the server already holds, without calling
    /// `completeSession`. Returns `false` if a terminal status was already set
    /// or a completion is running.
    pub async fn adopt_terminal(&self, status: TerminalStatus) -> bool {
        if self.inner.terminal.set(status).is_err() {
            return false;
        }
        tracing::info!(
            "Adopting server terminal status for session {}: {}",
            self.inner.token,
            status
        );
        self.inner.enter_terminal(status, None).await;
        true
    }
}

impl CompletionInner {
    async fn finalize(&self, trigger: CompletionTrigger) -> Result<TerminalStatus> {
        if let Some(status) = self.terminal.get() {
            return Ok(*status);
        }
        self.terminal
            .get_or_try_init(|| self.run(trigger))
            .await
            .copied()
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.settings.max_attempts,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(4),
            jitter_max: Some(Duration::from_millis(100)),
            strategy: BackoffStrategy::Exponential,
        }
    }

    async fn run(&self, trigger: CompletionTrigger) -> Result<TerminalStatus> {
        tracing::info!(
            "Completing session {}: trigger={}",
            self.token,
            trigger.as_str()
        );

        let was_active = self.active.is_active();
        self.active.set(false);

        // Bounded flush; completion goes ahead without it on timeout
        match tokio::time::timeout(self.settings.flush_timeout(), self.registry.flush_all()).await {
            Ok(outcomes) => tracing::debug!("Pre-completion flush covered {} questions", outcomes.len()),
            Err(_) => tracing::warn!(
                "Pre-completion flush timed out after {:?}; completing anyway",
                self.settings.flush_timeout()
            ),
        }

        let result = retry_async_when(
            self.retry_config(),
            SessionError::is_retryable,
            |attempt, err, wait| {
                tracing::warn!(
                    "completeSession attempt {} failed: {} (retrying in {:?})",
                    attempt,
                    err,
                    wait
                );
            },
            || {
                with_timeout(
                    "completeSession",
                    self.request_timeout,
                    self.api.complete_session(&self.token),
                )
            },
        )
        .await;

        match result {
            Ok(ack) => {
                let outcome = match ack {
                    CompletionAck::Completed => "completed",
                    CompletionAck::AlreadyCompleted => "already_completed",
                };
                COMPLETIONS_TOTAL
                    .with_label_values(&[trigger.as_str(), outcome])
                    .inc();

                let status = trigger.terminal_status();
                self.enter_terminal(status, Some(trigger)).await;
                Ok(status)
            }
            Err(e) => {
                COMPLETIONS_TOTAL
                    .with_label_values(&[trigger.as_str(), "failed"])
                    .inc();

                if e.is_fatal() {
                    tracing::error!("Session {} is no longer valid: {}", self.token, e);
                    self.timer.halt();
                    self.store.shutdown();
                    let _ = self.events.send(SessionEvent::Fatal {
                        message: e.to_string(),
                    });
                } else {
                    tracing::error!("Failed to complete session {}: {}", self.token, e);
                    match trigger {
                        CompletionTrigger::ManualSubmit => self.active.set(was_active),
                        // Let the next refresh reporting zero remaining try again
                        CompletionTrigger::TimerExpiry => self.timer.rearm_expiry(),
                        CompletionTrigger::Disqualification => {}
                    }
                }
                Err(e)
            }
        }
    }

    async fn enter_terminal(&self, status: TerminalStatus, trigger: Option<CompletionTrigger>) {
        self.active.set(false);
        self.timer.halt();

        match self.store.purge().await {
            Ok(removed) => tracing::debug!("Purged {} local drafts", removed),
            Err(e) => tracing::warn!("Failed to purge local drafts: {}", e),
        }

        let reason = match status {
            TerminalStatus::Disqualified => self.monitor.integrity().disqualification_reason,
            _ => None,
        };

        tracing::info!("Session {} finished: {}", self.token, status);
        let _ = self.events.send(SessionEvent::SessionTerminated {
            status,
            trigger,
            reason,
        });
    }
}

#[async_trait]
impl ExpiryHook for CompletionInner {
    async fn on_expired(&self) {
        if let Err(e) = self.finalize(CompletionTrigger::TimerExpiry).await {
            tracing::error!("Completion after expiry failed: {}", e);
        }
    }
}
