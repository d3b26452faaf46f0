//! Local-first answer store.
//!
//! Every edit lands in the durable local store before anything else happens,
//! then a per-question debounce schedules a remote draft save. Remote saves
//! are single-flight per question and retried with backoff; failures only
//! ever change the question's sync status.

use futures::future::join_all;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SyncSettings;
use crate::error::{Result, SessionError};
use crate::metrics::{GaugeGuard, DRAFTS_IN_FLIGHT, DRAFT_SYNCS_TOTAL};
use crate::models::answer::{
    AnswerSubmission, AnswerText, DraftPayload, DraftRecord, QuestionId, QuestionSessionEntry,
    SessionUiState, SubmissionState, SubmitAttempt, SyncOutcome, SyncStatus,
};
use crate::models::event::SessionEvent;
use crate::models::session::SessionSnapshot;
use crate::storage::DraftRepository;
use crate::utils::retry::{retry_async_when, RetryConfig};
use crate::utils::single_flight::SingleFlight;
use crate::utils::time::with_timeout;

use super::flush_registry::{FlushHandle, FlushRegistry};
use super::remote::DraftApi;

struct Debounce {
    generation: u64,
    handle: JoinHandle<()>,
}

pub(crate) struct StoreInner {
    token: String,
    api: Arc<dyn DraftApi>,
    repo: DraftRepository,
    settings: SyncSettings,
    request_timeout: Duration,
    entries: Mutex<BTreeMap<QuestionId, QuestionSessionEntry>>,
    debounces: Mutex<HashMap<QuestionId, Debounce>>,
    next_generation: Mutex<u64>,
    flights: Arc<SingleFlight<QuestionId>>,
    focus: Mutex<Option<(QuestionId, Instant)>>,
    events: broadcast::Sender<SessionEvent>,
    /// Set once the session is terminal; no local record is written after it.
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct AnswerStore {
    inner: Arc<StoreInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl AnswerStore {
    pub fn new(
        api: Arc<dyn DraftApi>,
        repo: DraftRepository,
        settings: SyncSettings,
        request_timeout: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                token: repo.token().to_string(),
                api,
                repo,
                settings,
                request_timeout,
                entries: Mutex::new(BTreeMap::new()),
                debounces: Mutex::new(HashMap::new()),
                next_generation: Mutex::new(0),
                flights: SingleFlight::new(),
                focus: Mutex::new(None),
                events,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<StoreInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<StoreInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Builds entries from the server snapshot, reconciling with local records.
    ///
    /// A submitted remote answer always wins. Otherwise a fresh local record
    /// beats the remote draft, and an unsynced one is queued for sync again.
    pub async fn load(&self, snapshot: &SessionSnapshot) -> Result<()> {
        let mut loaded = Vec::new();

        for (order, question) in snapshot.questions().into_iter().enumerate() {
            let mut entry = QuestionSessionEntry::new(question.id, question.category.clone(), order as u32);
            let remote = question.answer.clone().unwrap_or_default();
            let remote_text = AnswerText::new(
                remote.candidate_answer.clone().unwrap_or_default(),
                remote.candidate_code.clone().unwrap_or_default(),
            );
            entry.elapsed_seconds = remote.time_spent_seconds.unwrap_or(0);

            if remote.is_submitted {
                entry.text = remote_text.clone();
                entry.last_synced_snapshot = Some(remote_text.clone());
                entry.submission_state = SubmissionState::Submitted;
                if let Err(e) = self
                    .inner
                    .repo
                    .save_draft(question.id, &DraftRecord::from_text(&remote_text, true))
                    .await
                {
                    tracing::warn!("Failed to cache submitted answer {}: {}", question.id, e);
                }
            } else {
                let local = match self.inner.repo.load_draft(question.id).await {
                    Ok(local) => local,
                    Err(e) => {
                        tracing::warn!("Local draft for question {} unreadable: {}", question.id, e);
                        None
                    }
                };

                if remote_text.has_content() {
                    entry.last_synced_snapshot = Some(remote_text.clone());
                }
                match local {
                    Some(record) => {
                        entry.text = record.text();
                        if record.synced && entry.last_synced_snapshot.is_none() {
                            entry.last_synced_snapshot = Some(entry.text.clone());
                        }
                    }
                    None => entry.text = remote_text,
                }
            }

            if entry.needs_sync() {
                entry.sync_status = SyncStatus::Pending;
            }
            loaded.push(entry);
        }

        let restored: Vec<QuestionId> = loaded
            .iter()
            .filter(|e| e.sync_status == SyncStatus::Pending)
            .map(|e| e.id)
            .collect();

        {
            let mut entries = lock(&self.inner.entries);
            entries.clear();
            for entry in loaded {
                entries.insert(entry.id, entry);
            }
        }

        tracing::info!(
            "Answer store loaded: session={}, questions={}, restored_unsynced={}",
            self.inner.token,
            lock(&self.inner.entries).len(),
            restored.len()
        );

        for question_id in restored {
            self.schedule_debounce(question_id);
        }
        Ok(())
    }

    pub fn entry(&self, question_id: QuestionId) -> Option<QuestionSessionEntry> {
        lock(&self.inner.entries).get(&question_id).cloned()
    }

    /// All entries in presentation order.
    pub fn entries(&self) -> Vec<QuestionSessionEntry> {
        let mut entries: Vec<_> = lock(&self.inner.entries).values().cloned().collect();
        entries.sort_by_key(|e| (e.order, e.id));
        entries
    }

    pub fn question_ids(&self) -> Vec<QuestionId> {
        self.entries().into_iter().map(|e| e.id).collect()
    }

    /// Records an edit locally and (re)starts the question's debounce.
    pub async fn edit(&self, question_id: QuestionId, text: AnswerText) -> Result<()> {
        if self.is_closed() {
            return Err(SessionError::Validation("session has ended".into()));
        }
        {
            let mut entries = lock(&self.inner.entries);
            let entry = entries.get_mut(&question_id).ok_or_else(|| {
                SessionError::Validation(format!("unknown question {}", question_id))
            })?;
            if entry.text == text {
                return Ok(());
            }
            entry.text = text.clone();
            if entry.submission_state == SubmissionState::Submitted {
                entry.submission_state = SubmissionState::EditedAfterSubmit;
            }
        }

        self.set_status(question_id, SyncStatus::Pending);
        self.schedule_debounce(question_id);

        self.inner
            .repo
            .save_draft(question_id, &DraftRecord::from_text(&text, false))
            .await?;
        if self.is_closed() {
            self.discard_local(question_id).await;
        }
        Ok(())
    }

    fn set_status(&self, question_id: QuestionId, status: SyncStatus) {
        let changed = {
            let mut entries = lock(&self.inner.entries);
            match entries.get_mut(&question_id) {
                Some(entry) if entry.sync_status != status => {
                    entry.sync_status = status;
                    true
                }
                _ => false,
            }
        };
        if changed {
            let _ = self.inner.events.send(SessionEvent::SyncStatusChanged {
                question_id,
                status,
            });
        }
    }

    fn schedule_debounce(&self, question_id: QuestionId) {
        if self.is_closed() {
            return;
        }
        let generation = {
            let mut next = lock(&self.inner.next_generation);
            *next += 1;
            *next
        };
        let store = self.clone();
        let delay = self.inner.settings.debounce();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut debounces = lock(&store.inner.debounces);
                if debounces.get(&question_id).map(|d| d.generation) == Some(generation) {
                    debounces.remove(&question_id);
                }
            }
            store.sync(question_id).await;
        });

        let previous = lock(&self.inner.debounces).insert(question_id, Debounce { generation, handle });
        if let Some(previous) = previous {
            previous.handle.abort();
        }
    }

    fn cancel_debounce(&self, question_id: QuestionId) {
        if let Some(pending) = lock(&self.inner.debounces).remove(&question_id) {
            pending.handle.abort();
        }
    }

    fn debounce_pending(&self, question_id: QuestionId) -> bool {
        lock(&self.inner.debounces).contains_key(&question_id)
    }

    pub fn is_in_flight(&self, question_id: QuestionId) -> bool {
        self.inner.flights.is_in_flight(&question_id)
    }

    /// Resolves once no question has a sync outstanding.
    pub async fn wait_idle(&self) {
        self.inner.flights.wait_idle().await
    }

    fn retry_config(&self) -> RetryConfig {
        let mut config =
            RetryConfig::linear(self.inner.settings.max_attempts, self.inner.settings.base_backoff());
        config.strategy = self.inner.settings.backoff;
        config
    }

    /// Saves the question's draft remotely if it changed since the last ack.
    ///
    /// A call while another sync of the same question is outstanding does
    /// nothing and reports [`SyncOutcome::InFlight`].
    pub async fn sync(&self, question_id: QuestionId) -> SyncOutcome {
        let Some(guard) = self.inner.flights.try_acquire(question_id) else {
            DRAFT_SYNCS_TOTAL.with_label_values(&["in_flight"]).inc();
            return SyncOutcome::InFlight;
        };

        let text = {
            let entries = lock(&self.inner.entries);
            match entries.get(&question_id) {
                None => {
                    return SyncOutcome::Failed(SessionError::Validation(format!(
                        "unknown question {}",
                        question_id
                    )))
                }
                Some(entry) if !entry.needs_sync() => None,
                Some(entry) => Some(entry.text.clone()),
            }
        };

        let Some(text) = text else {
            if !self.debounce_pending(question_id) {
                self.settle_status(question_id);
            }
            DRAFT_SYNCS_TOTAL.with_label_values(&["skipped"]).inc();
            return SyncOutcome::Skipped;
        };

        // An explicit flush preempts the pending debounce
        self.cancel_debounce(question_id);
        self.set_status(question_id, SyncStatus::Syncing);
        let in_flight = GaugeGuard::hold(&DRAFTS_IN_FLIGHT);

        tracing::debug!("Syncing draft: session={}, question={}", self.inner.token, question_id);

        let payload = DraftPayload::new(question_id, &text);
        let result = retry_async_when(
            self.retry_config(),
            SessionError::is_retryable,
            |attempt, err, wait| {
                tracing::warn!(
                    "Draft sync attempt {} failed for question {}: {} (retrying in {:?})",
                    attempt,
                    question_id,
                    err,
                    wait
                );
                self.set_status(question_id, SyncStatus::Retrying);
            },
            || {
                with_timeout(
                    "saveDraft",
                    self.inner.request_timeout,
                    self.inner.api.save_draft(&self.inner.token, &payload),
                )
            },
        )
        .await;

        drop(in_flight);

        let outcome = match result {
            Ok(_) => {
                self.mark_synced(question_id, &text).await;
                DRAFT_SYNCS_TOTAL.with_label_values(&["synced"]).inc();
                SyncOutcome::Synced
            }
            Err(e) => {
                tracing::warn!("Draft sync failed for question {}: {}", question_id, e);
                self.mark_failed(question_id);
                DRAFT_SYNCS_TOTAL.with_label_values(&["failed"]).inc();
                SyncOutcome::Failed(e)
            }
        };

        drop(guard);
        self.after_flight(question_id, &text);
        outcome
    }

    /// Records a server ack for `text` and keeps the local record consistent
    /// with whatever the entry holds afterwards.
    async fn mark_synced(&self, question_id: QuestionId, text: &AnswerText) {
        let unchanged = {
            let mut entries = lock(&self.inner.entries);
            match entries.get_mut(&question_id) {
                Some(entry) => {
                    entry.last_synced_snapshot = Some(text.clone());
                    entry.text == *text
                }
                None => return,
            }
        };

        if !unchanged {
            self.set_status(question_id, SyncStatus::Pending);
            return;
        }

        self.set_status(question_id, SyncStatus::Synced);
        if self.is_closed() {
            tracing::debug!("Session ended; not rewriting local draft {}", question_id);
            return;
        }
        if let Err(e) = self
            .inner
            .repo
            .save_draft(question_id, &DraftRecord::from_text(text, true))
            .await
        {
            tracing::warn!("Failed to mark local draft {} as synced: {}", question_id, e);
        }
        if self.is_closed() {
            // The purge ran while the write above was outstanding
            self.discard_local(question_id).await;
            return;
        }

        // An edit may have raced the write above
        let current = self.entry(question_id).map(|e| e.text);
        if let Some(current) = current.filter(|c| c != text) {
            if let Err(e) = self
                .inner
                .repo
                .save_draft(question_id, &DraftRecord::from_text(&current, false))
                .await
            {
                tracing::warn!("Failed to restore newer local draft {}: {}", question_id, e);
            }
        }
    }

    async fn discard_local(&self, question_id: QuestionId) {
        if let Err(e) = self.inner.repo.remove_draft(question_id).await {
            tracing::warn!("Failed to drop local draft {} after session end: {}", question_id, e);
        }
    }

    fn mark_failed(&self, question_id: QuestionId) {
        let status = if self.debounce_pending(question_id) {
            SyncStatus::Pending
        } else {
            SyncStatus::Error
        };
        self.set_status(question_id, status);
    }

    /// Nothing to send: reflect whether the server already has the text.
    fn settle_status(&self, question_id: QuestionId) {
        let status = match self.entry(question_id) {
            Some(entry) if entry.is_dirty() => SyncStatus::Local,
            Some(_) => SyncStatus::Synced,
            None => return,
        };
        self.set_status(question_id, status);
    }

    /// Edits that arrived while the flight was out get their own debounce.
    fn after_flight(&self, question_id: QuestionId, sent: &AnswerText) {
        let dirty = self
            .entry(question_id)
            .map(|e| e.needs_sync() && e.text != *sent)
            .unwrap_or(false);
        if dirty && !self.debounce_pending(question_id) {
            tracing::debug!("Rescheduling sync for question {} after flight", question_id);
            self.set_status(question_id, SyncStatus::Pending);
            self.schedule_debounce(question_id);
        }
    }

    /// Sends every dirty question through one batch draft save, then falls
    /// back to individual syncs for anything the batch did not acknowledge.
    pub async fn checkpoint(&self) -> Vec<(QuestionId, SyncOutcome)> {
        let candidates: Vec<QuestionSessionEntry> = self
            .entries()
            .into_iter()
            .filter(|e| e.needs_sync())
            .collect();

        let mut guards = Vec::new();
        let mut batch = Vec::new();
        for entry in candidates {
            if let Some(guard) = self.inner.flights.try_acquire(entry.id) {
                guards.push(guard);
                batch.push((entry.id, entry.text));
            }
        }

        if batch.is_empty() {
            return Vec::new();
        }

        for (question_id, _) in &batch {
            self.cancel_debounce(*question_id);
            self.set_status(*question_id, SyncStatus::Syncing);
        }

        let payloads: Vec<DraftPayload> = batch
            .iter()
            .map(|(id, text)| DraftPayload::new(*id, text))
            .collect();

        tracing::debug!(
            "Checkpointing {} drafts for session {}",
            payloads.len(),
            self.inner.token
        );

        let acked: Vec<QuestionId> = match with_timeout(
            "batchSaveDrafts",
            self.inner.request_timeout,
            self.inner.api.batch_save_drafts(&self.inner.token, &payloads),
        )
        .await
        {
            Ok(ack) => ack
                .results
                .into_iter()
                .filter(|item| item.success)
                .map(|item| item.question_id)
                .collect(),
            Err(e) => {
                tracing::warn!("Batch draft save failed, falling back to single saves: {}", e);
                Vec::new()
            }
        };

        let mut outcomes = Vec::new();
        let mut fallback = Vec::new();
        for (question_id, text) in &batch {
            if acked.contains(question_id) {
                self.mark_synced(*question_id, text).await;
                DRAFT_SYNCS_TOTAL.with_label_values(&["synced"]).inc();
                outcomes.push((*question_id, SyncOutcome::Synced));
            } else {
                fallback.push(*question_id);
            }
        }

        drop(guards);

        let retried = join_all(fallback.iter().map(|id| self.sync(*id))).await;
        outcomes.extend(fallback.into_iter().zip(retried));

        for (question_id, text) in &batch {
            self.after_flight(*question_id, text);
        }
        outcomes
    }

    /// Syncs every dirty question and waits for outstanding flights.
    pub async fn flush_all(&self) -> Vec<(QuestionId, SyncOutcome)> {
        let ids = self.question_ids();
        let outcomes = join_all(ids.iter().map(|id| self.sync(*id))).await;
        self.wait_idle().await;
        ids.into_iter().zip(outcomes).collect()
    }

    pub fn flush_handle(&self, question_id: QuestionId) -> FlushHandle {
        FlushHandle::new(question_id, self.downgrade())
    }

    /// Hands one flush capability per question to `registry`.
    pub fn register_flush_handles(&self, registry: &FlushRegistry) {
        for question_id in self.question_ids() {
            registry.register(self.flush_handle(question_id));
        }
    }

    // ---- elapsed time ----

    /// Moves the elapsed-time clock to `question_id`.
    pub fn focus_question(&self, question_id: Option<QuestionId>) {
        let now = Instant::now();
        let previous = {
            let mut focus = lock(&self.inner.focus);
            let previous = focus.take();
            *focus = question_id.map(|id| (id, now));
            previous
        };
        if let Some((id, since)) = previous {
            let seconds = now.saturating_duration_since(since).as_secs();
            if let Some(entry) = lock(&self.inner.entries).get_mut(&id) {
                entry.elapsed_seconds += seconds;
            }
        }
    }

    /// Stops the elapsed-time clock, e.g. for a break.
    pub fn pause_focus(&self) -> Option<QuestionId> {
        let current = lock(&self.inner.focus).map(|(id, _)| id);
        self.focus_question(None);
        current
    }

    pub fn elapsed_seconds(&self, question_id: QuestionId) -> u64 {
        let base = self.entry(question_id).map(|e| e.elapsed_seconds).unwrap_or(0);
        let running = match *lock(&self.inner.focus) {
            Some((id, since)) if id == question_id => Instant::now().saturating_duration_since(since).as_secs(),
            _ => 0,
        };
        base + running
    }

    // ---- optimistic submission ----

    /// Submittable questions in presentation order.
    pub fn submission_candidates(&self) -> Vec<QuestionId> {
        self.entries()
            .into_iter()
            .filter(|e| e.is_submittable())
            .map(|e| e.id)
            .collect()
    }

    /// Marks the attempt pending and returns the payload plus the state to
    /// restore on rollback.
    pub fn begin_submit(&self, question_id: QuestionId) -> Option<(AnswerSubmission, SubmissionState)> {
        let elapsed = self.elapsed_seconds(question_id);
        let mut entries = lock(&self.inner.entries);
        let entry = entries.get_mut(&question_id)?;
        if !entry.is_submittable() || entry.submit_attempt == Some(SubmitAttempt::Pending) {
            return None;
        }
        entry.submit_attempt = Some(SubmitAttempt::Pending);
        Some((
            AnswerSubmission::new(question_id, &entry.text, elapsed),
            entry.submission_state,
        ))
    }

    pub async fn commit_submit(&self, question_id: QuestionId, submitted: &AnswerText) {
        let unchanged = {
            let mut entries = lock(&self.inner.entries);
            let Some(entry) = entries.get_mut(&question_id) else {
                return;
            };
            let unchanged = entry.text == *submitted;
            entry.submit_attempt = Some(SubmitAttempt::Committed);
            entry.submission_state = if unchanged {
                SubmissionState::Submitted
            } else {
                SubmissionState::EditedAfterSubmit
            };
            unchanged
        };
        // The server now holds the submitted text as the answer
        self.mark_synced(question_id, submitted).await;
        if unchanged {
            self.cancel_debounce(question_id);
        }
    }

    pub fn rollback_submit(&self, question_id: QuestionId, prior: SubmissionState) {
        if let Some(entry) = lock(&self.inner.entries).get_mut(&question_id) {
            entry.submit_attempt = Some(SubmitAttempt::RolledBack);
            entry.submission_state = prior;
        }
    }

    // ---- session-level record ----

    pub async fn save_ui_state(&self, current_section: Option<String>, feedback_enabled: bool) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let state = SessionUiState {
            current_section,
            feedback_enabled,
            timestamp: chrono::Utc::now(),
        };
        self.inner.repo.save_ui_state(&state).await
    }

    pub async fn restore_ui_state(&self) -> Option<SessionUiState> {
        match self.inner.repo.load_ui_state().await {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Failed to restore UI state: {}", e);
                None
            }
        }
    }

    /// Stops all pending debounces. Entries stay readable.
    pub fn shutdown(&self) {
        let pending: Vec<Debounce> = lock(&self.inner.debounces).drain().map(|(_, d)| d).collect();
        for debounce in pending {
            debounce.handle.abort();
        }
    }

    /// Deletes this session's local drafts and UI record.
    pub async fn purge(&self) -> Result<usize> {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.shutdown();
        let unsynced = self
            .entries()
            .iter()
            .filter(|e| e.needs_sync())
            .count();
        if unsynced > 0 {
            tracing::warn!(
                "Purging {} drafts the server never acknowledged for session {}",
                unsynced,
                self.inner.token
            );
        }
        let removed = self.inner.repo.purge_drafts().await?;
        self.inner.repo.remove_ui_state().await?;
        Ok(removed)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for (_, debounce) in lock(&self.debounces).drain() {
            debounce.handle.abort();
        }
    }
}
