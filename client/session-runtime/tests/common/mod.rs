#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use proctor_session::config::{Config, StorageBackend, ViolationWeights};
use proctor_session::error::{Result, SessionError};
use proctor_session::models::answer::{
    AnswerSubmission, BatchAnswerResultItem, BatchDraftAck, BatchDraftResultItem, BatchSubmitAck,
    DraftAck, DraftPayload, QuestionId, SubmitResult,
};
use proctor_session::models::integrity::AuditEvent;
use proctor_session::models::session::{
    BreakEnded, BreakStarted, CompletionAck, QuestionPayload, RemoteAnswer, SessionSnapshot,
    SessionStatus,
};
use proctor_session::models::SessionEvent;
use proctor_session::storage::MemoryStore;
use proctor_session::{AuditLogApi, DraftApi, RemoteApis, SessionApi, SessionRuntime};

pub const TOKEN: &str = "token-abc";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// In-process assessment backend with scripted failures and delays.
pub struct FakeBackend {
    snapshot: Mutex<SessionSnapshot>,
    failures: Mutex<HashMap<&'static str, VecDeque<SessionError>>>,
    delays: Mutex<HashMap<&'static str, Duration>>,
    calls: Mutex<Vec<&'static str>>,
    rejected: Mutex<HashSet<QuestionId>>,
    batch_routes: AtomicBool,
    completed: AtomicBool,
    saves_in_flight: AtomicUsize,
    max_saves_in_flight: AtomicUsize,
    drafts: Mutex<Vec<DraftPayload>>,
    submissions: Mutex<Vec<AnswerSubmission>>,
    batch_sizes: Mutex<Vec<usize>>,
    audit_events: Mutex<Vec<AuditEvent>>,
}

impl FakeBackend {
    pub fn new(snapshot: SessionSnapshot) -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(snapshot),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            rejected: Mutex::new(HashSet::new()),
            batch_routes: AtomicBool::new(true),
            completed: AtomicBool::new(false),
            saves_in_flight: AtomicUsize::new(0),
            max_saves_in_flight: AtomicUsize::new(0),
            drafts: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
            batch_sizes: Mutex::new(Vec::new()),
            audit_events: Mutex::new(Vec::new()),
        })
    }

    /// The next `times` calls to `endpoint` fail with `error`.
    pub fn fail_times(&self, endpoint: &'static str, times: usize, error: SessionError) {
        let mut failures = self.failures.lock().unwrap();
        let queue = failures.entry(endpoint).or_default();
        for _ in 0..times {
            queue.push_back(error.clone());
        }
    }

    pub fn set_delay(&self, endpoint: &'static str, delay: Duration) {
        self.delays.lock().unwrap().insert(endpoint, delay);
    }

    /// Submissions of `question_id` are rejected by the server.
    pub fn reject_question(&self, question_id: QuestionId) {
        self.rejected.lock().unwrap().insert(question_id);
    }

    /// Batch routes answer 404, as on a backend that never had them.
    pub fn disable_batch_routes(&self) {
        self.batch_routes.store(false, Ordering::SeqCst);
    }

    pub fn mark_completed(&self) {
        self.completed.store(true, Ordering::SeqCst);
    }

    pub fn update_snapshot(&self, update: impl FnOnce(&mut SessionSnapshot)) {
        update(&mut self.snapshot.lock().unwrap());
    }

    pub fn calls(&self, endpoint: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| **c == endpoint)
            .count()
    }

    pub fn call_log(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    pub fn max_saves_in_flight(&self) -> usize {
        self.max_saves_in_flight.load(Ordering::SeqCst)
    }

    pub fn drafts(&self) -> Vec<DraftPayload> {
        self.drafts.lock().unwrap().clone()
    }

    pub fn submissions(&self) -> Vec<AnswerSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes.lock().unwrap().clone()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit_events.lock().unwrap().clone()
    }

    async fn enter(&self, endpoint: &'static str) -> Result<()> {
        self.calls.lock().unwrap().push(endpoint);
        let delay = self.delays.lock().unwrap().get(endpoint).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self
            .failures
            .lock()
            .unwrap()
            .get_mut(endpoint)
            .and_then(VecDeque::pop_front);
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn is_rejected(&self, question_id: QuestionId) -> bool {
        self.rejected.lock().unwrap().contains(&question_id)
    }

    fn missing_route(&self, endpoint: &str) -> Result<()> {
        if self.batch_routes.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(SessionError::permanent(endpoint, 404, "Not Found"))
        }
    }
}

#[async_trait]
impl DraftApi for FakeBackend {
    async fn save_draft(&self, _token: &str, draft: &DraftPayload) -> Result<DraftAck> {
        let now = self.saves_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_saves_in_flight.fetch_max(now, Ordering::SeqCst);
        let result = self.enter("saveDraft").await;
        self.saves_in_flight.fetch_sub(1, Ordering::SeqCst);
        result?;

        self.drafts.lock().unwrap().push(draft.clone());
        Ok(DraftAck {
            success: true,
            question_id: draft.question_id,
            saved_at: Utc::now(),
            version: None,
        })
    }

    async fn batch_save_drafts(&self, _token: &str, drafts: &[DraftPayload]) -> Result<BatchDraftAck> {
        self.missing_route("batchSaveDrafts")?;
        self.enter("batchSaveDrafts").await?;

        self.drafts.lock().unwrap().extend(drafts.iter().cloned());
        Ok(BatchDraftAck {
            total: drafts.len(),
            successful: drafts.len(),
            failed: 0,
            results: drafts
                .iter()
                .map(|d| BatchDraftResultItem {
                    question_id: d.question_id,
                    success: true,
                    error: None,
                })
                .collect(),
        })
    }

    async fn submit_answer(&self, _token: &str, submission: &AnswerSubmission) -> Result<SubmitResult> {
        self.enter("submitAnswer").await?;
        if self.is_rejected(submission.question_id) {
            return Err(SessionError::permanent("submitAnswer", 422, "Answer rejected"));
        }
        self.submissions.lock().unwrap().push(submission.clone());
        Ok(SubmitResult {
            question_id: submission.question_id,
            score: Some(1.0),
            feedback: None,
        })
    }

    async fn batch_submit(&self, _token: &str, submissions: &[AnswerSubmission]) -> Result<BatchSubmitAck> {
        self.missing_route("batchSubmit")?;
        self.enter("batchSubmit").await?;
        self.batch_sizes.lock().unwrap().push(submissions.len());

        let mut results = Vec::new();
        for submission in submissions {
            let rejected = self.is_rejected(submission.question_id);
            if !rejected {
                self.submissions.lock().unwrap().push(submission.clone());
            }
            results.push(BatchAnswerResultItem {
                question_id: submission.question_id,
                success: !rejected,
                score: (!rejected).then_some(1.0),
                feedback: None,
                error: rejected.then(|| "Answer rejected".to_string()),
            });
        }
        let successful = results.iter().filter(|r| r.success).count();
        Ok(BatchSubmitAck {
            total: results.len(),
            successful,
            failed: results.len() - successful,
            results,
        })
    }
}

#[async_trait]
impl AuditLogApi for FakeBackend {
    async fn log_event(&self, _token: &str, event: &AuditEvent) -> Result<()> {
        self.enter("logEvent").await?;
        self.audit_events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl SessionApi for FakeBackend {
    async fn get_session(&self, _token: &str) -> Result<SessionSnapshot> {
        self.enter("getSession").await?;
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn start_session(&self, _token: &str) -> Result<SessionSnapshot> {
        self.enter("startSession").await?;
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.status = SessionStatus::InProgress;
        Ok(snapshot.clone())
    }

    async fn complete_session(&self, _token: &str) -> Result<CompletionAck> {
        self.enter("completeSession").await?;
        if self.completed.swap(true, Ordering::SeqCst) {
            Ok(CompletionAck::AlreadyCompleted)
        } else {
            Ok(CompletionAck::Completed)
        }
    }

    async fn start_break(&self, _token: &str) -> Result<BreakStarted> {
        self.enter("startBreak").await?;
        let mut snapshot = self.snapshot.lock().unwrap();
        let now = Utc::now();
        snapshot.is_on_break = true;
        snapshot.current_break_start = Some(now);
        Ok(BreakStarted {
            break_start: now,
            remaining_break_seconds: snapshot.remaining_break_seconds,
            max_single_break_seconds: snapshot.max_single_break_seconds,
        })
    }

    async fn end_break(&self, _token: &str) -> Result<BreakEnded> {
        self.enter("endBreak").await?;
        let mut snapshot = self.snapshot.lock().unwrap();
        snapshot.is_on_break = false;
        snapshot.current_break_start = None;
        Ok(BreakEnded {
            remaining_break_seconds: snapshot.remaining_break_seconds,
            break_duration_seconds: 0,
        })
    }
}

/// An in-progress session with `question_count` coding questions (ids from 1).
pub fn snapshot(question_count: i64, remaining_seconds: u64) -> SessionSnapshot {
    let questions = (1..=question_count)
        .map(|id| QuestionPayload {
            id,
            category: "coding".to_string(),
            question_order: id as u32,
            question_text: format!("Question {}", id),
            answer: None,
        })
        .collect();

    SessionSnapshot {
        status: SessionStatus::InProgress,
        current_section: Some("coding".to_string()),
        duration_seconds: Some(3600),
        remaining_seconds: Some(remaining_seconds),
        is_on_break: false,
        current_break_start: None,
        remaining_break_seconds: 600,
        max_single_break_seconds: 300,
        used_break_time_seconds: 0,
        break_count: 0,
        is_disqualified: false,
        disqualification_reason: None,
        questions_by_section: BTreeMap::from([("coding".to_string(), questions)]),
    }
}

/// Sets the server-side answer of one question in `snapshot`.
pub fn with_remote_answer(
    snapshot: &mut SessionSnapshot,
    question_id: QuestionId,
    answer: &str,
    is_submitted: bool,
) {
    for question in snapshot.questions_by_section.values_mut().flatten() {
        if question.id == question_id {
            question.answer = Some(RemoteAnswer {
                candidate_answer: Some(answer.to_string()),
                candidate_code: None,
                is_submitted,
                time_spent_seconds: None,
            });
        }
    }
}

/// Memory-backed config with integrity thresholds {1, 3, 6} at unit weight.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.storage.backend = StorageBackend::Memory;
    config.timer.refresh_interval_secs = 0;
    config.integrity.weights = ViolationWeights::uniform(1.0);
    config.integrity.warning_thresholds = vec![1.0, 3.0, 6.0];
    config.integrity.max_warnings = 3;
    config
}

pub async fn connect(
    backend: &Arc<FakeBackend>,
    local: Arc<MemoryStore>,
    config: Config,
) -> Arc<SessionRuntime> {
    init_tracing();
    SessionRuntime::connect(config, TOKEN, RemoteApis::from_backend(backend.clone()), local)
        .await
        .expect("runtime should connect")
}

/// Everything currently buffered on the event stream.
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Polls `condition` until it holds, advancing time in small steps.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
