//! Seams to the assessment backend. The runtime only talks to these traits;
//! [`super::http_client::HttpAssessmentClient`] binds them to HTTP.

use async_trait::async_trait;

use crate::error::Result;
use crate::models::answer::{
    AnswerSubmission, BatchDraftAck, BatchSubmitAck, DraftAck, DraftPayload, SubmitResult,
};
use crate::models::integrity::AuditEvent;
use crate::models::session::{BreakEnded, BreakStarted, CompletionAck, SessionSnapshot};

#[async_trait]
pub trait DraftApi: Send + Sync {
    async fn save_draft(&self, token: &str, draft: &DraftPayload) -> Result<DraftAck>;

    async fn batch_save_drafts(&self, token: &str, drafts: &[DraftPayload]) -> Result<BatchDraftAck>;

    async fn submit_answer(&self, token: &str, submission: &AnswerSubmission) -> Result<SubmitResult>;

    async fn batch_submit(&self, token: &str, submissions: &[AnswerSubmission]) -> Result<BatchSubmitAck>;
}

#[async_trait]
pub trait AuditLogApi: Send + Sync {
    async fn log_event(&self, token: &str, event: &AuditEvent) -> Result<()>;
}

#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn get_session(&self, token: &str) -> Result<SessionSnapshot>;

    async fn start_session(&self, token: &str) -> Result<SessionSnapshot>;

    /// Idempotent: a session that is already finalized acknowledges with
    /// [`CompletionAck::AlreadyCompleted`].
    async fn complete_session(&self, token: &str) -> Result<CompletionAck>;

    async fn start_break(&self, token: &str) -> Result<BreakStarted>;

    async fn end_break(&self, token: &str) -> Result<BreakEnded>;
}

/// The three backend seams bundled for construction.
#[derive(Clone)]
pub struct RemoteApis {
    pub drafts: std::sync::Arc<dyn DraftApi>,
    pub audit: std::sync::Arc<dyn AuditLogApi>,
    pub session: std::sync::Arc<dyn SessionApi>,
}

impl RemoteApis {
    /// One backend implementing every seam.
    pub fn from_backend<B>(backend: std::sync::Arc<B>) -> Self
    where
        B: DraftApi + AuditLogApi + SessionApi + 'static,
    {
        Self {
            drafts: backend.clone(),
            audit: backend.clone(),
            session: backend,
        }
    }
}
