use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use crate::error::{Result, SessionError};
use crate::metrics::BATCH_ITEMS_TOTAL;
use crate::models::answer::{AnswerSubmission, QuestionId, SubmissionState, SubmitResult};
use crate::models::batch::{BatchJob, BatchReport, ItemResult};
use crate::models::event::SessionEvent;
use crate::utils::single_flight::SingleFlight;
use crate::utils::time::with_timeout;

use super::answer_store::AnswerStore;
use super::remote::DraftApi;

struct Prepared {
    submission: AnswerSubmission,
    prior: SubmissionState,
}

/// Submits outstanding answers for grading in sequential chunks.
#[derive(Clone)]
pub struct BatchSubmitter {
    token: String,
    api: Arc<dyn DraftApi>,
    store: AnswerStore,
    chunk_size: usize,
    request_timeout: Duration,
    running: Arc<SingleFlight<&'static str>>,
    events: broadcast::Sender<SessionEvent>,
}

impl BatchSubmitter {
    pub fn new(
        token: String,
        api: Arc<dyn DraftApi>,
        store: AnswerStore,
        chunk_size: usize,
        request_timeout: Duration,
        events: broadcast::Sender<SessionEvent>,
    ) -> Self {
        Self {
            token,
            api,
            store,
            chunk_size: chunk_size.max(1),
            request_timeout,
            running: SingleFlight::new(),
            events,
        }
    }

    /// Submits every answer with content that is not yet submitted.
    ///
    /// Chunks run one after another; items inside a chunk go out together.
    /// Item failures never abort the job and are listed in the report.
    pub async fn submit_all(&self) -> Result<BatchReport> {
        let Some(_guard) = self.running.try_acquire("batch") else {
            return Err(SessionError::ConcurrencyConflict("batch submission".into()));
        };

        let candidates = self.store.submission_candidates();
        if candidates.is_empty() {
            return Err(SessionError::Validation("no answers to submit".into()));
        }

        let mut job = BatchJob::new(candidates, self.chunk_size);
        tracing::info!(
            "Batch submission started: session={}, job={}, items={}, chunks={}",
            self.token,
            job.id,
            job.total_count,
            job.chunk_count()
        );

        let chunks: Vec<Vec<QuestionId>> = job
            .target_question_ids
            .chunks(job.chunk_size)
            .map(<[QuestionId]>::to_vec)
            .collect();

        for chunk in chunks {
            let mut prepared = Vec::new();
            for question_id in &chunk {
                match self.store.begin_submit(*question_id) {
                    Some((submission, prior)) => prepared.push(Prepared { submission, prior }),
                    None => {
                        job.per_item_result.insert(
                            *question_id,
                            ItemResult::Failed {
                                error: "answer is no longer submittable".into(),
                            },
                        );
                    }
                }
            }

            let results = self.submit_chunk(&prepared).await;
            for item in prepared {
                let question_id = item.submission.question_id;
                let result = results
                    .get(&question_id)
                    .cloned()
                    .unwrap_or_else(|| Err("missing from batch response".to_string()));
                let outcome = self.settle(item, result).await;
                job.per_item_result.insert(question_id, outcome);
            }

            job.completed_count += chunk.len();
            let _ = self.events.send(SessionEvent::BatchProgress(job.progress()));
            tracing::debug!(
                "Batch progress: job={}, {}/{}",
                job.id,
                job.completed_count,
                job.total_count
            );
        }

        let report = job.into_report();
        if report.all_succeeded() {
            tracing::info!("Batch submission finished: {} answers submitted", report.succeeded.len());
        } else {
            tracing::warn!(
                "Batch submission finished with failures: submitted={}, failed={:?}",
                report.succeeded.len(),
                report.failed
            );
        }
        let _ = self.events.send(SessionEvent::BatchFinished(report.clone()));
        Ok(report)
    }

    /// One `batchSubmit` call; individual submits if the chunk call fails.
    async fn submit_chunk(
        &self,
        prepared: &[Prepared],
    ) -> BTreeMap<QuestionId, std::result::Result<SubmitResult, String>> {
        if prepared.is_empty() {
            return BTreeMap::new();
        }
        let submissions: Vec<AnswerSubmission> =
            prepared.iter().map(|p| p.submission.clone()).collect();

        match with_timeout(
            "batchSubmit",
            self.request_timeout,
            self.api.batch_submit(&self.token, &submissions),
        )
        .await
        {
            Ok(ack) => ack
                .results
                .into_iter()
                .map(|item| {
                    let result = if item.success {
                        Ok(SubmitResult {
                            question_id: item.question_id,
                            score: item.score,
                            feedback: item.feedback,
                        })
                    } else {
                        Err(item.error.unwrap_or_else(|| "rejected".to_string()))
                    };
                    (item.question_id, result)
                })
                .collect(),
            Err(e) if e.is_fatal() => submissions
                .iter()
                .map(|s| (s.question_id, Err(e.to_string())))
                .collect(),
            Err(e) => {
                tracing::warn!(
                    "Chunk submission failed ({}), submitting {} answers individually",
                    e,
                    submissions.len()
                );
                let results = join_all(submissions.iter().map(|s| self.submit_one(s))).await;
                submissions
                    .iter()
                    .map(|s| s.question_id)
                    .zip(results.into_iter().map(|r| r.map_err(|e| e.to_string())))
                    .collect()
            }
        }
    }

    async fn submit_one(&self, submission: &AnswerSubmission) -> Result<SubmitResult> {
        with_timeout(
            "submitAnswer",
            self.request_timeout,
            self.api.submit_answer(&self.token, submission),
        )
        .await
    }

    /// Commits or rolls back the optimistic attempt.
    async fn settle(
        &self,
        item: Prepared,
        result: std::result::Result<SubmitResult, String>,
    ) -> ItemResult {
        let question_id = item.submission.question_id;
        match result {
            Ok(ack) => {
                self.store
                    .commit_submit(question_id, &item.submission.text())
                    .await;
                BATCH_ITEMS_TOTAL.with_label_values(&["submitted"]).inc();
                ItemResult::Submitted {
                    score: ack.score,
                    feedback: ack.feedback,
                }
            }
            Err(error) => {
                tracing::warn!("Answer {} was not submitted: {}", question_id, error);
                self.store.rollback_submit(question_id, item.prior);
                BATCH_ITEMS_TOTAL.with_label_values(&["failed"]).inc();
                ItemResult::Failed { error }
            }
        }
    }

    /// Submits a single question through the same optimistic path.
    pub async fn submit_question(&self, question_id: QuestionId) -> Result<SubmitResult> {
        let (submission, prior) = self.store.begin_submit(question_id).ok_or_else(|| {
            SessionError::Validation(format!("question {} has nothing to submit", question_id))
        })?;

        let result = self.submit_one(&submission).await;
        let item = Prepared { submission, prior };
        match result {
            Ok(ack) => {
                self.settle(item, Ok(ack.clone())).await;
                Ok(ack)
            }
            Err(e) => {
                self.settle(item, Err(e.to_string())).await;
                Err(e)
            }
        }
    }
}
