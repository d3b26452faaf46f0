use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

use super::answer::QuestionId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemResult {
    Submitted {
        score: Option<f64>,
        feedback: Option<String>,
    },
    Failed {
        error: String,
    },
}

impl ItemResult {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemResult::Submitted { .. })
    }
}

/// One bulk submission run. Lives only for the duration of the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub id: Uuid,
    pub target_question_ids: Vec<QuestionId>,
    pub chunk_size: usize,
    pub completed_count: usize,
    pub total_count: usize,
    pub per_item_result: BTreeMap<QuestionId, ItemResult>,
}

impl BatchJob {
    pub fn new(target_question_ids: Vec<QuestionId>, chunk_size: usize) -> Self {
        let total_count = target_question_ids.len();
        Self {
            id: Uuid::new_v4(),
            target_question_ids,
            chunk_size: chunk_size.max(1),
            completed_count: 0,
            total_count,
            per_item_result: BTreeMap::new(),
        }
    }

    pub fn chunk_count(&self) -> usize {
        self.total_count.div_ceil(self.chunk_size)
    }

    pub fn progress(&self) -> BatchProgress {
        BatchProgress {
            job_id: self.id,
            completed_count: self.completed_count,
            total_count: self.total_count,
        }
    }

    pub fn into_report(self) -> BatchReport {
        let mut succeeded = Vec::new();
        let mut failed = BTreeMap::new();
        for (question_id, result) in &self.per_item_result {
            match result {
                ItemResult::Submitted { .. } => succeeded.push(*question_id),
                ItemResult::Failed { error } => {
                    failed.insert(*question_id, error.clone());
                }
            }
        }
        BatchReport {
            job_id: self.id,
            total: self.total_count,
            chunks: self.chunk_count(),
            succeeded,
            failed,
            results: self.per_item_result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchProgress {
    pub job_id: Uuid,
    pub completed_count: usize,
    pub total_count: usize,
}

/// Aggregate outcome, reported after the last chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub job_id: Uuid,
    pub total: usize,
    pub chunks: usize,
    pub succeeded: Vec<QuestionId>,
    pub failed: BTreeMap<QuestionId, String>,
    pub results: BTreeMap<QuestionId, ItemResult>,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_rounds_up() {
        assert_eq!(BatchJob::new((1..=12).collect(), 5).chunk_count(), 3);
        assert_eq!(BatchJob::new((1..=10).collect(), 5).chunk_count(), 2);
        assert_eq!(BatchJob::new(vec![1], 0).chunk_count(), 1);
    }

    #[test]
    fn report_splits_successes_and_failures() {
        let mut job = BatchJob::new(vec![1, 2], 5);
        job.per_item_result.insert(
            1,
            ItemResult::Submitted {
                score: Some(80.0),
                feedback: None,
            },
        );
        job.per_item_result.insert(
            2,
            ItemResult::Failed {
                error: "timeout".into(),
            },
        );

        let report = job.into_report();
        assert_eq!(report.succeeded, vec![1]);
        assert_eq!(report.failed.get(&2).map(String::as_str), Some("timeout"));
        assert!(!report.all_succeeded());
    }
}
