use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, Weak};

use crate::models::answer::{QuestionId, SyncOutcome};

use super::answer_store::{AnswerStore, StoreInner};

/// Capability to flush one question's pending draft.
///
/// Holds the store weakly, so a registry outliving its store flushes nothing.
#[derive(Clone)]
pub struct FlushHandle {
    question_id: QuestionId,
    store: Weak<StoreInner>,
}

impl FlushHandle {
    pub(crate) fn new(question_id: QuestionId, store: Weak<StoreInner>) -> Self {
        Self { question_id, store }
    }

    pub fn question_id(&self) -> QuestionId {
        self.question_id
    }

    /// Syncs now. If a sync is already outstanding, waits for it to land and
    /// then sends whatever changed meanwhile.
    pub async fn flush(&self) -> SyncOutcome {
        let Some(inner) = self.store.upgrade() else {
            return SyncOutcome::Skipped;
        };
        let store = AnswerStore::from_inner(inner);

        match store.sync(self.question_id).await {
            SyncOutcome::InFlight => {
                store.wait_idle().await;
                store.sync(self.question_id).await
            }
            outcome => outcome,
        }
    }
}

/// `questionId → FlushHandle` map owned by the session runtime.
#[derive(Default)]
pub struct FlushRegistry {
    handles: Mutex<BTreeMap<QuestionId, FlushHandle>>,
}

impl FlushRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn handles(&self) -> MutexGuard<'_, BTreeMap<QuestionId, FlushHandle>> {
        self.handles.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn register(&self, handle: FlushHandle) {
        self.handles().insert(handle.question_id(), handle);
    }

    pub fn len(&self) -> usize {
        self.handles().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles().is_empty()
    }

    /// Flushes every registered question concurrently.
    pub async fn flush_all(&self) -> Vec<(QuestionId, SyncOutcome)> {
        let handles: Vec<FlushHandle> = self.handles().values().cloned().collect();
        let outcomes = join_all(handles.iter().map(|h| h.flush())).await;

        let failed = outcomes
            .iter()
            .filter(|o| matches!(o, SyncOutcome::Failed(_)))
            .count();
        if failed > 0 {
            tracing::warn!("Flush finished with {} failed drafts", failed);
        }

        handles
            .iter()
            .map(FlushHandle::question_id)
            .zip(outcomes)
            .collect()
    }
}
