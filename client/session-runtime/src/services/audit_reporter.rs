use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::metrics::AUDIT_REPORTS_TOTAL;
use crate::models::integrity::{AuditEvent, ViolationRecord};
use crate::utils::time::with_timeout;

use super::remote::AuditLogApi;

/// Fire-and-forget delivery of violation records to the audit log.
///
/// A single background task drains the queue, so the server sees events in
/// the order they were recorded. Delivery failures are logged and counted,
/// nothing else.
#[derive(Clone)]
pub struct AuditReporter {
    queue: mpsc::UnboundedSender<AuditEvent>,
}

impl AuditReporter {
    pub fn spawn(
        api: Arc<dyn AuditLogApi>,
        token: String,
        request_timeout: Duration,
    ) -> (Self, JoinHandle<()>) {
        let (queue, mut rx) = mpsc::unbounded_channel::<AuditEvent>();

        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let result =
                    with_timeout("logEvent", request_timeout, api.log_event(&token, &event)).await;
                match result {
                    Ok(()) => {
                        AUDIT_REPORTS_TOTAL.with_label_values(&["delivered"]).inc();
                    }
                    Err(e) => {
                        AUDIT_REPORTS_TOTAL.with_label_values(&["failed"]).inc();
                        tracing::warn!(
                            "Failed to report integrity event {} (non-critical): {}",
                            event.event_type,
                            e
                        );
                    }
                }
            }
            tracing::debug!("Audit reporter queue closed");
        });

        (Self { queue }, handle)
    }

    #[cfg(test)]
    pub(crate) fn from_queue(queue: mpsc::UnboundedSender<AuditEvent>) -> Self {
        Self { queue }
    }

    pub fn report(&self, record: &ViolationRecord) {
        if self.queue.send(AuditEvent::from(record)).is_err() {
            AUDIT_REPORTS_TOTAL.with_label_values(&["dropped"]).inc();
            tracing::warn!("Audit reporter stopped; dropping {} event", record.kind);
        }
    }
}
