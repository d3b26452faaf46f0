use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, register_int_gauge, Encoder, HistogramVec,
    IntCounterVec, IntGauge, TextEncoder,
};

use crate::error::SessionError;

lazy_static! {
    // Remote API calls
    pub static ref REMOTE_CALLS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_remote_calls_total",
        "Total number of remote API calls",
        &["endpoint", "status"]
    )
    .unwrap();

    pub static ref REMOTE_CALL_DURATION_SECONDS: HistogramVec = register_histogram_vec!(
        "proctor_remote_call_duration_seconds",
        "Remote API call duration in seconds",
        &["endpoint"],
        vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    )
    .unwrap();

    // Local durable store
    pub static ref STORE_OPERATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_store_operations_total",
        "Total number of local store operations",
        &["operation", "status"]
    )
    .unwrap();

    // Answer store
    pub static ref DRAFT_SYNCS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_draft_syncs_total",
        "Draft sync attempts by outcome",
        &["outcome"]
    )
    .unwrap();

    pub static ref DRAFTS_IN_FLIGHT: IntGauge = register_int_gauge!(
        "proctor_drafts_in_flight",
        "Number of question syncs currently in flight"
    )
    .unwrap();

    // Integrity
    pub static ref VIOLATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_violations_total",
        "Total number of integrity violations recorded",
        &["kind"]
    )
    .unwrap();

    pub static ref INTEGRITY_TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_integrity_transitions_total",
        "Warning state machine transitions",
        &["level"]
    )
    .unwrap();

    pub static ref AUDIT_REPORTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_audit_reports_total",
        "Audit-log deliveries by status",
        &["status"]
    )
    .unwrap();

    // Batch submission
    pub static ref BATCH_ITEMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_batch_items_total",
        "Batch-submitted items by result",
        &["result"]
    )
    .unwrap();

    // Completion
    pub static ref COMPLETIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "proctor_completions_total",
        "Session completions by trigger and outcome",
        &["trigger", "outcome"]
    )
    .unwrap();
}

/// Renders all metrics in Prometheus text format
pub fn render_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer)
        .map_err(|e| prometheus::Error::Msg(format!("Failed to convert metrics to UTF-8: {}", e)))
}

/// Helper: track a remote call with metrics
pub async fn track_remote_call<F, T>(endpoint: &str, future: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = Result<T, SessionError>>,
{
    let start = std::time::Instant::now();
    let result = future.await;
    let duration = start.elapsed().as_secs_f64();

    let status = match &result {
        Ok(_) => "success",
        Err(e) => e.kind(),
    };

    REMOTE_CALLS_TOTAL
        .with_label_values(&[endpoint, status])
        .inc();

    REMOTE_CALL_DURATION_SECONDS
        .with_label_values(&[endpoint])
        .observe(duration);

    result
}

/// Helper: track a local store operation with metrics
pub async fn track_store_operation<F, T>(operation: &str, future: F) -> Result<T, SessionError>
where
    F: std::future::Future<Output = Result<T, SessionError>>,
{
    let result = future.await;
    let status = if result.is_ok() { "success" } else { "error" };

    STORE_OPERATIONS_TOTAL
        .with_label_values(&[operation, status])
        .inc();

    result
}

/// Keeps a gauge raised while alive, so a dropped future still lowers it.
pub struct GaugeGuard<'a> {
    gauge: &'a IntGauge,
}

impl<'a> GaugeGuard<'a> {
    pub fn hold(gauge: &'a IntGauge) -> Self {
        gauge.inc();
        Self { gauge }
    }
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_render_metrics() {
        VIOLATIONS_TOTAL.with_label_values(&["tab_switch"]).inc();

        let output = render_metrics().expect("render");
        assert!(output.contains("proctor_violations_total"));
    }

    #[tokio::test]
    async fn remote_call_errors_are_labelled_by_kind() {
        let before = REMOTE_CALLS_TOTAL
            .with_label_values(&["metricsCheck", "transient_network"])
            .get();

        let _: Result<(), _> = track_remote_call("metricsCheck", async {
            Err(SessionError::transient("metricsCheck", "refused"))
        })
        .await;

        let after = REMOTE_CALLS_TOTAL
            .with_label_values(&["metricsCheck", "transient_network"])
            .get();
        assert_eq!(after, before + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn gauge_guard_lowers_gauge_when_future_is_dropped() {
        let gauge = IntGauge::new("guard_test_in_flight", "in flight").unwrap();

        let held = async {
            let _guard = GaugeGuard::hold(&gauge);
            tokio::time::sleep(Duration::from_secs(60)).await;
        };
        let timed_out = tokio::time::timeout(Duration::from_secs(1), held).await;

        assert!(timed_out.is_err());
        assert_eq!(gauge.get(), 0);
    }
}
