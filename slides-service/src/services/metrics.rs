//! Metrics collection and Prometheus export.
//!
//! Recording goes through the `metrics` facade, so the helpers below are
//! no-ops until [`init_metrics`] installs the Prometheus recorder.

use metrics::{counter, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

/// Global handle to the Prometheus recorder.
pub static METRICS_HANDLE: OnceLock<Option<PrometheusHandle>> = OnceLock::new();

/// Install the Prometheus recorder. Safe to call more than once; only the
/// first call installs anything.
pub fn init_metrics() {
    METRICS_HANDLE.get_or_init(|| match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => {
            tracing::info!("Prometheus metrics initialized");
            Some(handle)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install Prometheus recorder");
            None
        }
    });
}

/// Get the current metrics in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .and_then(|handle| handle.as_ref())
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

/// Record a finished text generation. `outcome` is `completed`, `failed`,
/// `timed_out` or `cancelled`.
pub fn record_generation(step: &str, outcome: &str, tokens: usize, elapsed: Duration) {
    counter!(
        "slides_generation_total",
        "step" => step.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    counter!("slides_generation_tokens_total", "step" => step.to_string())
        .increment(tokens as u64);
    histogram!("slides_generation_duration_seconds", "step" => step.to_string())
        .record(elapsed.as_secs_f64());
}

/// Record a finished image job.
pub fn record_image(outcome: &str, elapsed: Duration) {
    counter!("slides_image_total", "outcome" => outcome.to_string()).increment(1);
    histogram!("slides_image_duration_seconds").record(elapsed.as_secs_f64());
}

pub fn record_image_poll() {
    counter!("slides_image_poll_attempts").increment(1);
}

/// Record a session store operation error.
pub fn record_session_store_error(operation: &'static str) {
    counter!("slides_session_store_errors_total", "operation" => operation).increment(1);
}
