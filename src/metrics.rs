//! Prometheus metrics for virta
//!
//! Registration is opt-in: call [`Metrics::init`] once at startup. Until then
//! every `try_record_*` helper is a no-op.

use crate::error::{Result, VirtaError};
use prometheus::{
    CounterVec, Encoder, HistogramVec, TextEncoder, register_counter_vec, register_histogram_vec,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Serializes registration so concurrent `init` calls do not double-register
static INIT: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// All virta metrics
pub struct Metrics {
    /// Elements streamed (by provider)
    pub elements_streamed: CounterVec,

    /// Providers given up after exhausting restarts (by provider)
    pub provider_failures: CounterVec,

    /// Sub-stream restarts (by source)
    pub restarts: CounterVec,

    /// Backoff requests (by outcome: scheduled, superseded, delivered)
    pub backoffs: CounterVec,

    /// Computed backoff delays (by component)
    pub backoff_delay: HistogramVec,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        let _guard = INIT.lock();
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            elements_streamed: register_counter_vec!(
                "virta_elements_streamed_total",
                "Total elements streamed from providers",
                &["provider"]
            )
            .map_err(|e| VirtaError::Metrics(format!("elements_streamed: {e}")))?,

            provider_failures: register_counter_vec!(
                "virta_provider_failures_total",
                "Providers skipped after exhausting their restarts",
                &["provider"]
            )
            .map_err(|e| VirtaError::Metrics(format!("provider_failures: {e}")))?,

            restarts: register_counter_vec!(
                "virta_substream_restarts_total",
                "Sub-stream restarts after failure",
                &["source"]
            )
            .map_err(|e| VirtaError::Metrics(format!("restarts: {e}")))?,

            backoffs: register_counter_vec!(
                "virta_backoffs_total",
                "Backoff requests by outcome",
                &["outcome"]
            )
            .map_err(|e| VirtaError::Metrics(format!("backoffs: {e}")))?,

            backoff_delay: register_histogram_vec!(
                "virta_backoff_delay_seconds",
                "Computed backoff delays",
                &["component"],
                vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 120.0]
            )
            .map_err(|e| VirtaError::Metrics(format!("backoff_delay: {e}")))?,
        };

        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| VirtaError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }
}

/// Gather all metrics and encode as Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

pub fn try_record_element(provider: &str) {
    if let Some(m) = Metrics::get() {
        m.elements_streamed.with_label_values(&[provider]).inc();
    }
}

pub fn try_record_provider_failure(provider: &str) {
    if let Some(m) = Metrics::get() {
        m.provider_failures.with_label_values(&[provider]).inc();
    }
}

pub fn try_record_restart(source: &str, delay_secs: f64) {
    if let Some(m) = Metrics::get() {
        m.restarts.with_label_values(&[source]).inc();
        m.backoff_delay
            .with_label_values(&["resume"])
            .observe(delay_secs);
    }
}

pub fn try_record_backoff(outcome: &str) {
    if let Some(m) = Metrics::get() {
        m.backoffs.with_label_values(&[outcome]).inc();
    }
}

pub fn try_record_backoff_delay(delay_secs: f64) {
    if let Some(m) = Metrics::get() {
        m.backoff_delay
            .with_label_values(&["coordinator"])
            .observe(delay_secs);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_is_idempotent() {
        let first = Metrics::init().unwrap();
        let second = Metrics::init().unwrap();
        assert!(std::ptr::eq(first, second));
    }

    #[test]
    fn test_recorded_metrics_are_gathered() {
        Metrics::init().unwrap();
        try_record_element("things");
        try_record_backoff("scheduled");

        let text = gather();
        assert!(text.contains("virta_elements_streamed_total"));
        assert!(text.contains("virta_backoffs_total"));
    }
}
