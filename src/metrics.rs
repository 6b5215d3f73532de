//! Metrics hooks, compiled to no-ops without the `metrics` feature.

#[cfg(feature = "metrics")]
pub(crate) fn record_stage_item(stage: &str) {
    ::metrics::counter!("pipeweld_stage_items_total", "stage" => stage.to_string()).increment(1);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_stage_error(stage: &str) {
    ::metrics::counter!("pipeweld_stage_errors_total", "stage" => stage.to_string()).increment(1);
}

#[cfg(feature = "metrics")]
pub(crate) fn record_admission() {
    ::metrics::counter!("pipeweld_limiter_admissions_total").increment(1);
}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_stage_item(_stage: &str) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_stage_error(_stage: &str) {}

#[cfg(not(feature = "metrics"))]
pub(crate) fn record_admission() {}
