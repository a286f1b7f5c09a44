//! Metrics recorder installation and the counters the admission path emits.
use anyhow::{Context, Result};
use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

const ADMISSIONS: &str = "scanguard_admissions_total";
const STORE_FAILURES: &str = "scanguard_store_failures_total";
const USAGE_INCREMENT_FAILURES: &str = "scanguard_usage_increment_failures_total";
const SIGNUPS: &str = "scanguard_signups_total";

/// Install the global Prometheus recorder.
///
/// The returned handle renders the current snapshot for `GET /metrics`.
pub fn install_metrics() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install metrics recorder")?;
    describe_metrics();
    info!("metrics recorder installed");
    Ok(handle)
}

fn describe_metrics() {
    describe_counter!(ADMISSIONS, "Analysis attempts by admission outcome.");
    describe_counter!(
        STORE_FAILURES,
        "Store failures absorbed by a check's fail mode."
    );
    describe_counter!(
        USAGE_INCREMENT_FAILURES,
        "Completed analyses whose usage could not be recorded."
    );
    describe_counter!(SIGNUPS, "Signup decisions by outcome.");
}

pub fn record_admission(outcome: &'static str) {
    counter!(ADMISSIONS, "outcome" => outcome).increment(1);
}

pub fn record_store_failure(check: &'static str) {
    counter!(STORE_FAILURES, "check" => check).increment(1);
}

pub fn record_usage_increment_failure() {
    counter!(USAGE_INCREMENT_FAILURES).increment(1);
}

pub fn record_signup(outcome: &'static str) {
    counter!(SIGNUPS, "outcome" => outcome).increment(1);
}
