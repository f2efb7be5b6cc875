//! Prometheus metrics for the job bus.
//!
//! Metric names are described once at startup; recording goes through the
//! `metrics` facade so library code works whether or not an exporter is
//! installed.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::Deserialize;
use std::net::SocketAddr;

/// Metrics configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MetricsConfig {
    /// Address for the Prometheus scrape endpoint (e.g. "0.0.0.0:9090").
    /// Metrics are still recorded through the facade when unset.
    #[serde(default)]
    pub prometheus_listen: Option<SocketAddr>,
}

/// Install the Prometheus exporter if configured.
///
/// Must be called from inside a tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> anyhow::Result<()> {
    if let Some(addr) = config.prometheus_listen {
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        tracing::info!(address = %addr, "Prometheus exporter listening");
    }
    describe_metrics();
    Ok(())
}

fn describe_metrics() {
    describe_counter!("jobbus_jobs_enqueued_total", "Jobs inserted into the store");
    describe_counter!("jobbus_jobs_deduplicated_total", "Enqueues answered by an existing idempotency key");
    describe_counter!("jobbus_jobs_claimed_total", "Jobs handed to a worker by the claim coordinator");
    describe_counter!("jobbus_jobs_completed_total", "Attempts that completed successfully");
    describe_counter!("jobbus_jobs_failed_total", "Attempts that failed");
    describe_counter!("jobbus_jobs_retried_total", "Failed attempts put back in the queue");
    describe_counter!("jobbus_dead_letters_total", "Jobs moved to the dead letter store");
    describe_counter!("jobbus_leases_reclaimed_total", "Claims reclaimed after lease expiry");
    describe_counter!("jobbus_policy_denials_total", "Policy checks that denied an agent");
    describe_counter!("jobbus_errors_total", "Errors by code");
    describe_histogram!("jobbus_job_duration_ms", "Attempt duration in milliseconds");
    describe_gauge!("jobbus_worker_active_jobs", "Jobs currently executing in this process");
}

pub fn record_enqueued(job_type: &str, deduplicated: bool) {
    if deduplicated {
        counter!("jobbus_jobs_deduplicated_total", "job_type" => job_type.to_string()).increment(1);
    } else {
        counter!("jobbus_jobs_enqueued_total", "job_type" => job_type.to_string()).increment(1);
    }
}

pub fn record_claimed(count: usize) {
    counter!("jobbus_jobs_claimed_total").increment(count as u64);
}

pub fn record_attempt(job_type: &str, succeeded: bool, duration_ms: u64) {
    let name = if succeeded {
        "jobbus_jobs_completed_total"
    } else {
        "jobbus_jobs_failed_total"
    };
    counter!(name, "job_type" => job_type.to_string()).increment(1);
    histogram!("jobbus_job_duration_ms", "job_type" => job_type.to_string()).record(duration_ms as f64);
}

pub fn record_retry(job_type: &str) {
    counter!("jobbus_jobs_retried_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn record_dead_letter(job_type: &str) {
    counter!("jobbus_dead_letters_total", "job_type" => job_type.to_string()).increment(1);
}

pub fn record_reclaimed(count: usize) {
    counter!("jobbus_leases_reclaimed_total").increment(count as u64);
}

pub fn record_policy_denial(agent_id: &str) {
    counter!("jobbus_policy_denials_total", "agent_id" => agent_id.to_string()).increment(1);
}

pub fn set_active_jobs(active: u64) {
    gauge!("jobbus_worker_active_jobs").set(active as f64);
}
