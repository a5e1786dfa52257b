use std::sync::OnceLock;

use anyhow::Result;
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use syllabus_domain::queue::QueueMetrics;

const JOBS_PROCESSED_TOTAL: &str = "syllabus_worker_jobs_processed_total";
const JOBS_PROCESSING_DURATION_MS: &str = "syllabus_worker_job_processing_duration_ms";
const QUEUE_DEPTH_GAUGE: &str = "syllabus_worker_queue_jobs";
const DEAD_LETTER_DEPTH_GAUGE: &str = "syllabus_worker_dead_letter_total";
const ORPHANED_GAUGE: &str = "syllabus_worker_orphaned_cascades_total";
const MAINTENANCE_REMOVED_TOTAL: &str = "syllabus_worker_maintenance_removed_total";

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    let _ = METRICS_HANDLE.set(handle);
    Ok(())
}

pub fn register_job_processed(queue: &str, result: &str, duration_ms: f64) {
    counter!(
        JOBS_PROCESSED_TOTAL,
        "queue" => queue.to_string(),
        "result" => result.to_string()
    )
    .increment(1);

    histogram!(
        JOBS_PROCESSING_DURATION_MS,
        "queue" => queue.to_string()
    )
    .record(duration_ms);
}

pub fn set_queue_gauges(metrics: &QueueMetrics) {
    for (queue, counts) in [("batch", metrics.batch_queue), ("level", metrics.level_queue)] {
        for (state, value) in [
            ("waiting", counts.waiting),
            ("delayed", counts.delayed),
            ("active", counts.active),
            ("completed", counts.completed),
            ("failed", counts.failed),
        ] {
            gauge!(QUEUE_DEPTH_GAUGE, "queue" => queue, "state" => state).set(value as f64);
        }
    }
    gauge!(DEAD_LETTER_DEPTH_GAUGE).set(metrics.dead_letter_queue.total as f64);
    gauge!(ORPHANED_GAUGE).set(metrics.orphaned as f64);
}

pub fn register_maintenance_removed(task: &'static str, removed: u64) {
    counter!(MAINTENANCE_REMOVED_TOTAL, "task" => task).increment(removed);
}
