mod observability;

use std::future::Future;
use std::time::Duration;

use syllabus_domain::ports::jobs::QueueName;
use syllabus_domain::processors::CascadeWorker;
use syllabus_domain::queue::{CascadeQueueService, RetentionStats};
use syllabus_domain::util::format_ms_rfc3339;
use syllabus_infra::{config::AppConfig, logging::init_tracing, runtime::CascadeRuntime};
use tokio::task::JoinSet;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const COMPLETED_WARN_THRESHOLD: u64 = 10_000;
const FAILED_WARN_THRESHOLD: u64 = 1_000;
const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load()?;
    init_tracing(&config)?;
    observability::init_metrics()?;

    let runtime = CascadeRuntime::from_config(&config).await?;
    let worker = runtime.worker();
    let queue = runtime.queue.clone();
    let shutdown = CancellationToken::new();
    let mut tasks = JoinSet::new();

    let poll = Duration::from_millis(config.worker_poll_interval_ms.max(1));
    for name in QueueName::ALL {
        tasks.spawn(consume(worker.clone(), name, poll, shutdown.clone()));
    }

    let promote_batch = config.worker_promote_batch.max(1);
    tasks.spawn(every(poll, shutdown.clone(), {
        let queue = queue.clone();
        move || {
            let queue = queue.clone();
            async move {
                if let Err(err) = queue.promote_due(promote_batch).await {
                    warn!(error = %err, "delayed job promotion failed");
                }
            }
        }
    }));

    let lease = Duration::from_millis(config.worker_active_lease_ms);
    tasks.spawn(every(lease / 2, shutdown.clone(), {
        let queue = queue.clone();
        move || {
            let queue = queue.clone();
            async move {
                if let Err(err) = queue.requeue_stale(lease, promote_batch).await {
                    warn!(error = %err, "stale lease reaping failed");
                }
            }
        }
    }));

    let completed_hours = config.completed_retention_hours;
    tasks.spawn(every(
        Duration::from_millis(config.maintenance_completed_interval_ms),
        shutdown.clone(),
        {
            let queue = queue.clone();
            move || cleanup_completed(queue.clone(), completed_hours)
        },
    ));

    let failed_days = config.failed_retention_days;
    let dlq_days = config.dlq_retention_days;
    tasks.spawn(every(
        Duration::from_millis(config.maintenance_failed_interval_ms),
        shutdown.clone(),
        {
            let dead_letters = runtime.dead_letters();
            let queue = queue.clone();
            move || {
                let dead_letters = dead_letters.clone();
                let queue = queue.clone();
                async move {
                    cleanup_failed(queue, failed_days).await;
                    match dead_letters.purge_older_than(dlq_days).await {
                        Ok(purged) => {
                            observability::register_maintenance_removed("dlq", purged);
                            if purged > 0 {
                                info!(purged, days = dlq_days, "dead-letter entries purged");
                            }
                        }
                        Err(err) => error!(error = %err, "dead-letter purge failed"),
                    }
                }
            }
        },
    ));

    tasks.spawn(every(
        Duration::from_millis(config.maintenance_stats_interval_ms),
        shutdown.clone(),
        {
            let queue = queue.clone();
            move || report_retention(queue.clone())
        },
    ));

    tasks.spawn(every(
        Duration::from_millis(config.orphan_reconcile_interval_ms),
        shutdown.clone(),
        {
            let queue = queue.clone();
            move || {
                let queue = queue.clone();
                async move {
                    match queue.reconcile_orphans().await {
                        Ok(report) if report.reconciled > 0 || !report.failed.is_empty() => info!(
                            reconciled = report.reconciled,
                            requeued_jobs = report.requeued_jobs,
                            failed = report.failed.len(),
                            "orphan reconcile pass finished"
                        ),
                        Ok(_) => {}
                        Err(err) => warn!(error = %err, "orphan reconcile failed"),
                    }
                }
            }
        },
    ));

    tasks.spawn(every(GAUGE_REFRESH_INTERVAL, shutdown.clone(), {
        let queue = queue.clone();
        move || {
            let queue = queue.clone();
            async move {
                match queue.get_queue_metrics().await {
                    Ok(metrics) => observability::set_queue_gauges(&metrics),
                    Err(err) => warn!(error = %err, "queue metrics refresh failed"),
                }
            }
        }
    }));

    info!(
        data_backend = %config.data_backend,
        queue_backend = %config.queue_backend,
        poll_interval_ms = config.worker_poll_interval_ms,
        "worker started"
    );
    let _ = tokio::signal::ctrl_c().await;
    info!("worker shutting down");
    shutdown.cancel();
    while tasks.join_next().await.is_some() {}
    info!("worker shutdown");

    Ok(())
}

async fn consume(
    worker: CascadeWorker,
    queue: QueueName,
    poll: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let step = tokio::select! {
            _ = shutdown.cancelled() => break,
            step = worker.run_once(queue, poll) => step,
        };
        match step {
            Ok(Some(job)) => observability::register_job_processed(
                queue.as_str(),
                job.disposition.as_str(),
                job.elapsed.as_secs_f64() * 1_000.0,
            ),
            Ok(None) => {}
            Err(err) => {
                error!(queue = %queue, error = %err, "cascade consumer step failed");
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        }
    }
}

/// Runs `task` on a fixed period until shutdown. The first tick fires
/// immediately.
async fn every<F, Fut>(period: Duration, shutdown: CancellationToken, mut task: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut ticker = interval(period.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => task().await,
        }
    }
}

async fn cleanup_completed(queue: CascadeQueueService, older_than_hours: u64) {
    match queue.cleanup_completed_jobs(older_than_hours).await {
        Ok(result) => {
            observability::register_maintenance_removed("completed", result.total);
            info!(
                batch_queue = result.batch_queue,
                level_queue = result.level_queue,
                total = result.total,
                "completed jobs cleaned up"
            );
        }
        Err(err) => error!(error = %err, "completed job cleanup failed"),
    }
}

async fn cleanup_failed(queue: CascadeQueueService, older_than_days: u64) {
    match queue.cleanup_failed_jobs(older_than_days).await {
        Ok(result) => {
            observability::register_maintenance_removed("failed", result.total);
            info!(
                batch_queue = result.batch_queue,
                level_queue = result.level_queue,
                dlq = result.dlq,
                total = result.total,
                "failed jobs cleaned up"
            );
        }
        Err(err) => error!(error = %err, "failed job cleanup failed"),
    }
}

async fn report_retention(queue: CascadeQueueService) {
    match queue.retention_stats().await {
        Ok(stats) => {
            info!(
                completed = stats.total_completed(),
                failed = stats.total_failed(),
                dlq = stats.dlq.total,
                "queue retention stats"
            );
            for warning in retention_warnings(&stats) {
                warn!("{warning}");
            }
        }
        Err(err) => error!(error = %err, "retention stats failed"),
    }
}

fn retention_warnings(stats: &RetentionStats) -> Vec<String> {
    let mut warnings = Vec::new();
    let completed = stats.total_completed();
    if completed > COMPLETED_WARN_THRESHOLD {
        let oldest = [
            stats.batch_queue.completed.oldest_timestamp,
            stats.level_queue.completed.oldest_timestamp,
        ]
        .into_iter()
        .flatten()
        .min();
        warnings.push(format!(
            "High number of completed jobs: {completed} (oldest: {})",
            oldest.map_or_else(|| "n/a".to_string(), format_ms_rfc3339)
        ));
    }
    let failed = stats.total_failed();
    if failed > FAILED_WARN_THRESHOLD {
        let oldest = [
            stats.batch_queue.failed.oldest_timestamp,
            stats.level_queue.failed.oldest_timestamp,
            stats.dlq.oldest_timestamp,
        ]
        .into_iter()
        .flatten()
        .min();
        warnings.push(format!(
            "High number of failed jobs: {failed} (oldest: {})",
            oldest.map_or_else(|| "n/a".to_string(), format_ms_rfc3339)
        ));
    }
    warnings
}
