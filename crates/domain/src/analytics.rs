use serde::Serialize;

use crate::DomainResult;
use crate::dlq::{DeadLetterService, DlqStats};
use crate::queue::{CascadeQueueService, QueueMetrics};

const DLQ_WARN_SIZE: u64 = 100;
const FAILURE_RATE_WARN_PCT: f64 = 10.0;
const LOAD_WARN_ACTIVE: u64 = 1_000;
const HEALTHY: &str = "System is healthy. No immediate actions required.";

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceStats {
    pub success_rate: f64,
    pub retry_rate: f64,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub total_completed: u64,
    pub batch_approach_usage: u64,
    pub level_approach_usage: u64,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct HealthStats {
    pub current_load: u64,
    pub dlq_size: u64,
    pub failure_rate: f64,
}

#[derive(Clone, Copy, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CascadeAnalyticsReport {
    pub performance: PerformanceStats,
    pub usage: UsageStats,
    pub health: HealthStats,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsWithRecommendations {
    pub analytics: CascadeAnalyticsReport,
    pub recommendations: Vec<String>,
}

/// Rates and load figures over the current queue counters.
pub fn analyze(metrics: &QueueMetrics, dlq: &DlqStats) -> CascadeAnalyticsReport {
    let completed = metrics.batch_queue.completed + metrics.level_queue.completed;
    let failed = metrics.batch_queue.failed + metrics.level_queue.failed;
    let processed = completed + failed;
    let pct = |part: u64| {
        if processed == 0 {
            0.0
        } else {
            part as f64 * 100.0 / processed as f64
        }
    };

    CascadeAnalyticsReport {
        performance: PerformanceStats {
            success_rate: if processed == 0 { 100.0 } else { pct(completed) },
            retry_rate: pct(dlq.total),
        },
        usage: UsageStats {
            total_completed: completed,
            batch_approach_usage: metrics.batch_queue.completed,
            level_approach_usage: metrics.level_queue.completed,
        },
        health: HealthStats {
            current_load: metrics.batch_queue.active + metrics.level_queue.active,
            dlq_size: dlq.total,
            failure_rate: pct(failed),
        },
    }
}

pub fn recommendations(report: &CascadeAnalyticsReport) -> Vec<String> {
    let mut out = Vec::new();
    if report.health.dlq_size > DLQ_WARN_SIZE {
        out.push("DLQ has many failed jobs. Review and retry or clean up old entries.".to_string());
    }
    if report.health.failure_rate > FAILURE_RATE_WARN_PCT {
        out.push("High failure rate detected. Investigate common error patterns.".to_string());
    }
    if report.health.current_load > LOAD_WARN_ACTIVE {
        out.push("High queue load. Consider scaling workers or optimizing processing.".to_string());
    }
    if report.usage.batch_approach_usage > report.usage.level_approach_usage * 2 {
        out.push(
            "Batch approach is heavily used. Consider level-based for better scalability."
                .to_string(),
        );
    }
    if out.is_empty() {
        out.push(HEALTHY.to_string());
    }
    out
}

#[derive(Clone)]
pub struct CascadeAnalytics {
    queue: CascadeQueueService,
    dead_letters: DeadLetterService,
}

impl CascadeAnalytics {
    pub fn new(queue: CascadeQueueService, dead_letters: DeadLetterService) -> Self {
        Self {
            queue,
            dead_letters,
        }
    }

    pub async fn get_analytics(&self) -> DomainResult<CascadeAnalyticsReport> {
        let metrics = self.queue.get_queue_metrics().await?;
        let dlq = self.dead_letters.stats().await?;
        Ok(analyze(&metrics, &dlq))
    }

    pub async fn get_with_recommendations(&self) -> DomainResult<AnalyticsWithRecommendations> {
        let analytics = self.get_analytics().await?;
        Ok(AnalyticsWithRecommendations {
            recommendations: recommendations(&analytics),
            analytics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::jobs::JobCounts;
    use crate::queue::DeadLetterCount;

    fn dlq(total: u64) -> DlqStats {
        DlqStats {
            total,
            by_retry_count: Vec::new(),
            oldest_job: None,
            newest_job: None,
        }
    }

    fn metrics(batch: JobCounts, level: JobCounts) -> QueueMetrics {
        QueueMetrics {
            batch_queue: batch,
            level_queue: level,
            dead_letter_queue: DeadLetterCount::default(),
            orphaned: 0,
        }
    }

    #[test]
    fn idle_system_is_healthy() {
        let report = analyze(&QueueMetrics::default(), &dlq(0));
        assert_eq!(report.performance.success_rate, 100.0);
        assert_eq!(report.health.failure_rate, 0.0);
        assert_eq!(recommendations(&report), vec![HEALTHY.to_string()]);
    }

    #[test]
    fn rates_are_percentages_of_processed_jobs() {
        let report = analyze(
            &metrics(
                JobCounts {
                    completed: 6,
                    failed: 2,
                    ..JobCounts::default()
                },
                JobCounts {
                    completed: 12,
                    failed: 0,
                    active: 3,
                    ..JobCounts::default()
                },
            ),
            &dlq(2),
        );
        assert_eq!(report.performance.success_rate, 90.0);
        assert_eq!(report.health.failure_rate, 10.0);
        assert_eq!(report.performance.retry_rate, 10.0);
        assert_eq!(report.health.current_load, 3);
        assert_eq!(report.usage.total_completed, 18);
        assert_eq!(recommendations(&report), vec![HEALTHY.to_string()]);
    }

    #[test]
    fn each_threshold_adds_a_recommendation() {
        let report = analyze(
            &metrics(
                JobCounts {
                    completed: 30,
                    failed: 10,
                    active: 1_001,
                    ..JobCounts::default()
                },
                JobCounts {
                    completed: 5,
                    ..JobCounts::default()
                },
            ),
            &dlq(101),
        );
        let recs = recommendations(&report);
        assert_eq!(recs.len(), 4);
        assert!(recs[0].starts_with("DLQ has many failed jobs"));
        assert!(recs[1].starts_with("High failure rate"));
        assert!(recs[2].starts_with("High queue load"));
        assert!(recs[3].starts_with("Batch approach is heavily used"));
    }
}
