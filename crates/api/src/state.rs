use syllabus_domain::analytics::CascadeAnalytics;
use syllabus_domain::dlq::DeadLetterService;
use syllabus_domain::orchestrator::CascadeOrchestrator;
use syllabus_domain::status_change::StatusChangeService;
use syllabus_infra::config::AppConfig;
use syllabus_infra::runtime::CascadeRuntime;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub runtime: CascadeRuntime,
    pub orchestrator: CascadeOrchestrator,
    pub dead_letters: DeadLetterService,
    pub analytics: CascadeAnalytics,
    pub status_changes: StatusChangeService,
}

impl AppState {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let runtime = CascadeRuntime::from_config(&config).await?;
        Ok(Self::from_runtime(config, runtime))
    }

    pub fn from_runtime(config: AppConfig, runtime: CascadeRuntime) -> Self {
        Self {
            orchestrator: runtime.orchestrator(),
            dead_letters: runtime.dead_letters(),
            analytics: runtime.analytics(),
            status_changes: runtime.status_changes(),
            config,
            runtime,
        }
    }
}
