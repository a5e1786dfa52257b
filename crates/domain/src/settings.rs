use crate::circuit_breaker::CircuitBreakerConfig;
use crate::jobs::JobOptions;
use crate::lock::LockSettings;
use crate::queue::DEFAULT_ENQUEUE_CHUNK_SIZE;

/// Tunables shared by the cascade pipeline, resolved once at startup.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CascadeSettings {
    pub job: JobOptions,
    pub lock: LockSettings,
    pub breaker: CircuitBreakerConfig,
    pub enqueue_chunk_size: usize,
}

impl Default for CascadeSettings {
    fn default() -> Self {
        Self {
            job: JobOptions::default(),
            lock: LockSettings::default(),
            breaker: CircuitBreakerConfig::default(),
            enqueue_chunk_size: DEFAULT_ENQUEUE_CHUNK_SIZE,
        }
    }
}
