pub mod analytics;
pub mod circuit_breaker;
pub mod dlq;
pub mod error;
pub mod hierarchy;
pub mod impact;
pub mod jobs;
pub mod lock;
pub mod orchestrator;
pub mod policy;
pub mod ports;
pub mod processors;
pub mod queue;
pub mod settings;
pub mod status;
pub mod status_change;
pub mod store;
pub mod util;
pub mod validation;

pub type DomainResult<T> = Result<T, error::DomainError>;
