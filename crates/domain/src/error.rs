use serde::Serialize;
use thiserror::Error;

use crate::ports::jobs::JobQueueError;
use crate::ports::lock::LockError;
use crate::ports::store::StoreError;

#[derive(Clone, Copy, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    InvalidTransition,
    ParentConstraint,
    ChildConstraint,
    ActionNotAllowed,
}

/// A rejected status change. Never retried.
#[derive(Clone, Debug, Error, Serialize, PartialEq, Eq)]
#[error("{message}")]
pub struct PolicyViolation {
    pub kind: ViolationKind,
    pub message: String,
}

impl PolicyViolation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("{0}")]
    Policy(#[from] PolicyViolation),
    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transient infrastructure failure: {0}")]
    Transient(String),
    #[error("orphaned cascade: {0}")]
    OrphanedCascade(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Queue(#[from] JobQueueError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl DomainError {
    /// Failures that abort a whole batch: retrying cannot fix them.
    pub fn is_critical(&self) -> bool {
        match self {
            Self::UnknownEntityType(_) | Self::NotFound(_) => true,
            Self::Policy(violation) => violation.kind == ViolationKind::InvalidTransition,
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transient(_) => true,
            Self::Store(StoreError::Unavailable(_)) => true,
            Self::Queue(JobQueueError::Unavailable(_)) => true,
            Self::Lock(err) => err.is_transient(),
            _ => false,
        }
    }
}
