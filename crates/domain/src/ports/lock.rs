use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum LockError {
    #[error("lock backend connection failed: {0}")]
    Connection(String),
    #[error("lock backend timed out")]
    Timeout,
    #[error("lock backend circuit open")]
    CircuitOpen,
    #[error("invalid lock key: {0}")]
    InvalidKey(String),
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl LockError {
    /// Errors that send the caller to the database fallback.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Timeout | Self::CircuitOpen
        )
    }
}

/// Primary lock substrate: a key/value store with conditional set and
/// compare-and-delete.
pub trait LockBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, LockError>>;

    /// Deletes `key` only when its stored value equals `token`.
    fn compare_and_delete(&self, key: &str, token: &str)
    -> BoxFuture<'_, Result<bool, LockError>>;
}
