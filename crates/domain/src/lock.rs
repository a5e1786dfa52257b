use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::DomainResult;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot};
use crate::ports::BoxFuture;
use crate::ports::lock::{LockBackend, LockError};
use crate::ports::store::HierarchyTx;
use crate::util::{advisory_lock_key, uuid_v7_without_dashes};

pub const LOCK_ACQUIRE_TOTAL: &str = "syllabus_lock_acquire_total";
pub const LOCK_FALLBACK_TOTAL: &str = "syllabus_lock_fallback_total";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockSettings {
    pub ttl: Duration,
    pub retry_attempts: u32,
    pub retry_delay: Duration,
    pub call_timeout: Duration,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_millis(5_000),
            retry_attempts: 5,
            retry_delay: Duration::from_millis(100),
            call_timeout: Duration::from_millis(1_000),
        }
    }
}

/// Proof of lock ownership.
///
/// `Transactional` locks come from the database fallback. They are bound to
/// the transaction passed to `acquire` and end with it; `release` cannot end
/// them early.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockToken {
    Distributed(String),
    Transactional,
}

impl LockToken {
    pub fn backend(&self) -> &'static str {
        match self {
            Self::Distributed(_) => "distributed",
            Self::Transactional => "database",
        }
    }
}

pub fn entity_lock_key(entity_type: impl std::fmt::Display, entity_id: &str) -> String {
    format!("{entity_type}:{entity_id}")
}

/// Per-resource mutual exclusion over a key/value backend, guarded by a
/// circuit breaker and falling back to transaction-scoped advisory locks.
pub struct LockProvider {
    backend: Arc<dyn LockBackend>,
    breaker: Mutex<CircuitBreaker>,
    settings: LockSettings,
}

impl LockProvider {
    pub fn new(
        backend: Arc<dyn LockBackend>,
        settings: LockSettings,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            backend,
            breaker: Mutex::new(CircuitBreaker::new(breaker)),
            settings,
        }
    }

    pub fn settings(&self) -> &LockSettings {
        &self.settings
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        let guard = self.breaker.lock().expect("circuit breaker lock");
        guard.snapshot(Instant::now())
    }

    /// Single attempt. `Ok(None)` means somebody else holds the lock.
    pub async fn acquire(
        &self,
        tx: &mut dyn HierarchyTx,
        key: &str,
        ttl: Duration,
    ) -> DomainResult<Option<LockToken>> {
        if key.trim().is_empty() {
            return Err(LockError::InvalidKey(key.to_string()).into());
        }

        let admitted = {
            let mut guard = self.breaker.lock().expect("circuit breaker lock");
            guard.admit(Instant::now())
        };
        if !admitted {
            return self.acquire_fallback(tx, key, LockError::CircuitOpen).await;
        }

        let token = uuid_v7_without_dashes();
        let call = self.backend.set_if_absent(key, &token, ttl);
        let outcome = match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LockError::Timeout),
        };

        match outcome {
            Ok(acquired) => {
                self.record_success();
                let result = if acquired { "acquired" } else { "contended" };
                metrics::counter!(LOCK_ACQUIRE_TOTAL, "backend" => self.backend.name(), "result" => result)
                    .increment(1);
                Ok(acquired.then_some(LockToken::Distributed(token)))
            }
            Err(err) if err.is_transient() => {
                self.record_failure();
                self.acquire_fallback(tx, key, err).await
            }
            Err(err) => {
                metrics::counter!(LOCK_ACQUIRE_TOTAL, "backend" => self.backend.name(), "result" => "error")
                    .increment(1);
                Err(err.into())
            }
        }
    }

    /// Retries contention with linear backoff. `Ok(None)` after
    /// `max_attempts` is "could not acquire", not an error.
    pub async fn acquire_with_retry(
        &self,
        tx: &mut dyn HierarchyTx,
        key: &str,
        ttl: Duration,
        max_attempts: u32,
    ) -> DomainResult<Option<LockToken>> {
        let max_attempts = max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if let Some(token) = self.acquire(tx, key, ttl).await? {
                return Ok(Some(token));
            }
            if attempt < max_attempts {
                tokio::time::sleep(self.settings.retry_delay * attempt).await;
            }
        }
        tracing::warn!(key, attempts = max_attempts, "lock not acquired");
        Ok(None)
    }

    /// Lock with the configured ttl and attempt budget.
    pub async fn acquire_default(
        &self,
        tx: &mut dyn HierarchyTx,
        key: &str,
    ) -> DomainResult<Option<LockToken>> {
        self.acquire_with_retry(tx, key, self.settings.ttl, self.settings.retry_attempts)
            .await
    }

    /// `false` when the stored token no longer matches; the lock expired and
    /// may belong to someone else now. Transactional tokens always report
    /// `true` since their transaction owns the release.
    pub async fn release(&self, key: &str, token: &LockToken) -> Result<bool, LockError> {
        let LockToken::Distributed(token) = token else {
            return Ok(true);
        };
        let call = self.backend.compare_and_delete(key, token);
        let outcome = match tokio::time::timeout(self.settings.call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(LockError::Timeout),
        };
        match outcome {
            Ok(released) => {
                if !released {
                    tracing::debug!(key, "lock already expired or taken over");
                }
                Ok(released)
            }
            Err(err) => {
                if err.is_transient() {
                    self.record_failure();
                }
                Err(err)
            }
        }
    }

    /// Release that only logs failures; the ttl bounds a leaked lock.
    pub async fn release_quietly(&self, key: &str, token: &LockToken) {
        if let Err(err) = self.release(key, token).await {
            tracing::warn!(key, error = %err, "lock release failed");
        }
    }

    async fn acquire_fallback(
        &self,
        tx: &mut dyn HierarchyTx,
        key: &str,
        cause: LockError,
    ) -> DomainResult<Option<LockToken>> {
        metrics::counter!(LOCK_FALLBACK_TOTAL).increment(1);
        tracing::warn!(key, cause = %cause, "using database advisory lock");
        let acquired = tx.try_advisory_lock(advisory_lock_key(key)).await?;
        let result = if acquired { "acquired" } else { "contended" };
        metrics::counter!(LOCK_ACQUIRE_TOTAL, "backend" => "database", "result" => result)
            .increment(1);
        Ok(acquired.then_some(LockToken::Transactional))
    }

    fn record_success(&self) {
        let mut guard = self.breaker.lock().expect("circuit breaker lock");
        guard.on_success();
    }

    fn record_failure(&self) {
        let mut guard = self.breaker.lock().expect("circuit breaker lock");
        guard.on_failure(Instant::now());
    }
}

#[derive(Clone, Debug)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

/// Process-local lock backend with ttl expiry.
#[derive(Clone, Default)]
pub struct InMemoryLockBackend {
    inner: Arc<Mutex<HashMap<String, HeldLock>>>,
}

impl InMemoryLockBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockBackend for InMemoryLockBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, LockError>> {
        let key = key.to_string();
        let token = token.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("lock backend lock");
            let now = Instant::now();
            if let Some(held) = guard.get(&key)
                && held.expires_at > now
            {
                return Ok(false);
            }
            guard.insert(
                key,
                HeldLock {
                    token,
                    expires_at: now + ttl,
                },
            );
            Ok(true)
        })
    }

    fn compare_and_delete(
        &self,
        key: &str,
        token: &str,
    ) -> BoxFuture<'_, Result<bool, LockError>> {
        let key = key.to_string();
        let token = token.to_string();
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut guard = inner.lock().expect("lock backend lock");
            let matches = guard
                .get(&key)
                .is_some_and(|held| held.token == token && held.expires_at > Instant::now());
            if matches {
                guard.remove(&key);
            }
            Ok(matches)
        })
    }
}
