use std::time::Duration;

use redis::aio::ConnectionManager;
use syllabus_domain::ports::BoxFuture;
use syllabus_domain::ports::lock::{LockBackend, LockError};

const RELEASE_SCRIPT: &str = r#"
    if redis.call('GET', KEYS[1]) == ARGV[1] then
        return redis.call('DEL', KEYS[1])
    end
    return 0
"#;

fn lock_error(err: redis::RedisError) -> LockError {
    if err.is_timeout() {
        LockError::Timeout
    } else if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() {
        LockError::Connection(err.to_string())
    } else {
        LockError::Backend(err.to_string())
    }
}

/// `SET NX PX` locks with a token-checked delete.
#[derive(Clone)]
pub struct RedisLockBackend {
    manager: ConnectionManager,
    prefix: String,
    release: redis::Script,
}

impl RedisLockBackend {
    pub fn new(manager: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            manager,
            prefix: prefix.into(),
            release: redis::Script::new(RELEASE_SCRIPT),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }
}

impl LockBackend for RedisLockBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    fn set_if_absent(
        &self,
        key: &str,
        token: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<bool, LockError>> {
        let key = self.key(key);
        let token = token.to_string();
        let ttl_ms = ttl.as_millis().max(1) as u64;
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let reply: Option<String> = redis::cmd("SET")
                .arg(&key)
                .arg(&token)
                .arg("NX")
                .arg("PX")
                .arg(ttl_ms)
                .query_async(&mut conn)
                .await
                .map_err(lock_error)?;
            Ok(reply.is_some())
        })
    }

    fn compare_and_delete(
        &self,
        key: &str,
        token: &str,
    ) -> BoxFuture<'_, Result<bool, LockError>> {
        let key = self.key(key);
        let token = token.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let deleted: i64 = self
                .release
                .key(&key)
                .arg(&token)
                .invoke_async(&mut conn)
                .await
                .map_err(lock_error)?;
            Ok(deleted == 1)
        })
    }
}
