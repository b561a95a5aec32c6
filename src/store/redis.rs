//! Redis store backend.
//!
//! Holds a [`ConnectionManager`] — the process-wide multiplexed client that
//! reconnects on its own and is cheap to clone, so every engine in the
//! process can share one connection. Every operation is bounded by the
//! configured store timeout; an elapsed timeout surfaces as
//! [`StoreError::Timeout`] and is absorbed by the
//! [`StateStore`](super::StateStore) façade like any other fault.
//!
//! The two conditional primitives map to:
//!
//! - `set_if_absent` → `SET key value NX PX <ms>`, whose reply distinguishes
//!   a winning write from a lost race in a single round trip;
//! - `compare_and_delete` → a server-side Lua script that GETs, compares and
//!   DELs atomically, so releasing a lease can never remove a token written
//!   by a later holder.

use std::{fmt, time::Duration};

use redis::{Script, aio::ConnectionManager};

use crate::error::{StoreError, StoreResult};

use super::StoreBackend;

/// Release script: delete the key only while it still holds our token.
const COMPARE_AND_DELETE: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Store backend speaking to a Redis deployment.
///
/// # Examples
///
/// ```rust,no_run
/// use std::time::Duration;
///
/// use shared_breaker::store::RedisBackend;
///
/// # async fn example() -> shared_breaker::error::StoreResult<()> {
/// let backend = RedisBackend::connect("redis://127.0.0.1:6379", Duration::from_secs(5)).await?;
/// # let _ = backend;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedisBackend {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisBackend {
    /// Connects to `url` and wraps the connection in a reconnecting manager.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when the URL is invalid or the initial
    /// connection cannot be established.
    pub async fn connect(url: &str, op_timeout: Duration) -> StoreResult<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client).await?;
        Ok(Self::from_manager(manager, op_timeout))
    }

    /// Wraps an existing manager, typically the one shared by every engine
    /// in the process.
    #[must_use]
    pub fn from_manager(manager: ConnectionManager, op_timeout: Duration) -> Self {
        Self { manager, op_timeout }
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, redis::RedisError>> + Send,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.op_timeout, op).await {
            Ok(result) => result.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.op_timeout)),
        }
    }
}

/// Clamps a TTL to the integer-millisecond range Redis accepts, never below
/// one millisecond.
fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

impl StoreBackend for RedisBackend {
    fn get<'a>(&'a self, key: &'a str) -> impl Future<Output = StoreResult<Option<String>>> + Send + 'a {
        async move {
            let mut conn = self.manager.clone();
            self.bounded(async move {
                redis::cmd("GET").arg(key).query_async::<Option<String>>(&mut conn).await
            })
            .await
        }
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'a {
        async move {
            let mut conn = self.manager.clone();
            let px = ttl_millis(ttl);
            self.bounded(async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(px)
                    .query_async::<()>(&mut conn)
                    .await
            })
            .await
        }
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'a {
        async move {
            let mut conn = self.manager.clone();
            let px = ttl_millis(ttl);
            // SET .. NX replies OK on a winning write and nil otherwise.
            let reply = self
                .bounded(async move {
                    redis::cmd("SET")
                        .arg(key)
                        .arg(value)
                        .arg("NX")
                        .arg("PX")
                        .arg(px)
                        .query_async::<Option<String>>(&mut conn)
                        .await
                })
                .await?;
            Ok(reply.is_some())
        }
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'a {
        async move {
            let mut conn = self.manager.clone();
            let deleted = self
                .bounded(async move {
                    Script::new(COMPARE_AND_DELETE)
                        .key(key)
                        .arg(expected)
                        .invoke_async::<i64>(&mut conn)
                        .await
                })
                .await?;
            Ok(deleted == 1)
        }
    }

    fn delete<'a>(&'a self, key: &'a str) -> impl Future<Output = StoreResult<()>> + Send + 'a {
        async move {
            let mut conn = self.manager.clone();
            self.bounded(async move {
                redis::cmd("DEL").arg(key).query_async::<i64>(&mut conn).await
            })
            .await?;
            Ok(())
        }
    }
}

impl fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisBackend").field("op_timeout", &self.op_timeout).finish_non_exhaustive()
    }
}
