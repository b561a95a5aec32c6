//! In-memory store backend.
//!
//! Backs tests and single-process development runs with the same conditional
//! write and compare-and-delete semantics the Redis backend provides. Clones
//! share one underlying map, so several engines pointed at clones of one
//! `MemoryBackend` behave like peers sharing a store — which is exactly how
//! the cross-peer scenarios are tested.
//!
//! The backend can also be taken offline, making every operation fail the
//! way an unreachable store would. This drives the degraded-mode paths
//! (absent reads, best-effort writes, fail-open leases) without a network.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::error::{StoreError, StoreResult};

use super::StoreBackend;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|deadline| now < deadline)
    }
}

#[derive(Debug, Default)]
struct Shared {
    map: Mutex<HashMap<String, Entry>>,
    offline: AtomicBool,
}

/// Key-value backend held entirely in process memory.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
///
/// use shared_breaker::store::{MemoryBackend, StoreBackend};
///
/// # async fn example() -> shared_breaker::error::StoreResult<()> {
/// let backend = MemoryBackend::new();
/// backend.set("k", "v", Duration::from_secs(60)).await?;
/// assert_eq!(backend.get("k").await?.as_deref(), Some("v"));
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    /// An empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent operation fail (or succeed again) as if the
    /// store link went down (or came back).
    pub fn set_offline(&self, offline: bool) {
        self.shared.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> StoreResult<()> {
        if self.shared.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory backend is offline".to_owned()));
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.shared.map.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read_live(map: &mut HashMap<String, Entry>, key: &str, now: Instant) -> Option<String> {
        match map.get(key) {
            Some(entry) if entry.live(now) => Some(entry.value.clone()),
            Some(_) => {
                map.remove(key);
                None
            }
            None => None,
        }
    }

    fn entry(value: &str, ttl: Duration, now: Instant) -> Entry {
        Entry { value: value.to_owned(), expires_at: now.checked_add(ttl) }
    }
}

impl StoreBackend for MemoryBackend {
    fn get<'a>(&'a self, key: &'a str) -> impl Future<Output = StoreResult<Option<String>>> + Send + 'a {
        async move {
            self.check_online()?;
            let now = Instant::now();
            Ok(Self::read_live(&mut self.lock(), key, now))
        }
    }

    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'a {
        async move {
            self.check_online()?;
            let now = Instant::now();
            self.lock().insert(key.to_owned(), Self::entry(value, ttl, now));
            Ok(())
        }
    }

    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'a {
        async move {
            self.check_online()?;
            let now = Instant::now();
            let mut map = self.lock();
            if Self::read_live(&mut map, key, now).is_some() {
                return Ok(false);
            }
            map.insert(key.to_owned(), Self::entry(value, ttl, now));
            Ok(true)
        }
    }

    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'a {
        async move {
            self.check_online()?;
            let now = Instant::now();
            let mut map = self.lock();
            if Self::read_live(&mut map, key, now).as_deref() == Some(expected) {
                map.remove(key);
                return Ok(true);
            }
            Ok(false)
        }
    }

    fn delete<'a>(&'a self, key: &'a str) -> impl Future<Output = StoreResult<()>> + Send + 'a {
        async move {
            self.check_online()?;
            self.lock().remove(key);
            Ok(())
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests assert on values that must exist")]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(60);

    #[tokio::test]
    async fn test_get_absent_key() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", TTL).await.unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_values_expire() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", Duration::from_millis(10)).await.unwrap();

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_set_if_absent_wins_only_once() {
        let backend = MemoryBackend::new();
        assert!(backend.set_if_absent("k", "first", TTL).await.unwrap());
        assert!(!backend.set_if_absent("k", "second", TTL).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_set_if_absent_succeeds_after_expiry() {
        let backend = MemoryBackend::new();
        assert!(backend.set_if_absent("k", "first", Duration::from_millis(10)).await.unwrap());

        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(backend.set_if_absent("k", "second", TTL).await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_compare_and_delete_requires_matching_value() {
        let backend = MemoryBackend::new();
        backend.set("k", "mine", TTL).await.unwrap();

        assert!(!backend.compare_and_delete("k", "theirs").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("mine"));

        assert!(backend.compare_and_delete("k", "mine").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_compare_and_delete_on_absent_key() {
        let backend = MemoryBackend::new();
        assert!(!backend.compare_and_delete("missing", "anything").await.unwrap());
    }

    #[tokio::test]
    async fn test_clones_share_state() {
        let backend = MemoryBackend::new();
        let peer = backend.clone();

        backend.set("k", "v", TTL).await.unwrap();
        assert_eq!(peer.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_offline_fails_every_operation() {
        let backend = MemoryBackend::new();
        backend.set("k", "v", TTL).await.unwrap();
        backend.set_offline(true);

        assert!(backend.get("k").await.is_err());
        assert!(backend.set("k", "v2", TTL).await.is_err());
        assert!(backend.set_if_absent("other", "v", TTL).await.is_err());
        assert!(backend.compare_and_delete("k", "v").await.is_err());
        assert!(backend.delete("k").await.is_err());

        backend.set_offline(false);
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
    }
}
