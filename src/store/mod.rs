//! The store seam: raw key-value backends and the total state façade.
//!
//! Two layers live here, deliberately separated:
//!
//! - [`StoreBackend`]: the five raw operations the shared-state protocol
//!   needs from a key-value store. Every method can fail. Implementations:
//!   [`RedisBackend`](redis::RedisBackend) for production,
//!   [`MemoryBackend`](memory::MemoryBackend) for tests and local runs.
//! - [`StateStore`]: the typed, *total* façade over one circuit's keys.
//!   Nothing above this layer ever sees a store fault: reads degrade to
//!   "absent", writes become best-effort, and lease acquisition fails open so
//!   a store outage cannot wedge transitions.
//!
//! # Key layout
//!
//! Peers of the same deployment must agree on this layout bit for bit:
//!
//! ```text
//! <prefix>:<circuitId>:state      → "Closed" | "Open" | "HalfOpen" | "Isolated"
//! <prefix>:<circuitId>:metrics    → "<success>:<failure>:<windowStartMs>"
//! <prefix>:<circuitId>:blocked    → epoch milliseconds as a string
//! <prefix>:<circuitId>:lock       → random lease token
//! ```
//!
//! Every key carries a time-to-live: state 24 hours, metrics the sampling
//! duration plus a one-minute margin, blocked until the blocked-until instant
//! plus the margin, lock the lease time-to-live. A circuit is created
//! implicitly by its first write and destroyed only by key expiry.

use std::{str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{error::StoreResult, metrics::HealthMetrics, state::CircuitState};

pub mod memory;
pub mod redis;

pub use self::memory::MemoryBackend;
pub use self::redis::RedisBackend;

/// TTL on the state key. Long enough that an idle-but-configured circuit
/// survives a weekend; short enough that abandoned circuits disappear.
const STATE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Margin added to the metrics and blocked-until TTLs so a key outlives the
/// instant it describes.
const TTL_MARGIN: Duration = Duration::from_secs(60);

/// Raw operations required from a key-value store.
///
/// The two conditional operations carry the protocol's correctness:
///
/// - `set_if_absent` must be a single conditional write ("set only if
///   absent, with TTL") that reports whether it won. It backs lease
///   acquisition.
/// - `compare_and_delete` must compare and delete in one atomic round trip
///   (a server-side script or equivalent), so a lease whose TTL elapsed and
///   was re-acquired by another holder cannot be stolen on release.
///
/// Implementations must be cheaply shareable across engines; the process
/// typically holds one pooled client.
pub trait StoreBackend: Send + Sync {
    /// Reads a key. `Ok(None)` means the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) when the store is
    /// unreachable or the operation times out.
    fn get<'a>(&'a self, key: &'a str) -> impl Future<Output = StoreResult<Option<String>>> + Send + 'a;

    /// Writes a key with a time-to-live, unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) when the store is
    /// unreachable or the operation times out.
    fn set<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<()>> + Send + 'a;

    /// Writes a key with a time-to-live only if it does not exist, reporting
    /// whether the write happened.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) when the store is
    /// unreachable or the operation times out.
    fn set_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
        ttl: Duration,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'a;

    /// Deletes a key only if it currently holds `expected`, atomically,
    /// reporting whether the delete happened.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) when the store is
    /// unreachable or the operation times out.
    fn compare_and_delete<'a>(
        &'a self,
        key: &'a str,
        expected: &'a str,
    ) -> impl Future<Output = StoreResult<bool>> + Send + 'a;

    /// Deletes a key unconditionally.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`](crate::error::StoreError) when the store is
    /// unreachable or the operation times out.
    fn delete<'a>(&'a self, key: &'a str) -> impl Future<Output = StoreResult<()>> + Send + 'a;
}

/// The four store keys belonging to one circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitKeys {
    /// Key holding the circuit state label.
    pub state: String,
    /// Key holding the encoded health window.
    pub metrics: String,
    /// Key holding the blocked-until instant.
    pub blocked: String,
    /// Key holding the transition lease token.
    pub lock: String,
}

impl CircuitKeys {
    /// Builds the key set for `circuit_id` under `prefix`.
    #[must_use]
    pub fn new(prefix: &str, circuit_id: &str) -> Self {
        Self {
            state: format!("{prefix}:{circuit_id}:state"),
            metrics: format!("{prefix}:{circuit_id}:metrics"),
            blocked: format!("{prefix}:{circuit_id}:blocked"),
            lock: format!("{prefix}:{circuit_id}:lock"),
        }
    }
}

/// Proof of lease acquisition, spent on release.
///
/// The token is minted inside [`StateStore::try_acquire_lease`] and handed
/// back to [`StateStore::release_lease`] by value. It is never stored in
/// shared mutable state, so two overlapping transition attempts in one
/// process can never share a token.
#[derive(Debug, PartialEq, Eq)]
pub struct LeaseToken(String);

impl LeaseToken {
    fn mint() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// The random token value held in the lock key.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Total façade over one circuit's shared state.
///
/// Every method absorbs backend faults: a failed read answers "absent", a
/// failed write is logged and dropped, and a failed lease acquisition *fails
/// open* so a store outage cannot freeze the state machine. The engine layers
/// its degradation policy (the local shadow) on top of these signals.
#[derive(Debug)]
pub struct StateStore<B> {
    backend: B,
    keys: CircuitKeys,
    lease_ttl: Duration,
    metrics_ttl: Duration,
}

impl<B: StoreBackend> StateStore<B> {
    /// Builds the façade for one circuit.
    ///
    /// `sampling_duration` sizes the metrics TTL; `lease_ttl` sizes the lock
    /// TTL. Both come from the engine configuration so peers agree.
    pub fn new(
        backend: B,
        prefix: &str,
        circuit_id: &str,
        sampling_duration: Duration,
        lease_ttl: Duration,
    ) -> Self {
        Self {
            backend,
            keys: CircuitKeys::new(prefix, circuit_id),
            lease_ttl,
            metrics_ttl: sampling_duration.saturating_add(TTL_MARGIN),
        }
    }

    /// The key set this façade operates on.
    #[must_use]
    pub fn keys(&self) -> &CircuitKeys {
        &self.keys
    }

    /// Reads the circuit state. Absent, unreadable and malformed all answer
    /// `None`; the caller decides what absence means.
    pub async fn get_state(&self) -> Option<CircuitState> {
        match self.backend.get(&self.keys.state).await {
            Ok(Some(label)) => match CircuitState::from_str(&label) {
                Ok(state) => Some(state),
                Err(err) => {
                    warn!(key = %self.keys.state, %err, "ignoring malformed state value");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key = %self.keys.state, %err, "state read failed; treating as absent");
                None
            }
        }
    }

    /// Writes the circuit state, best-effort.
    pub async fn set_state(&self, state: CircuitState) {
        if let Err(err) = self.backend.set(&self.keys.state, state.as_str(), STATE_TTL).await {
            warn!(key = %self.keys.state, %state, %err, "state write failed; continuing");
        }
    }

    /// Reads the health window. Absent, unreadable and malformed all answer
    /// `None`.
    pub async fn get_metrics(&self) -> Option<HealthMetrics> {
        match self.backend.get(&self.keys.metrics).await {
            Ok(Some(value)) => match HealthMetrics::decode(&value) {
                Ok(metrics) => Some(metrics),
                Err(err) => {
                    warn!(key = %self.keys.metrics, %err, "ignoring malformed metrics value");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key = %self.keys.metrics, %err, "metrics read failed; treating as absent");
                None
            }
        }
    }

    /// Writes the health window, best-effort.
    pub async fn set_metrics(&self, metrics: &HealthMetrics) {
        let encoded = metrics.encode();
        if let Err(err) = self.backend.set(&self.keys.metrics, &encoded, self.metrics_ttl).await {
            warn!(key = %self.keys.metrics, %err, "metrics write failed; continuing");
        }
    }

    /// Reads the blocked-until instant. Absent, unreadable and malformed all
    /// answer `None`.
    pub async fn get_blocked_until(&self) -> Option<DateTime<Utc>> {
        match self.backend.get(&self.keys.blocked).await {
            Ok(Some(value)) => {
                let parsed = value.parse::<i64>().ok().and_then(DateTime::from_timestamp_millis);
                if parsed.is_none() {
                    warn!(key = %self.keys.blocked, value = %value, "ignoring malformed blocked-until value");
                }
                parsed
            }
            Ok(None) => None,
            Err(err) => {
                warn!(key = %self.keys.blocked, %err, "blocked-until read failed; treating as absent");
                None
            }
        }
    }

    /// Writes the blocked-until instant, best-effort.
    ///
    /// The key's TTL is `blocked_until - now` plus a margin; an instant at or
    /// before `now` is skipped entirely, since the key would describe a block
    /// that has already lapsed.
    pub async fn set_blocked_until(&self, blocked_until: DateTime<Utc>, now: DateTime<Utc>) {
        let Ok(remaining) = blocked_until.signed_duration_since(now).to_std() else {
            debug!(key = %self.keys.blocked, "blocked-until already lapsed; skipping write");
            return;
        };
        let value = blocked_until.timestamp_millis().to_string();
        let ttl = remaining.saturating_add(TTL_MARGIN);
        if let Err(err) = self.backend.set(&self.keys.blocked, &value, ttl).await {
            warn!(key = %self.keys.blocked, %err, "blocked-until write failed; continuing");
        }
    }

    /// Removes the blocked-until key, best-effort.
    pub async fn clear_blocked_until(&self) {
        if let Err(err) = self.backend.delete(&self.keys.blocked).await {
            warn!(key = %self.keys.blocked, %err, "blocked-until delete failed; continuing");
        }
    }

    /// Attempts to acquire the transition lease.
    ///
    /// `None` means another peer holds it and the transition should be
    /// abandoned. A store fault *fails open*: the token is returned as if
    /// acquired, because wedging every transition on a store outage is worse
    /// than briefly losing mutual exclusion.
    pub async fn try_acquire_lease(&self) -> Option<LeaseToken> {
        let token = LeaseToken::mint();
        match self.backend.set_if_absent(&self.keys.lock, token.as_str(), self.lease_ttl).await {
            Ok(true) => Some(token),
            Ok(false) => None,
            Err(err) => {
                warn!(key = %self.keys.lock, %err, "lease acquisition failed; failing open");
                Some(token)
            }
        }
    }

    /// Releases a lease, spending the token.
    ///
    /// The release is a compare-and-delete: if the lock key no longer holds
    /// this token (TTL elapsed and another peer re-acquired), the release is
    /// a no-op and the other holder keeps its lease.
    pub async fn release_lease(&self, token: LeaseToken) {
        match self.backend.compare_and_delete(&self.keys.lock, token.as_str()).await {
            Ok(true) => debug!(key = %self.keys.lock, "lease released"),
            Ok(false) => {
                debug!(key = %self.keys.lock, "lease expired or re-acquired; release is a no-op");
            }
            Err(err) => warn!(key = %self.keys.lock, %err, "lease release failed; ttl will expire it"),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, reason = "tests assert on values that must exist")]
mod tests {
    use super::{memory::MemoryBackend, *};

    fn store(backend: MemoryBackend) -> StateStore<MemoryBackend> {
        StateStore::new(backend, "cb:test", "orders", Duration::from_secs(10), Duration::from_secs(5))
    }

    #[test]
    fn test_key_layout() {
        let keys = CircuitKeys::new("cb:distributed", "payments");
        assert_eq!(keys.state, "cb:distributed:payments:state");
        assert_eq!(keys.metrics, "cb:distributed:payments:metrics");
        assert_eq!(keys.blocked, "cb:distributed:payments:blocked");
        assert_eq!(keys.lock, "cb:distributed:payments:lock");
    }

    #[test]
    fn test_lease_tokens_are_unique() {
        assert_ne!(LeaseToken::mint(), LeaseToken::mint());
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let store = store(MemoryBackend::new());
        assert_eq!(store.get_state().await, None);

        store.set_state(CircuitState::Open).await;
        assert_eq!(store.get_state().await, Some(CircuitState::Open));
    }

    #[tokio::test]
    async fn test_malformed_state_reads_as_absent() {
        let backend = MemoryBackend::new();
        let store = store(backend.clone());
        backend.set("cb:test:orders:state", "Opened", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get_state().await, None);
    }

    #[tokio::test]
    async fn test_reads_degrade_to_absent_when_offline() {
        let backend = MemoryBackend::new();
        let store = store(backend.clone());
        store.set_state(CircuitState::Open).await;

        backend.set_offline(true);
        assert_eq!(store.get_state().await, None);
        assert_eq!(store.get_metrics().await, None);
        assert_eq!(store.get_blocked_until().await, None);
    }

    #[tokio::test]
    async fn test_metrics_round_trip() {
        let store = store(MemoryBackend::new());
        let mut metrics = HealthMetrics::fresh(Utc::now());
        metrics.record_failure();

        store.set_metrics(&metrics).await;
        assert_eq!(store.get_metrics().await, Some(metrics));
    }

    #[tokio::test]
    async fn test_malformed_metrics_read_as_absent() {
        let backend = MemoryBackend::new();
        let store = store(backend.clone());
        backend.set("cb:test:orders:metrics", "not-metrics", Duration::from_secs(60)).await.unwrap();

        assert_eq!(store.get_metrics().await, None);
    }

    #[tokio::test]
    async fn test_blocked_until_round_trip() {
        let store = store(MemoryBackend::new());
        let now = Utc::now();
        let blocked_until = DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap()
            + chrono::TimeDelta::seconds(30);

        store.set_blocked_until(blocked_until, now).await;
        assert_eq!(store.get_blocked_until().await, Some(blocked_until));
    }

    #[tokio::test]
    async fn test_lapsed_blocked_until_is_not_written() {
        let store = store(MemoryBackend::new());
        let now = Utc::now();

        store.set_blocked_until(now - chrono::TimeDelta::seconds(1), now).await;
        assert_eq!(store.get_blocked_until().await, None);
    }

    #[tokio::test]
    async fn test_lease_mutual_exclusion() {
        let backend = MemoryBackend::new();
        let store_a = store(backend.clone());
        let store_b = store(backend);

        let token = store_a.try_acquire_lease().await.unwrap();
        assert!(store_b.try_acquire_lease().await.is_none());

        store_a.release_lease(token).await;
        assert!(store_b.try_acquire_lease().await.is_some());
    }

    #[tokio::test]
    async fn test_lease_fails_open_when_store_is_down() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let store = store(backend);

        assert!(store.try_acquire_lease().await.is_some());
    }

    #[tokio::test]
    async fn test_release_does_not_steal_a_reacquired_lease() {
        let backend = MemoryBackend::new();
        let store = StateStore::new(
            backend.clone(),
            "cb:test",
            "orders",
            Duration::from_secs(10),
            Duration::from_millis(20),
        );

        let stale = store.try_acquire_lease().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        // TTL elapsed; another peer takes the lease.
        let fresh = store.try_acquire_lease().await.unwrap();

        // The stale holder's release must not remove the new lease.
        store.release_lease(stale).await;
        let held = backend.get("cb:test:orders:lock").await.unwrap();
        assert_eq!(held.as_deref(), Some(fresh.as_str()));
    }
}
