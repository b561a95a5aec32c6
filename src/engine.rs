//! The circuit state machine.
//!
//! [`CircuitEngine`] owns one circuit's behavior: it dispatches guarded calls
//! on the shared state, maintains the health window, and performs every state
//! transition under the store's lease so that at most one peer transitions at
//! a time.
//!
//! # Per-call flow
//!
//! ```text
//! execute(f)
//!   ├─ read state (store, then shadow, else Closed)
//!   ├─ Open      → blocked-until elapsed? attempt Open → HalfOpen : fail fast
//!   ├─ Isolated  → fail fast
//!   ├─ Closed / HalfOpen → run f
//!   ├─ f ok      → record success; HalfOpen? attempt HalfOpen → Closed
//!   └─ f err     → record failure; HalfOpen? attempt HalfOpen → Open
//!                                  Closed + trip predicate? attempt Closed → Open
//! ```
//!
//! # Transitions and the lease
//!
//! Every automatic transition acquires the lease, re-reads the authoritative
//! state, and aborts silently if another peer got there first. The writes, the
//! shadow mirror and the state-change callback all happen inside the lease
//! scope; the lease is released on every path out, including a panicking
//! callback.
//!
//! # Probes
//!
//! The half-open probe is not gated behind a second lease: if several peers
//! observe `HalfOpen` at once, several probes run. Each success drives toward
//! Closed, each failure drives back to Open, and both follow-up transitions
//! are idempotent under the lease — a small recovery-load amplification in
//! exchange for one less serialization point per call.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::CircuitBreakerConfig,
    error::{CircuitError, ConfigError},
    metrics::HealthMetrics,
    shadow::LocalShadow,
    state::{CircuitState, StateChange},
    store::{StateStore, StoreBackend},
};

/// Handler invoked on a successful state transition.
///
/// Receives the [`StateChange`] record by reference, inside the lease scope.
/// A panicking handler is caught and logged; it never influences the
/// transition or the caller's outcome.
pub type StateChangeHook = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Per-transition callbacks, keyed by the state being entered.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
///
/// use shared_breaker::engine::Callbacks;
///
/// let callbacks = Callbacks {
///     on_open: Some(Arc::new(|change: &shared_breaker::StateChange| {
///         eprintln!("circuit {} tripped: {:?}", change.circuit_id, change.trigger);
///     })),
///     ..Callbacks::default()
/// };
/// # let _ = callbacks;
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Invoked when the circuit enters Open.
    pub on_open: Option<StateChangeHook>,
    /// Invoked when the circuit enters Closed.
    pub on_close: Option<StateChangeHook>,
    /// Invoked when the circuit enters `HalfOpen`.
    pub on_half_open: Option<StateChangeHook>,
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.as_ref().map(|_| "..."))
            .field("on_close", &self.on_close.as_ref().map(|_| "..."))
            .field("on_half_open", &self.on_half_open.as_ref().map(|_| "..."))
            .finish()
    }
}

/// Circuit breaker whose state is shared through a store.
///
/// Every process constructing an engine with the same `circuit_id`, key
/// prefix and store participates in one logical circuit: when any of them
/// trips it, the rest fail fast on their next call.
///
/// # Examples
///
/// ```
/// use shared_breaker::{
///     config::CircuitBreakerConfig,
///     engine::CircuitEngine,
///     error::CircuitError,
///     store::MemoryBackend,
/// };
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let engine = CircuitEngine::new(CircuitBreakerConfig::new("inventory"), MemoryBackend::new())?;
///
/// match engine.execute(|| async { Ok::<_, String>("stock level") }).await {
///     Ok(value) => println!("got {value}"),
///     Err(CircuitError::Open { retry_after }) => println!("open; retry in {retry_after:?}"),
///     Err(CircuitError::Isolated) => println!("isolated by an operator"),
///     Err(CircuitError::Inner(e)) => println!("call failed: {e}"),
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct CircuitEngine<B: StoreBackend> {
    config: CircuitBreakerConfig,
    store: StateStore<B>,
    shadow: LocalShadow,
    callbacks: Callbacks,
}

impl<B: StoreBackend> CircuitEngine<B> {
    /// Builds an engine with no state-change callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration fails validation.
    pub fn new(config: CircuitBreakerConfig, backend: B) -> Result<Self, ConfigError> {
        Self::with_callbacks(config, backend, Callbacks::default())
    }

    /// Builds an engine with state-change callbacks.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configuration fails validation.
    pub fn with_callbacks(
        config: CircuitBreakerConfig,
        backend: B,
        callbacks: Callbacks,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let store = StateStore::new(
            backend,
            &config.key_prefix,
            &config.circuit_id,
            config.sampling_duration(),
            config.lease_ttl(),
        );
        let shadow = LocalShadow::new(config.local_shadow_enabled, Utc::now());
        Ok(Self { config, store, shadow, callbacks })
    }

    /// The circuit identifier this engine participates in.
    #[must_use]
    pub fn circuit_id(&self) -> &str {
        &self.config.circuit_id
    }

    /// Runs `operation` under the circuit.
    ///
    /// Returns the operation's own result or error; fails fast with
    /// [`CircuitError::Open`] while the circuit is open and with
    /// [`CircuitError::Isolated`] while it is isolated. A failing operation
    /// is recorded against the shared health window before its error is
    /// re-raised, and may trip the circuit for every peer.
    ///
    /// # Errors
    ///
    /// - [`CircuitError::Open`] — the circuit is open; `operation` was not
    ///   invoked. Carries the remaining block time.
    /// - [`CircuitError::Isolated`] — the circuit is operator-isolated;
    ///   `operation` was not invoked.
    /// - [`CircuitError::Inner`] — `operation` ran and failed.
    #[instrument(skip(self, operation), fields(circuit_id = %self.config.circuit_id), level = "debug")]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let observed = match self.read_state().await {
            CircuitState::Open => self.dispatch_open().await?,
            CircuitState::Isolated => return Err(CircuitError::Isolated),
            state @ (CircuitState::Closed | CircuitState::HalfOpen) => state,
        };

        match operation().await {
            Ok(value) => {
                self.record(HealthMetrics::record_success).await;
                if observed == CircuitState::HalfOpen {
                    self.try_transition(CircuitState::HalfOpen, CircuitState::Closed, None).await;
                }
                Ok(value)
            }
            Err(error) => {
                let metrics = self.record(HealthMetrics::record_failure).await;
                if observed == CircuitState::HalfOpen {
                    self.try_transition(
                        CircuitState::HalfOpen,
                        CircuitState::Open,
                        Some(error.to_string()),
                    )
                    .await;
                } else if self.should_trip(&metrics) {
                    self.try_transition(
                        CircuitState::Closed,
                        CircuitState::Open,
                        Some(error.to_string()),
                    )
                    .await;
                }
                Err(CircuitError::Inner(error))
            }
        }
    }

    /// Forces the circuit into Isolated.
    ///
    /// No failure counting, no lease: the write is a direct overwrite, and
    /// isolation holds until [`reset`](Self::reset). Idempotent.
    #[instrument(skip(self), fields(circuit_id = %self.config.circuit_id), level = "debug")]
    pub async fn isolate(&self) {
        let prior = self.read_state().await;
        if prior == CircuitState::Isolated {
            debug!("already isolated");
            return;
        }
        self.apply_transition(prior, CircuitState::Isolated, None).await;
    }

    /// Forces the circuit into Closed through the standard transition path.
    ///
    /// Acquires the lease, writes Closed, resets the health window and clears
    /// the blocked-until instant. Unlike automatic transitions there is no
    /// precondition on the prior state. Idempotent.
    #[instrument(skip(self), fields(circuit_id = %self.config.circuit_id), level = "debug")]
    pub async fn reset(&self) {
        let Some(lease) = self.store.try_acquire_lease().await else {
            warn!("reset skipped; another peer holds the transition lease");
            return;
        };
        let prior = self.read_state().await;
        if prior == CircuitState::Closed {
            debug!("already closed");
        } else {
            self.apply_transition(prior, CircuitState::Closed, None).await;
        }
        self.store.release_lease(lease).await;
    }

    /// Best-effort view of the current state.
    ///
    /// Reads the store, falls back to the shadow, defaults to Closed. By the
    /// time the caller looks at the value a peer may already have moved on;
    /// use it for dashboards, not for gating calls.
    pub async fn current_state(&self) -> CircuitState {
        self.read_state().await
    }

    /// Consumes the engine.
    ///
    /// Dropping the engine has the same effect; the method exists so callers
    /// that manage engine lifetimes explicitly have a named point of
    /// disposal. The shared store keys are left untouched for the peers.
    pub fn dispose(self) {
        debug!(circuit_id = %self.config.circuit_id, "circuit engine disposed");
    }

    /// Open-state dispatch: either the block has lapsed and a probe may run,
    /// or the call fails fast with the remaining block time.
    async fn dispatch_open<E>(&self) -> Result<CircuitState, CircuitError<E>> {
        let now = Utc::now();
        let Some(blocked_until) = self.read_blocked_until().await else {
            // No usable instant: stay conservative and report a full break.
            return Err(CircuitError::Open { retry_after: Some(self.config.break_duration()) });
        };

        if now < blocked_until {
            let retry_after = blocked_until.signed_duration_since(now).to_std().ok();
            return Err(CircuitError::Open { retry_after });
        }

        if self.try_transition(CircuitState::Open, CircuitState::HalfOpen, None).await {
            return Ok(CircuitState::HalfOpen);
        }

        // Lost the race; another peer is handling the transition. Re-read to
        // see where the circuit landed.
        match self.read_state().await {
            state @ (CircuitState::Closed | CircuitState::HalfOpen) => Ok(state),
            CircuitState::Isolated => Err(CircuitError::Isolated),
            CircuitState::Open => {
                Err(CircuitError::Open { retry_after: Some(Duration::ZERO) })
            }
        }
    }

    /// Reads the authoritative state: store first, shadow when the store
    /// answers absent, Closed when neither answers.
    async fn read_state(&self) -> CircuitState {
        match self.store.get_state().await {
            Some(state) => state,
            None => self.shadow.state().unwrap_or(CircuitState::Closed),
        }
    }

    async fn read_blocked_until(&self) -> Option<DateTime<Utc>> {
        match self.store.get_blocked_until().await {
            Some(instant) => Some(instant),
            None => self.shadow.blocked_until(),
        }
    }

    /// Applies `update` to the current window (replacing a stale or absent
    /// one), writes it back and mirrors it, returning the updated record.
    async fn record(&self, update: impl FnOnce(&mut HealthMetrics)) -> HealthMetrics {
        let now = Utc::now();
        let current = match self.store.get_metrics().await {
            Some(metrics) => Some(metrics),
            None => self.shadow.metrics(),
        };
        let mut metrics = match current {
            Some(metrics) if metrics.is_fresh(now, self.config.sampling_duration()) => metrics,
            _ => HealthMetrics::fresh(now),
        };
        update(&mut metrics);

        self.store.set_metrics(&metrics).await;
        self.shadow.set_metrics(metrics);
        metrics
    }

    /// The trip predicate: a fresh window with enough throughput and a
    /// failure ratio at or above the threshold.
    ///
    /// A stale window never trips; leftover failures from before an idle
    /// period are not evidence about the dependency now.
    fn should_trip(&self, metrics: &HealthMetrics) -> bool {
        metrics.is_fresh(Utc::now(), self.config.sampling_duration())
            && metrics.total() >= self.config.minimum_throughput
            && metrics.failure_ratio() >= self.config.failure_threshold
    }

    /// One lease-guarded transition attempt.
    ///
    /// Aborts silently when the lease is held elsewhere or the re-read state
    /// no longer matches `expected` — in both cases another peer is handling
    /// the same transition. Returns whether this attempt took effect.
    async fn try_transition(
        &self,
        expected: CircuitState,
        target: CircuitState,
        trigger: Option<String>,
    ) -> bool {
        let Some(lease) = self.store.try_acquire_lease().await else {
            debug!(from = %expected, to = %target, "transition skipped; lease is held by a peer");
            return false;
        };

        let current = self.read_state().await;
        let transitioned = if current == expected {
            self.apply_transition(expected, target, trigger).await;
            true
        } else {
            debug!(
                from = %expected,
                to = %target,
                observed = %current,
                "transition aborted; state changed under the lease"
            );
            false
        };

        self.store.release_lease(lease).await;
        transitioned
    }

    /// Writes one transition's target fields, mirrors the shadow and emits
    /// the state-change event. Callers hold the lease where one is required.
    async fn apply_transition(
        &self,
        prior: CircuitState,
        target: CircuitState,
        trigger: Option<String>,
    ) {
        let now = Utc::now();
        match target {
            CircuitState::Open => {
                let break_duration =
                    TimeDelta::from_std(self.config.break_duration()).unwrap_or(TimeDelta::MAX);
                let blocked_until =
                    now.checked_add_signed(break_duration).unwrap_or(DateTime::<Utc>::MAX_UTC);
                self.store.set_state(CircuitState::Open).await;
                self.store.set_blocked_until(blocked_until, now).await;
                self.shadow.set_state(CircuitState::Open);
                self.shadow.set_blocked_until(Some(blocked_until));
            }
            CircuitState::HalfOpen => {
                // Blocked-until stays put: a failed probe reopens and
                // overwrites it anyway.
                self.store.set_state(CircuitState::HalfOpen).await;
                self.shadow.set_state(CircuitState::HalfOpen);
            }
            CircuitState::Closed => {
                let fresh = HealthMetrics::fresh(now);
                self.store.set_state(CircuitState::Closed).await;
                self.store.set_metrics(&fresh).await;
                self.store.clear_blocked_until().await;
                self.shadow.set_state(CircuitState::Closed);
                self.shadow.set_metrics(fresh);
                self.shadow.set_blocked_until(None);
            }
            CircuitState::Isolated => {
                self.store.set_state(CircuitState::Isolated).await;
                self.shadow.set_state(CircuitState::Isolated);
            }
        }

        info!(
            circuit_id = %self.config.circuit_id,
            prior = %prior,
            next = %target,
            "circuit state changed"
        );
        self.emit(StateChange {
            circuit_id: self.config.circuit_id.clone(),
            prior,
            next: target,
            at: now,
            trigger,
        });
    }

    /// Invokes the callback registered for the entered state, swallowing
    /// panics so the lease release that follows always runs.
    fn emit(&self, change: StateChange) {
        let hook = match change.next {
            CircuitState::Open => self.callbacks.on_open.as_ref(),
            CircuitState::Closed => self.callbacks.on_close.as_ref(),
            CircuitState::HalfOpen => self.callbacks.on_half_open.as_ref(),
            CircuitState::Isolated => None,
        };
        if let Some(hook) = hook {
            if catch_unwind(AssertUnwindSafe(|| hook(&change))).is_err() {
                warn!(
                    circuit_id = %change.circuit_id,
                    next = %change.next,
                    "state-change callback panicked; ignoring"
                );
            }
        }
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::panic,
    reason = "tests assert on values that must exist"
)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::store::MemoryBackend;

    fn engine(config: CircuitBreakerConfig) -> CircuitEngine<MemoryBackend> {
        CircuitEngine::new(config, MemoryBackend::new()).unwrap()
    }

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let config =
            CircuitBreakerConfig { failure_threshold: 1.5, ..CircuitBreakerConfig::new("orders") };
        assert!(CircuitEngine::new(config, MemoryBackend::new()).is_err());
    }

    #[tokio::test]
    async fn test_fresh_circuit_defaults_to_closed() {
        let engine = engine(CircuitBreakerConfig::new("orders"));
        assert_eq!(engine.current_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_successful_call_passes_through() {
        let engine = engine(CircuitBreakerConfig::new("orders"));

        let result = engine.execute(|| async { Ok::<_, String>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(engine.current_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_guarded_error_is_reraised_unchanged() {
        let engine = engine(CircuitBreakerConfig::new("orders"));

        let result = engine.execute(|| async { Err::<i32, _>("boom".to_owned()) }).await;
        match result {
            Err(CircuitError::Inner(e)) => assert_eq!(e, "boom"),
            other => panic!("expected Inner, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_callback_panic_does_not_poison_the_engine() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_in_hook = Arc::clone(&calls);
        let callbacks = Callbacks {
            on_open: Some(Arc::new(move |_: &StateChange| {
                calls_in_hook.fetch_add(1, Ordering::SeqCst);
                panic!("observer bug");
            })),
            ..Callbacks::default()
        };
        let config = CircuitBreakerConfig {
            minimum_throughput: 1,
            ..CircuitBreakerConfig::new("orders")
        };
        let engine =
            CircuitEngine::with_callbacks(config, MemoryBackend::new(), callbacks).unwrap();

        // Trips on the first failure; the panicking callback must not leak.
        let _ = engine.execute(|| async { Err::<(), _>("boom".to_owned()) }).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(engine.current_state().await, CircuitState::Open);

        // The lease was released despite the panic, so later transitions work.
        engine.reset().await;
        assert_eq!(engine.current_state().await, CircuitState::Closed);
    }

    #[tokio::test]
    async fn test_dispose_consumes_the_engine() {
        let backend = MemoryBackend::new();
        let engine =
            CircuitEngine::new(CircuitBreakerConfig::new("orders"), backend.clone()).unwrap();
        engine.isolate().await;
        engine.dispose();

        // Shared state survives disposal.
        let peer = CircuitEngine::new(CircuitBreakerConfig::new("orders"), backend).unwrap();
        assert_eq!(peer.current_state().await, CircuitState::Isolated);
    }

    #[test]
    fn test_callbacks_debug_does_not_print_closures() {
        let callbacks = Callbacks {
            on_open: Some(Arc::new(|_: &StateChange| {})),
            ..Callbacks::default()
        };
        let rendered = format!("{callbacks:?}");
        assert!(rendered.contains("on_open"));
        assert!(rendered.contains("on_close"));
    }
}
