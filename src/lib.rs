//! Shared-Breaker: a distributed circuit breaker for multi-process services.
//!
//! A circuit breaker guards outbound calls to a remote dependency (an HTTP
//! API, a database, a payment gateway) and fails fast once the dependency is
//! judged unhealthy. This crate adds the distributed part: **circuit state
//! lives in a central key-value store**, so every process using the same
//! circuit identifier shares one circuit. When one instance observes enough
//! failures to trip, its peers see the trip on their next state check and
//! start serving fallbacks immediately, without each rediscovering the
//! failure on its own.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌────────────────┐   ┌────────────────┐
//! │   Process A    │   │   Process B    │   │   Process C    │
//! │ ┌────────────┐ │   │ ┌────────────┐ │   │ ┌────────────┐ │
//! │ │CircuitEngine│ │   │ │CircuitEngine│ │   │ │CircuitEngine│ │
//! │ └─────┬──────┘ │   │ └─────┬──────┘ │   │ └─────┬──────┘ │
//! │ ┌─────┴──────┐ │   │ ┌─────┴──────┐ │   │ ┌─────┴──────┐ │
//! │ │LocalShadow │ │   │ │LocalShadow │ │   │ │LocalShadow │ │
//! │ └────────────┘ │   │ └────────────┘ │   │ └────────────┘ │
//! └───────┬────────┘   └───────┬────────┘   └───────┬────────┘
//!         │      state · metrics · blocked · lock    │
//!         └───────────────┬────────────┬─────────────┘
//!                         ▼            ▼
//!                  ┌─────────────────────────┐
//!                  │     shared store        │   <prefix>:<circuitId>:*
//!                  │   (Redis or in-memory)  │
//!                  └─────────────────────────┘
//! ```
//!
//! Four pieces cooperate:
//!
//! - [`store::StateStore`] — a total façade over the store: reads degrade to
//!   "absent", writes are best-effort, lease acquisition fails open. The
//!   engine never sees a store fault.
//! - [`metrics::HealthMetrics`] — a single-bucket sliding window of
//!   success/failure counts, one store read and write per guarded call.
//! - [`engine::CircuitEngine`] — the four-state machine
//!   (Closed / Open / `HalfOpen` / Isolated). Every transition runs under a
//!   store lease, so at most one peer transitions per lease window.
//! - the local shadow — a per-process mirror of the shared fields, consulted
//!   only while the store is unreachable. Strictly a fallback, never a cache.
//!
//! # Quick start
//!
//! ```
//! use shared_breaker::{CircuitBreakerConfig, CircuitEngine, CircuitError, MemoryBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CircuitBreakerConfig {
//!     failure_threshold: 0.5,
//!     minimum_throughput: 3,
//!     ..CircuitBreakerConfig::new("payments-gateway")
//! };
//! let engine = CircuitEngine::new(config, MemoryBackend::new())?;
//!
//! let reply = engine
//!     .execute(|| async {
//!         // the guarded call: any future producing Result<T, E>
//!         Ok::<_, String>("charged")
//!     })
//!     .await;
//!
//! match reply {
//!     Ok(value) => println!("dependency answered: {value}"),
//!     Err(CircuitError::Open { retry_after }) => println!("failing fast; retry in {retry_after:?}"),
//!     Err(CircuitError::Isolated) => println!("operator isolated the circuit"),
//!     Err(CircuitError::Inner(e)) => println!("dependency failed: {e}"),
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Production deployments point every peer at the same Redis:
//!
//! ```rust,no_run
//! use std::time::Duration;
//!
//! use shared_breaker::{CircuitBreakerConfig, CircuitEngine, RedisBackend};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend =
//!     RedisBackend::connect("redis://cache.internal:6379", Duration::from_secs(5)).await?;
//! let engine = CircuitEngine::new(CircuitBreakerConfig::new("payments-gateway"), backend)?;
//! # let _ = engine;
//! # Ok(())
//! # }
//! ```
//!
//! # Module organization
//!
//! - [`engine`]: the state machine and its transition protocol
//! - [`store`]: the store seam — backend trait, Redis and in-memory backends,
//!   key layout, lease handling
//! - [`metrics`]: the sliding health window and its wire codec
//! - [`config`]: the option set and its validation
//! - [`state`]: state enum, wire labels, state-change events
//! - [`error`]: error types with strictly separated audiences
//!
//! # What this crate does not do
//!
//! The breaker expresses no opinion on what a failure *is* beyond "the
//! guarded call returned `Err`". It does not retry calls, cache responses,
//! enforce timeouts on the guarded call, or replicate state across multiple
//! stores. Compose those concerns around `execute` as your service requires.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
mod shadow;
pub mod state;
pub mod store;

pub use config::CircuitBreakerConfig;
pub use engine::{Callbacks, CircuitEngine, StateChangeHook};
pub use error::{CircuitError, ConfigError, StoreError};
pub use metrics::HealthMetrics;
pub use state::{CircuitState, StateChange};
pub use store::{CircuitKeys, LeaseToken, MemoryBackend, RedisBackend, StateStore, StoreBackend};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        // Verify the flat re-exports stay wired up.
        let _ = std::marker::PhantomData::<CircuitState>;
        let _ = std::marker::PhantomData::<CircuitBreakerConfig>;
        let _ = std::marker::PhantomData::<MemoryBackend>;
    }
}
