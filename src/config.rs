//! Circuit breaker configuration.
//!
//! [`CircuitBreakerConfig`] is the full option set consumed by
//! [`CircuitEngine`](crate::engine::CircuitEngine). It deserializes from
//! configuration files with per-field defaults, so a deployment only spells
//! out what it changes:
//!
//! ```toml
//! circuit_id = "payments-gateway"
//! failure_threshold = 0.3
//! break_duration_ms = 60000
//! ```
//!
//! Peers sharing a circuit id must also share `key_prefix`,
//! `sampling_duration_ms` and `break_duration_ms`; disagreeing peers would
//! fight over the same keys with different lifetimes.

use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Option set for one circuit engine.
///
/// # Examples
///
/// ```
/// use shared_breaker::config::CircuitBreakerConfig;
///
/// // Defaults everywhere except the identity.
/// let config = CircuitBreakerConfig::new("inventory-api");
/// assert_eq!(config.minimum_throughput, 5);
///
/// // Struct update syntax for targeted overrides.
/// let strict = CircuitBreakerConfig {
///     failure_threshold: 0.2,
///     minimum_throughput: 20,
///     ..CircuitBreakerConfig::new("inventory-api")
/// };
/// assert!(strict.validate().is_ok());
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Circuit identifier. Every process using the same id shares all state.
    pub circuit_id: String,

    /// Failure ratio at or above which the circuit trips, in `[0, 1]`.
    ///
    /// Default: 0.5
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,

    /// Minimum calls the current window must hold before the ratio is
    /// consulted at all.
    ///
    /// Default: 5
    #[serde(default = "default_minimum_throughput")]
    pub minimum_throughput: u64,

    /// How long the circuit stays open after a trip, in milliseconds.
    ///
    /// Default: 30 000 (30 seconds)
    #[serde(default = "default_break_duration_ms")]
    pub break_duration_ms: u64,

    /// Width of the sliding health window, in milliseconds.
    ///
    /// Default: 10 000 (10 seconds)
    #[serde(default = "default_sampling_duration_ms")]
    pub sampling_duration_ms: u64,

    /// Whether to keep a process-local mirror of the shared fields for use
    /// when the store is unreachable.
    ///
    /// Default: true
    #[serde(default = "default_local_shadow_enabled")]
    pub local_shadow_enabled: bool,

    /// Upper bound on any single store operation, in milliseconds.
    ///
    /// Default: 5 000 (5 seconds)
    #[serde(default = "default_store_operation_timeout_ms")]
    pub store_operation_timeout_ms: u64,

    /// Time-to-live of the transition lease, in milliseconds. Must exceed
    /// the longest transition path so a crashed holder cannot wedge the
    /// circuit past one lease window.
    ///
    /// Default: 5 000 (5 seconds)
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,

    /// Prefix of every store key written for this circuit.
    ///
    /// Default: `"cb:distributed"`
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl CircuitBreakerConfig {
    /// Configuration for `circuit_id` with every other field at its default.
    #[allow(
        clippy::impl_trait_in_params,
        reason = "impl Into<String> is idiomatic for constructors"
    )]
    pub fn new(circuit_id: impl Into<String>) -> Self {
        Self {
            circuit_id: circuit_id.into(),
            failure_threshold: default_failure_threshold(),
            minimum_throughput: default_minimum_throughput(),
            break_duration_ms: default_break_duration_ms(),
            sampling_duration_ms: default_sampling_duration_ms(),
            local_shadow_enabled: default_local_shadow_enabled(),
            store_operation_timeout_ms: default_store_operation_timeout_ms(),
            lease_ttl_ms: default_lease_ttl_ms(),
            key_prefix: default_key_prefix(),
        }
    }

    /// Validates the option set.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when any bound is violated:
    /// - `circuit_id` must be non-empty
    /// - `failure_threshold` must lie in `[0, 1]`
    /// - `minimum_throughput` must be at least 1
    /// - `break_duration_ms`, `sampling_duration_ms`,
    ///   `store_operation_timeout_ms` and `lease_ttl_ms` must be positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.circuit_id.is_empty() {
            return Err(ConfigError::new("circuit_id must be non-empty"));
        }
        if !(0.0..=1.0).contains(&self.failure_threshold) {
            return Err(ConfigError::new("failure_threshold must lie in [0, 1]"));
        }
        if self.minimum_throughput == 0 {
            return Err(ConfigError::new("minimum_throughput must be at least 1"));
        }
        if self.break_duration_ms == 0 {
            return Err(ConfigError::new("break_duration_ms must be positive"));
        }
        if self.sampling_duration_ms == 0 {
            return Err(ConfigError::new("sampling_duration_ms must be positive"));
        }
        if self.store_operation_timeout_ms == 0 {
            return Err(ConfigError::new("store_operation_timeout_ms must be positive"));
        }
        if self.lease_ttl_ms == 0 {
            return Err(ConfigError::new("lease_ttl_ms must be positive"));
        }
        Ok(())
    }

    /// Returns the break duration as a [`Duration`].
    #[must_use]
    pub const fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }

    /// Returns the sampling duration as a [`Duration`].
    #[must_use]
    pub const fn sampling_duration(&self) -> Duration {
        Duration::from_millis(self.sampling_duration_ms)
    }

    /// Returns the store operation timeout as a [`Duration`].
    #[must_use]
    pub const fn store_operation_timeout(&self) -> Duration {
        Duration::from_millis(self.store_operation_timeout_ms)
    }

    /// Returns the lease time-to-live as a [`Duration`].
    #[must_use]
    pub const fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }
}

fn default_failure_threshold() -> f64 {
    0.5
}

fn default_minimum_throughput() -> u64 {
    5
}

fn default_break_duration_ms() -> u64 {
    30_000
}

fn default_sampling_duration_ms() -> u64 {
    10_000
}

fn default_local_shadow_enabled() -> bool {
    true
}

fn default_store_operation_timeout_ms() -> u64 {
    5_000
}

fn default_lease_ttl_ms() -> u64 {
    5_000
}

fn default_key_prefix() -> String {
    "cb:distributed".to_owned()
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::float_cmp,
    reason = "tests assert on exact default values"
)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CircuitBreakerConfig::new("orders");
        assert_eq!(config.circuit_id, "orders");
        assert_eq!(config.failure_threshold, 0.5);
        assert_eq!(config.minimum_throughput, 5);
        assert_eq!(config.break_duration(), Duration::from_secs(30));
        assert_eq!(config.sampling_duration(), Duration::from_secs(10));
        assert!(config.local_shadow_enabled);
        assert_eq!(config.store_operation_timeout(), Duration::from_secs(5));
        assert_eq!(config.lease_ttl(), Duration::from_secs(5));
        assert_eq!(config.key_prefix, "cb:distributed");
    }

    #[test]
    fn test_default_config_validates() {
        assert!(CircuitBreakerConfig::new("orders").validate().is_ok());
    }

    #[test]
    fn test_empty_circuit_id_rejected() {
        let config = CircuitBreakerConfig::new("");
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("circuit_id"));
    }

    #[test]
    fn test_threshold_bounds() {
        let mut config = CircuitBreakerConfig::new("orders");

        config.failure_threshold = 0.0;
        assert!(config.validate().is_ok());
        config.failure_threshold = 1.0;
        assert!(config.validate().is_ok());

        config.failure_threshold = -0.01;
        assert!(config.validate().is_err());
        config.failure_threshold = 1.01;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_throughput_rejected() {
        let config =
            CircuitBreakerConfig { minimum_throughput: 0, ..CircuitBreakerConfig::new("orders") };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_durations_rejected() {
        let mutations: [fn(&mut CircuitBreakerConfig); 4] = [
            |c| c.break_duration_ms = 0,
            |c| c.sampling_duration_ms = 0,
            |c| c.store_operation_timeout_ms = 0,
            |c| c.lease_ttl_ms = 0,
        ];
        for mutate in mutations {
            let mut config = CircuitBreakerConfig::new("orders");
            mutate(&mut config);
            assert!(config.validate().is_err());
        }
    }

    #[test]
    fn test_from_toml_with_defaults() {
        let toml = "circuit_id = \"payments\"";

        let config: CircuitBreakerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.circuit_id, "payments");
        assert_eq!(config.failure_threshold, 0.5);
        assert_eq!(config.key_prefix, "cb:distributed");
    }

    #[test]
    fn test_from_toml_with_overrides() {
        let toml = "
            circuit_id = \"payments\"
            failure_threshold = 0.25
            minimum_throughput = 10
            break_duration_ms = 60000
            local_shadow_enabled = false
            key_prefix = \"cb:staging\"
        ";

        let config: CircuitBreakerConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.failure_threshold, 0.25);
        assert_eq!(config.minimum_throughput, 10);
        assert_eq!(config.break_duration(), Duration::from_secs(60));
        assert!(!config.local_shadow_enabled);
        assert_eq!(config.key_prefix, "cb:staging");
    }

    #[test]
    fn test_from_toml_missing_circuit_id() {
        let toml = "failure_threshold = 0.5";

        let result: Result<CircuitBreakerConfig, _> = toml::from_str(toml);
        assert!(result.is_err());
    }
}
