//! Process-local mirror of the shared circuit fields.
//!
//! The shadow exists for exactly one situation: the store is unreachable and
//! the engine still has to answer "may this call run?". It mirrors the three
//! authoritative fields — state, health window, blocked-until — and is
//! consulted only when a store read comes back absent. It is a fallback, not
//! a cache: a live store reading always wins, and nothing is ever served from
//! the shadow while the store answers.
//!
//! Discipline:
//!
//! - writes land here only after the corresponding authoritative write was
//!   attempted;
//! - reads and writes go through a process-local mutex;
//! - a disabled shadow answers nothing, so absent store reads degrade to
//!   Closed/empty instead.

use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::{metrics::HealthMetrics, state::CircuitState};

#[derive(Debug, Clone)]
struct ShadowState {
    state: CircuitState,
    metrics: HealthMetrics,
    blocked_until: Option<DateTime<Utc>>,
}

/// Degraded-mode mirror of one circuit's shared fields.
#[derive(Debug)]
pub(crate) struct LocalShadow {
    enabled: bool,
    inner: Mutex<ShadowState>,
}

impl LocalShadow {
    pub(crate) fn new(enabled: bool, now: DateTime<Utc>) -> Self {
        Self {
            enabled,
            inner: Mutex::new(ShadowState {
                state: CircuitState::Closed,
                metrics: HealthMetrics::fresh(now),
                blocked_until: None,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ShadowState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Mirrored state, or `None` when the shadow is disabled.
    pub(crate) fn state(&self) -> Option<CircuitState> {
        self.enabled.then(|| self.lock().state)
    }

    /// Mirrored health window, or `None` when the shadow is disabled.
    pub(crate) fn metrics(&self) -> Option<HealthMetrics> {
        self.enabled.then(|| self.lock().metrics)
    }

    /// Mirrored blocked-until instant, or `None` when the shadow is disabled
    /// or no instant is mirrored.
    pub(crate) fn blocked_until(&self) -> Option<DateTime<Utc>> {
        if !self.enabled {
            return None;
        }
        self.lock().blocked_until
    }

    pub(crate) fn set_state(&self, state: CircuitState) {
        if self.enabled {
            self.lock().state = state;
        }
    }

    pub(crate) fn set_metrics(&self, metrics: HealthMetrics) {
        if self.enabled {
            self.lock().metrics = metrics;
        }
    }

    pub(crate) fn set_blocked_until(&self, blocked_until: Option<DateTime<Utc>>) {
        if self.enabled {
            self.lock().blocked_until = blocked_until;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enabled_shadow_starts_closed_and_empty() {
        let shadow = LocalShadow::new(true, Utc::now());
        assert_eq!(shadow.state(), Some(CircuitState::Closed));
        assert_eq!(shadow.metrics().map(|m| m.total()), Some(0));
        assert_eq!(shadow.blocked_until(), None);
    }

    #[test]
    fn test_disabled_shadow_answers_nothing() {
        let shadow = LocalShadow::new(false, Utc::now());
        assert_eq!(shadow.state(), None);
        assert_eq!(shadow.metrics(), None);
        assert_eq!(shadow.blocked_until(), None);
    }

    #[test]
    fn test_disabled_shadow_ignores_writes() {
        let shadow = LocalShadow::new(false, Utc::now());
        shadow.set_state(CircuitState::Open);
        shadow.set_blocked_until(Some(Utc::now()));

        assert_eq!(shadow.state(), None);
        assert_eq!(shadow.blocked_until(), None);
    }

    #[test]
    fn test_mirrored_fields_round_trip() {
        let now = Utc::now();
        let shadow = LocalShadow::new(true, now);

        let mut metrics = HealthMetrics::fresh(now);
        metrics.record_failure();
        let blocked_until = now + chrono::TimeDelta::seconds(30);

        shadow.set_state(CircuitState::Open);
        shadow.set_metrics(metrics);
        shadow.set_blocked_until(Some(blocked_until));

        assert_eq!(shadow.state(), Some(CircuitState::Open));
        assert_eq!(shadow.metrics(), Some(metrics));
        assert_eq!(shadow.blocked_until(), Some(blocked_until));

        shadow.set_blocked_until(None);
        assert_eq!(shadow.blocked_until(), None);
    }
}
