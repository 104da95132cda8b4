//! Backend Health Monitor
//!
//! Circuit breaker that classifies backend reachability for one stream writer:
//! - `Healthy → Degraded` on the first failure
//! - `Degraded → Down` once consecutive failures reach the threshold
//! - `Down → Recovering` when a fast-cadence probe is dispatched
//! - any state `→ Healthy` on a success, with the failure count reset
//!
//! Probes and write results feed the same counter. Nobody is notified of a
//! transition; readers poll [`HealthMonitor::current_state`].

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::clock::SharedClock;

// =============================================================================
// STATE MACHINE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Writes go straight to the backend
    Healthy,
    /// At least one recent failure, still below the threshold
    Degraded,
    /// Threshold reached, writes are diverted
    Down,
    /// Probe in flight against a Down backend
    Recovering,
}

impl CircuitState {
    #[inline]
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Whether probes should run at the fast cadence.
    #[inline]
    pub fn is_outage(self) -> bool {
        matches!(self, Self::Down | Self::Recovering)
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "HEALTHY"),
            Self::Degraded => write!(f, "DEGRADED"),
            Self::Down => write!(f, "DOWN"),
            Self::Recovering => write!(f, "RECOVERING"),
        }
    }
}

/// What caused a transition (for logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthEvent {
    WriteFailed,
    WriteSucceeded,
    ProbeFailed,
    ProbeSucceeded,
    ProbeDispatched,
}

impl std::fmt::Display for HealthEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WriteFailed => write!(f, "write_failed"),
            Self::WriteSucceeded => write!(f, "write_ok"),
            Self::ProbeFailed => write!(f, "probe_failed"),
            Self::ProbeSucceeded => write!(f, "probe_ok"),
            Self::ProbeDispatched => write!(f, "probe_dispatched"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub failure_threshold: u32,
    pub healthy_probe_interval: Duration,
    pub down_probe_interval: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            healthy_probe_interval: Duration::from_secs(1),
            down_probe_interval: Duration::from_millis(100),
        }
    }
}

/// Point-in-time copy of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_health_check: Option<DateTime<Utc>>,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    last_health_check: Option<DateTime<Utc>>,
    last_success: Option<DateTime<Utc>>,
}

// =============================================================================
// MONITOR
// =============================================================================

#[derive(Debug)]
pub struct HealthMonitor {
    label: String,
    config: HealthConfig,
    clock: SharedClock,
    inner: Mutex<Inner>,
}

impl HealthMonitor {
    pub fn new(label: impl Into<String>, config: HealthConfig, clock: SharedClock) -> Self {
        Self {
            label: label.into(),
            config: HealthConfig {
                failure_threshold: config.failure_threshold.max(1),
                ..config
            },
            clock,
            inner: Mutex::new(Inner {
                state: CircuitState::Healthy,
                consecutive_failures: 0,
                last_health_check: None,
                last_success: None,
            }),
        }
    }

    #[inline]
    pub fn current_state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        let inner = self.inner.lock();
        HealthSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            last_health_check: inner.last_health_check,
            last_success: inner.last_success,
        }
    }

    /// Feed the outcome of a write into the breaker.
    pub fn record_result(&self, success: bool) {
        let event = if success {
            HealthEvent::WriteSucceeded
        } else {
            HealthEvent::WriteFailed
        };
        self.apply(success, event);
    }

    /// Run one probe and feed its outcome into the breaker.
    ///
    /// A Down circuit moves to Recovering before the probe runs. An `Err` from
    /// the probe counts the same as `Ok(false)`.
    pub fn check_health<F>(&self, probe: F) -> bool
    where
        F: FnOnce() -> Result<bool>,
    {
        {
            let mut inner = self.inner.lock();
            if inner.state == CircuitState::Down {
                self.transition(&mut inner, CircuitState::Recovering, HealthEvent::ProbeDispatched);
            }
        }

        let healthy = match probe() {
            Ok(ok) => ok,
            Err(e) => {
                debug!(writer = %self.label, error = %e, "health probe errored");
                false
            }
        };

        self.inner.lock().last_health_check = Some(self.clock.now());

        let event = if healthy {
            HealthEvent::ProbeSucceeded
        } else {
            HealthEvent::ProbeFailed
        };
        self.apply(healthy, event);
        healthy
    }

    /// Delay before the next probe given the current state.
    pub fn probe_interval(&self) -> Duration {
        if self.current_state().is_outage() {
            self.config.down_probe_interval
        } else {
            self.config.healthy_probe_interval
        }
    }

    fn apply(&self, success: bool, event: HealthEvent) {
        let mut inner = self.inner.lock();
        if success {
            inner.last_success = Some(self.clock.now());
            if inner.consecutive_failures > 0 {
                debug!(
                    writer = %self.label,
                    prev_failures = inner.consecutive_failures,
                    "backend_recovered"
                );
            }
            inner.consecutive_failures = 0;
            if inner.state != CircuitState::Healthy {
                self.transition(&mut inner, CircuitState::Healthy, event);
            }
            return;
        }

        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let next = match inner.state {
            CircuitState::Healthy if inner.consecutive_failures >= self.config.failure_threshold => {
                CircuitState::Down
            }
            CircuitState::Healthy => CircuitState::Degraded,
            CircuitState::Degraded if inner.consecutive_failures >= self.config.failure_threshold => {
                CircuitState::Down
            }
            CircuitState::Degraded => CircuitState::Degraded,
            CircuitState::Down | CircuitState::Recovering => CircuitState::Down,
        };
        if next != inner.state {
            self.transition(&mut inner, next, event);
        }
    }

    fn transition(&self, inner: &mut Inner, to: CircuitState, event: HealthEvent) {
        let from = inner.state;
        inner.state = to;

        if to == CircuitState::Down && from != CircuitState::Recovering {
            warn!(
                writer = %self.label,
                failures = inner.consecutive_failures,
                reason = %event,
                "circuit_opened"
            );
        }

        info!(
            writer = %self.label,
            from = %from,
            to = %to,
            reason = %event,
            failures = inner.consecutive_failures,
            "circuit_transition"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use anyhow::anyhow;
    use chrono::TimeZone;
    use std::sync::Arc;

    fn monitor(threshold: u32) -> (HealthMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
        ));
        let config = HealthConfig {
            failure_threshold: threshold,
            ..HealthConfig::default()
        };
        (HealthMonitor::new("btc", config, clock.clone()), clock)
    }

    #[test]
    fn test_degrades_then_trips() {
        let (hm, _) = monitor(3);
        assert_eq!(hm.current_state(), CircuitState::Healthy);

        hm.record_result(false);
        assert_eq!(hm.current_state(), CircuitState::Degraded);
        hm.record_result(false);
        assert_eq!(hm.current_state(), CircuitState::Degraded);
        hm.record_result(false);
        assert_eq!(hm.current_state(), CircuitState::Down);
        assert_eq!(hm.snapshot().consecutive_failures, 3);
    }

    #[test]
    fn test_success_resets_degraded() {
        let (hm, _) = monitor(3);
        hm.record_result(false);
        hm.record_result(false);
        hm.record_result(true);
        assert_eq!(hm.current_state(), CircuitState::Healthy);
        assert_eq!(hm.snapshot().consecutive_failures, 0);

        // Counter restarted: two more failures do not trip
        hm.record_result(false);
        hm.record_result(false);
        assert_eq!(hm.current_state(), CircuitState::Degraded);
    }

    #[test]
    fn test_threshold_of_one_trips_immediately() {
        let (hm, _) = monitor(1);
        hm.record_result(false);
        assert_eq!(hm.current_state(), CircuitState::Down);
    }

    #[test]
    fn test_probe_from_down_passes_through_recovering() {
        let (hm, clock) = monitor(2);
        hm.record_result(false);
        hm.record_result(false);
        assert_eq!(hm.current_state(), CircuitState::Down);

        let mut seen = None;
        let ok = hm.check_health(|| {
            seen = Some(());
            Ok(false)
        });
        assert!(!ok);
        assert!(seen.is_some());
        assert_eq!(hm.current_state(), CircuitState::Down);

        clock.advance_millis(100);
        let ok = hm.check_health(|| Ok(true));
        assert!(ok);
        let snap = hm.snapshot();
        assert_eq!(snap.state, CircuitState::Healthy);
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.last_success, Some(clock.now()));
        assert_eq!(snap.last_health_check, Some(clock.now()));
    }

    #[test]
    fn test_state_is_recovering_while_probe_runs() {
        let (hm, _) = monitor(1);
        hm.record_result(false);

        let hm_ref = &hm;
        hm.check_health(|| {
            assert_eq!(hm_ref.current_state(), CircuitState::Recovering);
            Ok(true)
        });
        assert_eq!(hm.current_state(), CircuitState::Healthy);
    }

    #[test]
    fn test_probe_error_counts_as_failure() {
        let (hm, _) = monitor(3);
        assert!(!hm.check_health(|| Err(anyhow!("connection refused"))));
        assert_eq!(hm.current_state(), CircuitState::Degraded);
        assert_eq!(hm.snapshot().consecutive_failures, 1);
    }

    #[test]
    fn test_probe_cadence_follows_state() {
        let (hm, _) = monitor(1);
        assert_eq!(hm.probe_interval(), Duration::from_secs(1));
        hm.record_result(false);
        assert_eq!(hm.probe_interval(), Duration::from_millis(100));
    }
}
