//! Health state machine for a running instance.
//!
//! STARTING covers the grace period after launch: failed probes are observed
//! but never count toward the unhealthy threshold while the service process
//! may still be initializing. Any successful probe moves the instance to
//! HEALTHY and clears the consecutive-failure count. Once the configured
//! number of consecutive post-grace failures accumulates the instance is
//! UNHEALTHY, which is terminal here; restart or replacement is the
//! orchestrator's decision, and a replacement instance starts over in
//! STARTING.

use std::time::Duration;

use crate::image::HealthcheckSpec;

/// Externally visible health of one instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Within the grace period, no successful probe yet
    Starting,
    /// Probes succeeding
    Healthy,
    /// Consecutive post-grace failures reached the threshold
    Unhealthy,
}

/// Folds probe outcomes into a `HealthState`.
///
/// Pure bookkeeping: the caller supplies the elapsed time since instance
/// start, so the monitor itself never reads a clock.
#[derive(Debug)]
pub struct HealthMonitor {
    state: HealthState,
    consecutive_failures: u32,
    grace_period: Duration,
    failure_threshold: u32,
}

impl HealthMonitor {
    pub fn new(grace_period: Duration, failure_threshold: u32) -> Self {
        Self {
            state: HealthState::Starting,
            consecutive_failures: 0,
            grace_period,
            failure_threshold,
        }
    }

    pub fn from_spec(spec: &HealthcheckSpec) -> Self {
        Self::new(
            Duration::from_secs(spec.grace_period_seconds),
            spec.failure_threshold,
        )
    }

    pub fn state(&self) -> HealthState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Record one probe outcome observed `since_start` after instance start.
    /// Returns the new state when this observation causes a transition.
    pub fn observe(&mut self, passed: bool, since_start: Duration) -> Option<HealthState> {
        if self.state == HealthState::Unhealthy {
            // Terminal; a replacement instance gets a fresh monitor
            return None;
        }

        if passed {
            self.consecutive_failures = 0;
            return self.transition(HealthState::Healthy);
        }

        if since_start < self.grace_period {
            // Grace-period failures never count toward the threshold
            return None;
        }

        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.failure_threshold {
            return self.transition(HealthState::Unhealthy);
        }

        None
    }

    fn transition(&mut self, next: HealthState) -> Option<HealthState> {
        if self.state == next {
            return None;
        }
        self.state = next;
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRACE: Duration = Duration::from_secs(60);

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(GRACE, 3)
    }

    fn after_grace(secs: u64) -> Duration {
        GRACE + Duration::from_secs(secs)
    }

    // =============================================================================
    // Grace period
    // =============================================================================

    #[test]
    fn test_failures_within_grace_never_trip_the_threshold() {
        let mut m = monitor();

        assert_eq!(m.observe(false, Duration::from_secs(10)), None);
        assert_eq!(m.observe(false, Duration::from_secs(40)), None);

        assert_eq!(m.state(), HealthState::Starting);
        assert_eq!(m.consecutive_failures(), 0);
    }

    #[test]
    fn test_grace_failures_do_not_prime_the_post_grace_count() {
        let mut m = monitor();

        m.observe(false, Duration::from_secs(10));
        m.observe(false, Duration::from_secs(40));

        // Two more failures after grace: still below a threshold of three
        assert_eq!(m.observe(false, after_grace(1)), None);
        assert_eq!(m.observe(false, after_grace(31)), None);
        assert_eq!(m.state(), HealthState::Starting);

        // The third post-grace failure trips it
        assert_eq!(
            m.observe(false, after_grace(61)),
            Some(HealthState::Unhealthy)
        );
    }

    #[test]
    fn test_success_during_grace_is_healthy_immediately() {
        let mut m = monitor();
        assert_eq!(
            m.observe(true, Duration::from_secs(5)),
            Some(HealthState::Healthy)
        );
    }

    // =============================================================================
    // Threshold and reset
    // =============================================================================

    #[test]
    fn test_exactly_three_consecutive_failures_are_unhealthy() {
        let mut m = monitor();
        m.observe(true, Duration::from_secs(5));

        assert_eq!(m.observe(false, after_grace(0)), None);
        assert_eq!(m.observe(false, after_grace(30)), None);
        assert_eq!(m.state(), HealthState::Healthy);

        assert_eq!(
            m.observe(false, after_grace(60)),
            Some(HealthState::Unhealthy)
        );
    }

    #[test]
    fn test_success_resets_the_consecutive_count() {
        let mut m = monitor();
        m.observe(true, Duration::from_secs(5));

        m.observe(false, after_grace(0));
        m.observe(false, after_grace(30));
        assert_eq!(m.consecutive_failures(), 2);

        // One success: count cleared, instance stays healthy
        assert_eq!(m.observe(true, after_grace(60)), None);
        assert_eq!(m.state(), HealthState::Healthy);
        assert_eq!(m.consecutive_failures(), 0);

        // A fresh run of failures starts from zero again
        assert_eq!(m.observe(false, after_grace(90)), None);
        assert_eq!(m.observe(false, after_grace(120)), None);
        assert_eq!(m.state(), HealthState::Healthy);
        assert_eq!(
            m.observe(false, after_grace(150)),
            Some(HealthState::Unhealthy)
        );
    }

    #[test]
    fn test_unhealthy_is_terminal() {
        let mut m = monitor();
        for i in 0..3 {
            m.observe(false, after_grace(i * 30));
        }
        assert_eq!(m.state(), HealthState::Unhealthy);

        assert_eq!(m.observe(true, after_grace(120)), None);
        assert_eq!(m.state(), HealthState::Unhealthy);
    }

    #[test]
    fn test_threshold_of_one_trips_on_first_post_grace_failure() {
        let mut m = HealthMonitor::new(GRACE, 1);
        assert_eq!(m.observe(false, Duration::from_secs(1)), None);
        assert_eq!(
            m.observe(false, after_grace(0)),
            Some(HealthState::Unhealthy)
        );
    }

    #[test]
    fn test_from_spec_uses_declared_timing() {
        let spec = HealthcheckSpec {
            path: "/health".to_string(),
            interval_seconds: 30,
            timeout_seconds: 10,
            grace_period_seconds: 60,
            failure_threshold: 3,
        };
        let mut m = HealthMonitor::from_spec(&spec);

        m.observe(false, Duration::from_secs(59));
        assert_eq!(m.consecutive_failures(), 0);
        m.observe(false, Duration::from_secs(60));
        assert_eq!(m.consecutive_failures(), 1);
    }
}
