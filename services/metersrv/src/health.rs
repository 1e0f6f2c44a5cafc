//! Device health and error recovery
//!
//! Detection is separated from transition: `record_error` only reports that
//! the grace period has run out, the caller then calls `mark_offline` and
//! emits a single notification for the state change.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Availability {
    Online,
    Offline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthState {
    pub availability: Availability,
    pub consecutive_errors: u32,
    /// First error of the current streak
    pub first_error_at: Option<Instant>,
}

impl Default for HealthState {
    fn default() -> Self {
        Self {
            availability: Availability::Online,
            consecutive_errors: 0,
            first_error_at: None,
        }
    }
}

#[derive(Debug)]
pub struct HealthMonitor {
    grace_period: Duration,
    state: RwLock<HealthState>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl HealthMonitor {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            grace_period,
            state: RwLock::new(HealthState::default()),
        }
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn snapshot(&self) -> HealthState {
        self.state.read().clone()
    }

    pub fn is_online(&self) -> bool {
        self.state.read().availability == Availability::Online
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.state.read().consecutive_errors
    }

    pub fn record_error(&self) -> bool {
        self.record_error_at(Instant::now())
    }

    /// Count one failure
    ///
    /// # Returns
    /// `true` while the device is still online and the current streak has
    /// outlasted the grace period. No transition happens here.
    pub fn record_error_at(&self, now: Instant) -> bool {
        let mut state = self.state.write();
        state.consecutive_errors = state.consecutive_errors.saturating_add(1);
        let first = *state.first_error_at.get_or_insert(now);

        state.availability == Availability::Online
            && now.saturating_duration_since(first) >= self.grace_period
    }

    pub fn is_in_grace_period(&self) -> bool {
        self.is_in_grace_period_at(Instant::now())
    }

    /// Whether the current error streak is younger than the grace period
    pub fn is_in_grace_period_at(&self, now: Instant) -> bool {
        match self.state.read().first_error_at {
            Some(first) => now.saturating_duration_since(first) < self.grace_period,
            None => false,
        }
    }

    /// Reset the streak and mark online; returns whether the device came back
    pub fn record_success(&self) -> bool {
        let mut state = self.state.write();
        let recovered = state.availability == Availability::Offline;
        if recovered {
            info!(
                "Device back online after {} consecutive errors",
                state.consecutive_errors
            );
        }
        state.consecutive_errors = 0;
        state.first_error_at = None;
        state.availability = Availability::Online;
        recovered
    }

    /// Returns whether the state changed
    pub fn mark_offline(&self) -> bool {
        let mut state = self.state.write();
        if state.availability == Availability::Offline {
            return false;
        }
        warn!(
            "Device offline after {} consecutive errors",
            state.consecutive_errors
        );
        state.availability = Availability::Offline;
        true
    }

    /// Returns whether the state changed
    pub fn mark_online(&self) -> bool {
        let mut state = self.state.write();
        if state.availability == Availability::Online {
            return false;
        }
        state.availability = Availability::Online;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_grace_period_then_single_offline_signal() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let t0 = Instant::now();

        assert!(!monitor.record_error_at(t0));
        assert!(!monitor.record_error_at(t0 + Duration::from_secs(10)));
        assert!(!monitor.record_error_at(t0 + Duration::from_secs(20)));
        assert!(monitor.is_online());
        assert!(monitor.is_in_grace_period_at(t0 + Duration::from_secs(20)));

        let after = t0 + Duration::from_secs(61);
        assert!(!monitor.is_in_grace_period_at(after));
        assert!(monitor.record_error_at(after));
        // Detection does not transition
        assert!(monitor.is_online());

        assert!(monitor.mark_offline());
        assert!(!monitor.is_online());
        assert!(!monitor.mark_offline());
        assert!(!monitor.record_error_at(after + Duration::from_secs(5)));
        assert_eq!(monitor.consecutive_errors(), 5);
    }

    #[test]
    fn test_grace_independent_of_error_count() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let t0 = Instant::now();
        for i in 0..100 {
            assert!(!monitor.record_error_at(t0 + Duration::from_millis(i)));
        }
        assert!(monitor.is_in_grace_period_at(t0 + Duration::from_secs(1)));
    }

    #[test]
    fn test_success_resets_streak() {
        let monitor = HealthMonitor::new(Duration::from_secs(60));
        let t0 = Instant::now();
        monitor.record_error_at(t0);
        assert!(monitor.record_error_at(t0 + Duration::from_secs(60)));
        monitor.mark_offline();

        assert!(monitor.record_success());
        assert!(monitor.is_online());
        assert!(!monitor.is_in_grace_period_at(t0 + Duration::from_secs(61)));
        assert!(!monitor.record_success());

        // A new streak starts from the next error
        assert!(!monitor.record_error_at(t0 + Duration::from_secs(100)));
        assert_eq!(monitor.snapshot().first_error_at, Some(t0 + Duration::from_secs(100)));
    }

    #[test]
    fn test_mark_online_reports_change() {
        let monitor = HealthMonitor::default();
        assert_eq!(monitor.grace_period(), DEFAULT_GRACE_PERIOD);
        assert!(!monitor.mark_online());
        monitor.mark_offline();
        assert!(monitor.mark_online());
    }
}
