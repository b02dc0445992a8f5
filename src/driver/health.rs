//! Driver start supervision: degraded tracking and retry backoff.

use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;

/// Exponential backoff with bounded random jitter.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Fraction of the delay added as random jitter, in [0, 1].
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(30),
            max: Duration::from_secs(1800),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures (>= 1).
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let raw = self.base.saturating_mul(1u32 << exponent).min(self.max);
        if self.jitter <= 0.0 {
            return raw;
        }
        let spread = rand::thread_rng().gen_range(0.0..=self.jitter.min(1.0));
        raw + raw.mul_f64(spread)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverState {
    /// Not started yet
    Pending,
    Started,
    /// Last start failed; retried after `next_retry`
    Degraded,
    Stopped,
}

/// Per-client driver supervision record.
#[derive(Clone, Debug)]
pub struct DriverHealth {
    pub state: DriverState,
    pub consecutive_failures: u32,
    pub next_retry: Option<Instant>,
    pub last_error: Option<String>,
    pub decision_failures: u64,
    /// Decision failures since the last applied decision or start
    pub decision_streak: u32,
}

impl Default for DriverHealth {
    fn default() -> Self {
        Self {
            state: DriverState::Pending,
            consecutive_failures: 0,
            next_retry: None,
            last_error: None,
            decision_failures: 0,
            decision_streak: 0,
        }
    }
}

impl DriverHealth {
    /// True when the supervisor should attempt `start()` at `now`.
    pub fn start_due(&self, now: Instant) -> bool {
        match self.state {
            DriverState::Pending => true,
            DriverState::Degraded => self.next_retry.map_or(true, |at| now >= at),
            DriverState::Started | DriverState::Stopped => false,
        }
    }

    pub fn record_started(&mut self) {
        self.state = DriverState::Started;
        self.consecutive_failures = 0;
        self.next_retry = None;
        self.last_error = None;
        self.decision_streak = 0;
    }

    /// Marks the driver degraded and schedules the next attempt. Returns the delay.
    pub fn record_start_failure(
        &mut self,
        error: &str,
        now: Instant,
        policy: &BackoffPolicy,
    ) -> Duration {
        self.state = DriverState::Degraded;
        self.consecutive_failures += 1;
        let delay = policy.delay(self.consecutive_failures);
        self.next_retry = Some(now + delay);
        self.last_error = Some(error.to_string());
        delay
    }

    /// Counts a failed `apply_decision`. Returns the current streak.
    pub fn record_decision_failure(&mut self, error: &str) -> u32 {
        self.decision_failures += 1;
        self.decision_streak += 1;
        self.last_error = Some(error.to_string());
        self.decision_streak
    }

    pub fn record_decision_applied(&mut self) {
        self.decision_streak = 0;
    }

    /// A started driver lost its device: degrade it so the supervisor
    /// restarts it after the backoff delay.
    pub fn record_connection_lost(
        &mut self,
        error: &str,
        now: Instant,
        policy: &BackoffPolicy,
    ) -> Duration {
        self.decision_streak = 0;
        self.record_start_failure(error, now, policy)
    }

    pub fn is_degraded(&self) -> bool {
        self.state == DriverState::Degraded
    }
}
