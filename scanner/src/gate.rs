use std::time::{Duration, Instant};
use tracing::debug;

/// Submission gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Open,
    /// No submissions until `until`.
    Closed { until: Instant },
}

/// Accept-triggered cool-down gate.
///
/// Closed right after a new code is accepted so the same physical target is
/// not re-read while it is still in view. Reopening is deadline-based: the
/// first `is_open` check at or after the deadline flips the state back.
#[derive(Debug, Clone)]
pub struct Gate {
    state: GateState,
    cooldown: Duration,
}

impl Gate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            state: GateState::Open,
            cooldown,
        }
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Close the gate for `duration` starting at `now`.
    pub fn close(&mut self, now: Instant, duration: Duration) {
        let until = now + duration;
        debug!(cooldown_ms = duration.as_millis() as u64, "gate closed");
        self.state = GateState::Closed { until };
    }

    /// Close the gate for the configured cool-down.
    pub fn close_for_cooldown(&mut self, now: Instant) {
        self.close(now, self.cooldown);
    }

    /// `true` when open, reopening the gate if its deadline has passed.
    pub fn is_open(&mut self, now: Instant) -> bool {
        match self.state {
            GateState::Open => true,
            GateState::Closed { until } if now >= until => {
                debug!("gate reopened");
                self.state = GateState::Open;
                true
            }
            GateState::Closed { .. } => false,
        }
    }
}

/// Minimum spacing between decode submissions.
///
/// Independent of the gate: caps decode attempts under a high frame rate.
/// A zero interval disables it.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    min_interval: Duration,
    last: Option<Instant>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: None,
        }
    }

    pub fn is_ready(&self, now: Instant) -> bool {
        match self.last {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.min_interval,
        }
    }

    /// Record a submission at `now`.
    pub fn record(&mut self, now: Instant) {
        self.last = Some(now);
    }
}
