//! Per-host circuit breaker
//!
//! Tracks connection failures per host and short-circuits attempts to
//! hosts that keep failing, so a dead engine costs nothing after the
//! first few tries. Pure state machine: every time-dependent method
//! takes `now` explicitly and no method blocks or sleeps.
//!
//! Transitions:
//!   closed --(threshold failures in window)--> open
//!   open --(cooldown elapsed, first caller)--> half-open probe
//!   half-open --(probe success)--> closed, cooldown reset
//!   half-open --(probe failure)--> open, cooldown doubled (capped)

use crate::config::BreakerConfig;
use crate::error::UnavailableReason;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Attempts flow normally
    Closed,
    /// Attempts are rejected until the cooldown elapses
    Open,
    /// One probe attempt is in flight; everyone else is rejected
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        write!(f, "{}", s)
    }
}

/// What kind of attempt a successful acquire represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permit {
    /// Ordinary attempt through a closed breaker
    Normal,
    /// The single half-open probe
    Probe,
}

/// Snapshot of a breaker for operators
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    /// Current state
    pub state: CircuitState,
    /// Failures currently inside the sliding window
    pub recent_failures: u32,
    /// When the breaker last opened, if it is not closed
    pub opened_at: Option<DateTime<Utc>>,
    /// Seconds until a probe will be allowed, when open
    pub cooldown_remaining_secs: Option<u64>,
}

/// Failure-driven gate in front of one host's connection builds
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: CircuitState,
    /// Failure timestamps inside the sliding window (closed state only)
    failures: VecDeque<Instant>,
    /// Current open-state cooldown; doubles on each failed probe
    cooldown: Duration,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(config: BreakerConfig) -> Self {
        let cooldown = config.cooldown();
        Self {
            config,
            state: CircuitState::Closed,
            failures: VecDeque::new(),
            cooldown,
            opened_at: None,
            opened_at_wall: None,
            probe_in_flight: false,
        }
    }

    /// Ask permission for a connection attempt.
    ///
    /// An `Err` means nothing was tried: no network, no process, no
    /// credential work. A `Probe` permit is exclusive; the caller must
    /// resolve it with `record_success` or `record_failure`.
    pub fn try_acquire(&mut self, now: Instant) -> Result<Permit, UnavailableReason> {
        match self.state {
            CircuitState::Closed => Ok(Permit::Normal),
            CircuitState::Open => {
                let reopen_at = self.opened_at.map(|t| t + self.cooldown);
                if reopen_at.is_some_and(|t| now >= t) {
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Ok(Permit::Probe)
                } else {
                    Err(UnavailableReason::CircuitOpen)
                }
            }
            CircuitState::HalfOpen => {
                if self.probe_in_flight {
                    Err(UnavailableReason::ProbeInProgress)
                } else {
                    self.probe_in_flight = true;
                    Ok(Permit::Probe)
                }
            }
        }
    }

    /// A build succeeded: close the breaker and forget all history
    pub fn record_success(&mut self) {
        self.state = CircuitState::Closed;
        self.failures.clear();
        self.cooldown = self.config.cooldown();
        self.opened_at = None;
        self.opened_at_wall = None;
        self.probe_in_flight = false;
    }

    /// A build failed
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            CircuitState::HalfOpen => {
                // failed probe: reopen with a longer cooldown
                self.cooldown = (self.cooldown * 2).min(self.config.max_cooldown());
                self.open(now);
            }
            CircuitState::Closed => {
                self.prune(now);
                self.failures.push_back(now);
                if self.failures.len() as u32 >= self.config.failure_threshold {
                    self.open(now);
                }
            }
            // a straggling failure while already open changes nothing
            CircuitState::Open => {}
        }
    }

    /// The attempt resolved without ever contacting the host (credential
    /// or store failure): release the probe slot without counting a
    /// remote failure.
    pub fn abandon_probe(&mut self) {
        self.probe_in_flight = false;
    }

    /// Operator override: force the breaker closed
    pub fn reset(&mut self) {
        self.record_success();
    }

    /// Snapshot for the operational API
    pub fn status(&self, now: Instant) -> BreakerStatus {
        let cooldown_remaining_secs = match (self.state, self.opened_at) {
            (CircuitState::Open, Some(opened)) => Some(
                (opened + self.cooldown)
                    .saturating_duration_since(now)
                    .as_secs(),
            ),
            _ => None,
        };
        BreakerStatus {
            state: self.state,
            recent_failures: self.failures.len() as u32,
            opened_at: self.opened_at_wall,
            cooldown_remaining_secs,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.failures.clear();
        self.opened_at = Some(now);
        self.opened_at_wall = Some(Utc::now());
        self.probe_in_flight = false;
    }

    fn prune(&mut self, now: Instant) {
        let window = self.config.failure_window();
        while let Some(first) = self.failures.front() {
            if now.duration_since(*first) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(BreakerConfig::default())
    }

    fn open_breaker(b: &mut CircuitBreaker, now: Instant) {
        for _ in 0..3 {
            b.record_failure(now);
        }
        assert_eq!(b.state, CircuitState::Open);
    }

    #[test]
    fn test_closed_admits_normally() {
        let mut b = breaker();
        let now = Instant::now();
        assert_eq!(b.try_acquire(now), Ok(Permit::Normal));
        b.record_failure(now);
        b.record_failure(now);
        // two failures: still closed
        assert_eq!(b.try_acquire(now), Ok(Permit::Normal));
    }

    #[test]
    fn test_threshold_failures_open() {
        let mut b = breaker();
        let now = Instant::now();
        open_breaker(&mut b, now);
        assert_eq!(b.try_acquire(now), Err(UnavailableReason::CircuitOpen));
    }

    #[test]
    fn test_old_failures_fall_out_of_window() {
        let mut b = breaker();
        let start = Instant::now();
        b.record_failure(start);
        b.record_failure(start);
        // third failure lands after the first two have aged out
        b.record_failure(start + Duration::from_secs(61));
        assert_eq!(b.state, CircuitState::Closed);
    }

    #[test]
    fn test_single_probe_after_cooldown() {
        let mut b = breaker();
        let now = Instant::now();
        open_breaker(&mut b, now);

        let after = now + Duration::from_secs(31);
        assert_eq!(b.try_acquire(after), Ok(Permit::Probe));
        // second caller during the probe is rejected, not queued
        assert_eq!(
            b.try_acquire(after),
            Err(UnavailableReason::ProbeInProgress)
        );
    }

    #[test]
    fn test_probe_success_closes_and_resets_cooldown() {
        let mut b = breaker();
        let now = Instant::now();
        open_breaker(&mut b, now);
        let after = now + Duration::from_secs(31);
        assert_eq!(b.try_acquire(after), Ok(Permit::Probe));

        b.record_success();
        assert_eq!(b.state, CircuitState::Closed);
        assert_eq!(b.try_acquire(after), Ok(Permit::Normal));
        assert_eq!(b.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_probe_failure_doubles_cooldown() {
        let mut b = breaker();
        let mut now = Instant::now();
        open_breaker(&mut b, now);

        // first probe fails: cooldown 30 -> 60
        now += Duration::from_secs(31);
        assert_eq!(b.try_acquire(now), Ok(Permit::Probe));
        b.record_failure(now);
        assert_eq!(b.state, CircuitState::Open);
        assert_eq!(b.cooldown, Duration::from_secs(60));

        // 31s later is not enough any more
        assert_eq!(
            b.try_acquire(now + Duration::from_secs(31)),
            Err(UnavailableReason::CircuitOpen)
        );
        assert_eq!(
            b.try_acquire(now + Duration::from_secs(61)),
            Ok(Permit::Probe)
        );
    }

    #[test]
    fn test_cooldown_caps_at_max() {
        let mut b = breaker();
        let mut now = Instant::now();
        open_breaker(&mut b, now);

        // fail probes until the doubling saturates
        for _ in 0..10 {
            now += Duration::from_secs(601);
            if b.try_acquire(now) == Ok(Permit::Probe) {
                b.record_failure(now);
            }
        }
        assert_eq!(b.cooldown, Duration::from_secs(600));
    }

    #[test]
    fn test_abandoned_probe_frees_the_slot() {
        let mut b = breaker();
        let now = Instant::now();
        open_breaker(&mut b, now);
        let after = now + Duration::from_secs(31);
        assert_eq!(b.try_acquire(after), Ok(Permit::Probe));

        // probe never reached the network: slot opens up again without
        // counting a failure or touching the cooldown
        b.abandon_probe();
        assert_eq!(b.try_acquire(after), Ok(Permit::Probe));
        assert_eq!(b.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_admin_reset_closes_immediately() {
        let mut b = breaker();
        let now = Instant::now();
        open_breaker(&mut b, now);

        b.reset();
        assert_eq!(b.try_acquire(now), Ok(Permit::Normal));
        assert_eq!(b.cooldown, Duration::from_secs(30));
    }

    #[test]
    fn test_status_snapshot() {
        let mut b = breaker();
        let now = Instant::now();

        let status = b.status(now);
        assert_eq!(status.state, CircuitState::Closed);
        assert_eq!(status.recent_failures, 0);
        assert!(status.opened_at.is_none());

        b.record_failure(now);
        assert_eq!(b.status(now).recent_failures, 1);

        open_breaker(&mut b, now);
        let status = b.status(now + Duration::from_secs(10));
        assert_eq!(status.state, CircuitState::Open);
        assert!(status.opened_at.is_some());
        assert_eq!(status.cooldown_remaining_secs, Some(20));
    }

    #[test]
    fn test_straggler_failure_while_open_ignored() {
        let mut b = breaker();
        let now = Instant::now();
        open_breaker(&mut b, now);
        let cooldown_before = b.cooldown;
        b.record_failure(now + Duration::from_secs(5));
        assert_eq!(b.cooldown, cooldown_before);
        assert_eq!(b.state, CircuitState::Open);
    }
}
