//! Per-service circuit breaker.
//!
//! Trips on a failure ratio measured over a rolling window, blocks checks
//! while open, and admits a bounded number of probe checks once the
//! cooldown has elapsed. Every state change starts a new generation;
//! outcomes reported against an older generation are discarded.

use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{info, warn};

/// Tuning for a circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct BreakerSettings {
    /// Minimum checks in the window before the ratio is considered.
    pub min_requests: u32,
    /// Failure ratio at or above which the breaker trips.
    pub failure_ratio: f64,
    /// Closed-state counting window. Zero disables periodic reset.
    pub interval: Duration,
    /// Time spent open before admitting probes.
    pub cooldown: Duration,
    /// Probes admitted while half-open; this many consecutive
    /// successes close the breaker.
    pub half_open_max_requests: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            min_requests: 5,
            failure_ratio: 0.6,
            interval: Duration::from_secs(60),
            cooldown: Duration::from_secs(60),
            half_open_max_requests: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for BreakerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half-open",
        })
    }
}

/// Counters for the current generation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub requests: u32,
    pub total_successes: u32,
    pub total_failures: u32,
    pub consecutive_successes: u32,
    pub consecutive_failures: u32,
}

impl Counts {
    fn on_request(&mut self) {
        self.requests += 1;
    }

    fn on_success(&mut self) {
        self.total_successes += 1;
        self.consecutive_successes += 1;
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures += 1;
        self.consecutive_failures += 1;
        self.consecutive_successes = 0;
    }
}

/// Why a check was not admitted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BreakerRejection {
    #[error("circuit breaker open")]
    Open,

    #[error("circuit breaker half-open: probe limit reached")]
    TooManyProbes,
}

/// Admission token; hand it back through `record` or `abandon`.
#[derive(Debug)]
#[must_use]
pub struct BreakerTicket {
    generation: u64,
}

#[derive(Debug)]
struct Inner {
    state: BreakerState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let now = Instant::now();
        let expiry = (!settings.interval.is_zero()).then(|| now + settings.interval);
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> BreakerState {
        self.state_at(Instant::now())
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        inner.counts
    }

    /// Ask to run a check.
    pub fn admit(&self) -> Result<BreakerTicket, BreakerRejection> {
        self.admit_at(Instant::now())
    }

    /// Report the outcome of an admitted check.
    pub fn record(&self, ticket: BreakerTicket, success: bool) {
        self.record_at(ticket, success, Instant::now())
    }

    /// Return a ticket whose check produced no evidence (e.g. it was
    /// cancelled). Frees the half-open slot without counting an outcome.
    pub fn abandon(&self, ticket: BreakerTicket) {
        let mut inner = self.lock();
        self.refresh(&mut inner, Instant::now());
        if inner.generation == ticket.generation {
            inner.counts.requests = inner.counts.requests.saturating_sub(1);
        }
    }

    fn state_at(&self, now: Instant) -> BreakerState {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        inner.state
    }

    fn admit_at(&self, now: Instant) -> Result<BreakerTicket, BreakerRejection> {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        match inner.state {
            BreakerState::Open => return Err(BreakerRejection::Open),
            BreakerState::HalfOpen if inner.counts.requests >= self.settings.half_open_max_requests => {
                return Err(BreakerRejection::TooManyProbes);
            }
            _ => {}
        }
        inner.counts.on_request();
        Ok(BreakerTicket {
            generation: inner.generation,
        })
    }

    fn record_at(&self, ticket: BreakerTicket, success: bool, now: Instant) {
        let mut inner = self.lock();
        self.refresh(&mut inner, now);
        if inner.generation != ticket.generation {
            return;
        }

        match (inner.state, success) {
            (BreakerState::Closed, true) => inner.counts.on_success(),
            (BreakerState::Closed, false) => {
                inner.counts.on_failure();
                if self.ready_to_trip(&inner.counts) {
                    self.transition(&mut inner, BreakerState::Open, now);
                }
            }
            (BreakerState::HalfOpen, true) => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.half_open_max_requests {
                    self.transition(&mut inner, BreakerState::Closed, now);
                }
            }
            (BreakerState::HalfOpen, false) => self.transition(&mut inner, BreakerState::Open, now),
            (BreakerState::Open, _) => {}
        }
    }

    fn ready_to_trip(&self, counts: &Counts) -> bool {
        counts.requests >= self.settings.min_requests
            && f64::from(counts.total_failures) / f64::from(counts.requests)
                >= self.settings.failure_ratio
    }

    /// Apply time-based transitions: window reset while closed, and
    /// open -> half-open after the cooldown.
    fn refresh(&self, inner: &mut Inner, now: Instant) {
        match inner.state {
            BreakerState::Closed => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    self.new_generation(inner, now);
                }
            }
            BreakerState::Open => {
                if inner.expiry.is_some_and(|e| e <= now) {
                    self.transition(inner, BreakerState::HalfOpen, now);
                }
            }
            BreakerState::HalfOpen => {}
        }
    }

    fn transition(&self, inner: &mut Inner, to: BreakerState, now: Instant) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        self.new_generation(inner, now);

        match to {
            BreakerState::Open => {
                warn!(service = %self.name, %from, %to, "circuit breaker state changed")
            }
            _ => info!(service = %self.name, %from, %to, "circuit breaker state changed"),
        }
    }

    fn new_generation(&self, inner: &mut Inner, now: Instant) {
        inner.generation += 1;
        inner.counts = Counts::default();
        inner.expiry = match inner.state {
            BreakerState::Closed if self.settings.interval.is_zero() => None,
            BreakerState::Closed => Some(now + self.settings.interval),
            BreakerState::Open => Some(now + self.settings.cooldown),
            BreakerState::HalfOpen => None,
        };
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new("api", BreakerSettings::default())
    }

    fn run(cb: &CircuitBreaker, success: bool, now: Instant) {
        let ticket = cb.admit_at(now).unwrap();
        cb.record_at(ticket, success, now);
    }

    #[test]
    fn stays_closed_below_min_requests() {
        let cb = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            run(&cb, false, now);
        }
        assert_eq!(cb.state_at(now), BreakerState::Closed);
        assert_eq!(cb.counts().total_failures, 4);
    }

    #[test]
    fn trips_at_failure_ratio() {
        let cb = breaker();
        let now = Instant::now();
        run(&cb, true, now);
        run(&cb, true, now);
        run(&cb, false, now);
        run(&cb, false, now);
        // 2/4, below min requests.
        assert_eq!(cb.state_at(now), BreakerState::Closed);
        run(&cb, false, now);
        // 3/5 = 0.6
        assert_eq!(cb.state_at(now), BreakerState::Open);
        assert_eq!(cb.admit_at(now).unwrap_err(), BreakerRejection::Open);
    }

    #[test]
    fn healthy_majority_keeps_closed() {
        let cb = breaker();
        let now = Instant::now();
        for i in 0..10 {
            run(&cb, i % 3 != 0, now);
        }
        assert_eq!(cb.state_at(now), BreakerState::Closed);
    }

    #[test]
    fn window_expiry_resets_counts() {
        let cb = breaker();
        let now = Instant::now();
        for _ in 0..4 {
            run(&cb, false, now);
        }
        let later = now + Duration::from_secs(61);
        run(&cb, false, later);
        assert_eq!(cb.state_at(later), BreakerState::Closed);
    }

    #[test]
    fn cooldown_leads_to_half_open_then_closed() {
        let cb = breaker();
        let now = Instant::now();
        for _ in 0..5 {
            run(&cb, false, now);
        }
        assert_eq!(cb.state_at(now), BreakerState::Open);

        let after = now + Duration::from_secs(61);
        assert_eq!(cb.state_at(after), BreakerState::HalfOpen);

        let t1 = cb.admit_at(after).unwrap();
        let t2 = cb.admit_at(after).unwrap();
        let t3 = cb.admit_at(after).unwrap();
        assert_eq!(cb.admit_at(after).unwrap_err(), BreakerRejection::TooManyProbes);

        cb.record_at(t1, true, after);
        cb.record_at(t2, true, after);
        assert_eq!(cb.state_at(after), BreakerState::HalfOpen);
        cb.record_at(t3, true, after);
        assert_eq!(cb.state_at(after), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let cb = breaker();
        let now = Instant::now();
        for _ in 0..5 {
            run(&cb, false, now);
        }
        let after = now + Duration::from_secs(61);
        run(&cb, false, after);
        assert_eq!(cb.state_at(after), BreakerState::Open);
    }

    #[test]
    fn stale_generation_outcomes_are_ignored() {
        let cb = breaker();
        let now = Instant::now();
        let stale = cb.admit_at(now).unwrap();
        // The outstanding ticket counts as a request: 4 failures of 5 trip.
        for _ in 0..4 {
            run(&cb, false, now);
        }
        assert_eq!(cb.state_at(now), BreakerState::Open);
        assert_eq!(cb.admit_at(now).unwrap_err(), BreakerRejection::Open);
        let after = now + Duration::from_secs(61);
        assert_eq!(cb.state_at(after), BreakerState::HalfOpen);
        cb.record_at(stale, false, after);
        assert_eq!(cb.state_at(after), BreakerState::HalfOpen);
    }

    #[test]
    fn abandon_frees_half_open_slot() {
        let cb = breaker();
        let now = Instant::now();
        for _ in 0..5 {
            run(&cb, false, now);
        }
        let after = now + Duration::from_secs(61);
        cb.state_at(after);
        let tickets: Vec<_> = (0..3).map(|_| cb.admit_at(after).unwrap()).collect();
        assert!(cb.admit_at(after).is_err());
        for t in tickets {
            cb.abandon(t);
        }
        assert!(cb.admit_at(after).is_ok());
    }
}
