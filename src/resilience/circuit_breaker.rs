//! Circuit breaker state machine.
//!
//! # States
//! - Closed: normal operation, requests pass through and outcomes are counted
//! - Open: dependency assumed down, requests fail fast until the timeout passes
//! - Half-Open: up to `max_requests` trial requests probe the dependency
//!
//! # State Transitions
//! ```text
//! Closed → Open: ready_to_trip(counts) after a failure
//! Open → Half-Open: now >= expiry (expiry = open time + timeout)
//! Half-Open → Closed: max_requests consecutive successes
//! Half-Open → Open: any failure
//! ```
//!
//! # Design Decisions
//! - Every transition starts a new generation and clears the counts
//! - Outcomes reported for an older generation are discarded
//! - A `Ticket` dropped without an outcome counts as a failure, so a cancelled
//!   or panicking call cannot leave a half-open trial slot occupied
//! - `on_state_change` runs while the breaker lock is held and must not call
//!   back into the same breaker

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Error;
use crate::observability::metrics;

pub const DEFAULT_MAX_REQUESTS: u32 = 100;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MIN_REQUESTS: u32 = 10;
pub const DEFAULT_FAILURE_RATIO: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request outcome counters for the current generation.
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
        self.requests = self.requests.saturating_add(1);
    }

    fn on_success(&mut self) {
        self.total_successes = self.total_successes.saturating_add(1);
        self.consecutive_successes = self.consecutive_successes.saturating_add(1);
        self.consecutive_failures = 0;
    }

    fn on_failure(&mut self) {
        self.total_failures = self.total_failures.saturating_add(1);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.consecutive_successes = 0;
    }

    fn clear(&mut self) {
        *self = Counts::default();
    }

    /// Failures over requests, 0.0 when nothing was counted.
    pub fn failure_ratio(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            f64::from(self.total_failures) / f64::from(self.requests)
        }
    }
}

pub type ReadyToTrip = Arc<dyn Fn(&Counts) -> bool + Send + Sync>;
pub type OnStateChange = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;
pub type IsSuccessful = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Trips once at least `min_requests` were seen and the failure ratio reaches `ratio`.
pub fn trip_on_failure_ratio(min_requests: u32, ratio: f64) -> ReadyToTrip {
    Arc::new(move |counts: &Counts| {
        counts.requests >= min_requests && counts.failure_ratio() >= ratio
    })
}

#[derive(Clone)]
pub struct BreakerSettings {
    disabled: bool,
    name: Option<String>,
    max_requests: u32,
    interval: Duration,
    timeout: Duration,
    ready_to_trip: ReadyToTrip,
    on_state_change: Option<OnStateChange>,
    is_successful: IsSuccessful,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            disabled: false,
            name: None,
            max_requests: DEFAULT_MAX_REQUESTS,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            ready_to_trip: trip_on_failure_ratio(DEFAULT_MIN_REQUESTS, DEFAULT_FAILURE_RATIO),
            on_state_change: None,
            // Anything that reached `after_request` as an error is a failure.
            is_successful: Arc::new(|_err| false),
        }
    }
}

impl fmt::Debug for BreakerSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BreakerSettings")
            .field("disabled", &self.disabled)
            .field("name", &self.name)
            .field("max_requests", &self.max_requests)
            .field("interval", &self.interval)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl BreakerSettings {
    pub fn builder() -> BreakerSettingsBuilder {
        BreakerSettingsBuilder::default()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Prefix used for default breaker keys.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Whether `err` should still count as a success.
    pub fn is_successful(&self, err: &Error) -> bool {
        (self.is_successful)(err)
    }
}

#[derive(Default)]
pub struct BreakerSettingsBuilder {
    settings: BreakerSettings,
}

impl BreakerSettingsBuilder {
    pub fn disabled(mut self, disabled: bool) -> Self {
        self.settings.disabled = disabled;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.settings.name = Some(name.into());
        self
    }

    /// Trial requests admitted while half-open, and successes needed to close.
    pub fn max_requests(mut self, max: u32) -> Self {
        self.settings.max_requests = max;
        self
    }

    /// Closed-state counting window. `Duration::ZERO` never resets the counts.
    pub fn interval(mut self, interval: Duration) -> Self {
        self.settings.interval = interval;
        self
    }

    /// Time spent open before probing.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.settings.timeout = timeout;
        self
    }

    pub fn ready_to_trip<F>(mut self, f: F) -> Self
    where
        F: Fn(&Counts) -> bool + Send + Sync + 'static,
    {
        self.settings.ready_to_trip = Arc::new(f);
        self
    }

    pub fn on_state_change<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.settings.on_state_change = Some(Arc::new(f));
        self
    }

    pub fn is_successful<F>(mut self, f: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.settings.is_successful = Arc::new(f);
        self
    }

    pub fn build(self) -> Result<BreakerSettings, Error> {
        if self.settings.max_requests == 0 {
            return Err(Error::config("circuit breaker max_requests must be positive"));
        }
        if self.settings.timeout.is_zero() {
            return Err(Error::config("circuit breaker timeout must be positive"));
        }
        Ok(self.settings)
    }
}

struct BreakerInner {
    state: CircuitState,
    generation: u64,
    counts: Counts,
    expiry: Option<Instant>,
}

/// A single named circuit breaker.
pub struct CircuitBreaker {
    name: String,
    settings: Arc<BreakerSettings>,
    inner: Mutex<BreakerInner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &inner.state)
            .field("generation", &inner.generation)
            .field("counts", &inner.counts)
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: Arc<BreakerSettings>) -> Self {
        let breaker = Self {
            name: name.into(),
            settings,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                generation: 0,
                counts: Counts::default(),
                expiry: None,
            }),
        };
        {
            let mut inner = breaker.inner.lock();
            breaker.new_generation(&mut inner, Instant::now());
        }
        breaker
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state, applying any time-based transition that is due.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now()).0
    }

    pub fn counts(&self) -> Counts {
        let mut inner = self.inner.lock();
        self.current_state(&mut inner, Instant::now());
        inner.counts
    }

    /// Ask for admission. The returned ticket must be settled with the
    /// outcome of the call; dropping it unsettled records a failure.
    pub fn allow(self: &Arc<Self>) -> Result<Ticket, Error> {
        let generation = self.before_request()?;
        Ok(Ticket {
            breaker: Arc::clone(self),
            generation,
            settled: false,
        })
    }

    /// Run `f` under the breaker.
    pub async fn call<F, Fut, T>(self: &Arc<Self>, f: F) -> Result<T, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, Error>>,
    {
        let ticket = self.allow()?;
        let result = f().await;
        ticket.record(&result);
        result
    }

    fn before_request(&self) -> Result<u64, Error> {
        let mut inner = self.inner.lock();
        let (state, generation) = self.current_state(&mut inner, Instant::now());
        match state {
            CircuitState::Open => Err(Error::CircuitOpen {
                name: self.name.clone(),
            }),
            CircuitState::HalfOpen if inner.counts.requests >= self.settings.max_requests => {
                Err(Error::TooManyRequests {
                    name: self.name.clone(),
                })
            }
            _ => {
                inner.counts.on_request();
                Ok(generation)
            }
        }
    }

    fn after_request(&self, before: u64, success: bool) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let (state, generation) = self.current_state(&mut inner, now);
        if generation != before {
            return;
        }
        if success {
            self.on_success(&mut inner, state, now);
        } else {
            self.on_failure(&mut inner, state, now);
        }
    }

    fn on_success(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => inner.counts.on_success(),
            CircuitState::HalfOpen => {
                inner.counts.on_success();
                if inner.counts.consecutive_successes >= self.settings.max_requests {
                    self.set_state(inner, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        match state {
            CircuitState::Closed => {
                inner.counts.on_failure();
                if (self.settings.ready_to_trip)(&inner.counts) {
                    self.set_state(inner, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => self.set_state(inner, CircuitState::Open, now),
            CircuitState::Open => {}
        }
    }

    fn current_state(&self, inner: &mut BreakerInner, now: Instant) -> (CircuitState, u64) {
        match inner.state {
            CircuitState::Closed => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    self.new_generation(inner, now);
                }
            }
            CircuitState::Open => {
                if matches!(inner.expiry, Some(expiry) if expiry <= now) {
                    self.set_state(inner, CircuitState::HalfOpen, now);
                }
            }
            CircuitState::HalfOpen => {}
        }
        (inner.state, inner.generation)
    }

    fn set_state(&self, inner: &mut BreakerInner, to: CircuitState, now: Instant) {
        let from = inner.state;
        if from == to {
            return;
        }
        inner.state = to;
        self.new_generation(inner, now);

        tracing::info!(breaker = %self.name, from = %from, to = %to, "Circuit breaker state changed");
        metrics::record_circuit_state(&self.name, to);
        if let Some(on_change) = &self.settings.on_state_change {
            on_change(&self.name, from, to);
        }
    }

    fn new_generation(&self, inner: &mut BreakerInner, now: Instant) {
        inner.generation += 1;
        inner.counts.clear();
        inner.expiry = match inner.state {
            CircuitState::Closed if self.settings.interval.is_zero() => None,
            CircuitState::Closed => Some(now + self.settings.interval),
            CircuitState::Open => Some(now + self.settings.timeout),
            CircuitState::HalfOpen => None,
        };
    }
}

/// Admission granted by `CircuitBreaker::allow`.
#[must_use = "an unsettled ticket records a failure when dropped"]
pub struct Ticket {
    breaker: Arc<CircuitBreaker>,
    generation: u64,
    settled: bool,
}

impl Ticket {
    pub fn success(mut self) {
        self.settle(true);
    }

    pub fn failure(mut self) {
        self.settle(false);
    }

    /// Classify `result` using the breaker's `is_successful` predicate.
    pub fn record<T>(mut self, result: &Result<T, Error>) {
        let success = match result {
            Ok(_) => true,
            Err(err) => self.breaker.settings.is_successful(err),
        };
        self.settle(success);
    }

    fn settle(&mut self, success: bool) {
        if !self.settled {
            self.settled = true;
            self.breaker.after_request(self.generation, success);
        }
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        self.settle(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;

    fn breaker(settings: BreakerSettings) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new("test", Arc::new(settings)))
    }

    fn trip_after(failures: u32) -> BreakerSettingsBuilder {
        BreakerSettings::builder()
            .max_requests(1)
            .timeout(Duration::from_millis(100))
            .ready_to_trip(move |c| c.consecutive_failures >= failures)
    }

    #[tokio::test(start_paused = true)]
    async fn trips_and_recovers() {
        let cb = breaker(trip_after(2).build().unwrap());

        cb.allow().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.allow().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(matches!(cb.allow(), Err(Error::CircuitOpen { .. })));

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let probe = cb.allow().unwrap();
        assert!(matches!(cb.allow(), Err(Error::TooManyRequests { .. })));
        probe.success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.counts(), Counts::default());
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_reopens() {
        let cb = breaker(trip_after(1).build().unwrap());
        cb.allow().unwrap().failure();
        tokio::time::advance(Duration::from_millis(100)).await;

        cb.allow().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_needs_max_requests_successes() {
        let cb = breaker(
            BreakerSettings::builder()
                .max_requests(3)
                .timeout(Duration::from_millis(10))
                .ready_to_trip(|c| c.consecutive_failures >= 1)
                .build()
                .unwrap(),
        );
        cb.allow().unwrap().failure();
        tokio::time::advance(Duration::from_millis(10)).await;

        let trials: Vec<_> = (0..3).map(|_| cb.allow().unwrap()).collect();
        assert!(matches!(cb.allow(), Err(Error::TooManyRequests { .. })));
        let mut trials = trials.into_iter();
        trials.next().unwrap().success();
        trials.next().unwrap().success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        trials.next().unwrap().success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_generation_outcomes_are_ignored() {
        let cb = breaker(trip_after(1).build().unwrap());
        let slow = cb.allow().unwrap();
        cb.allow().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Open);

        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        slow.success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.counts().total_successes, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn half_open_failure_wins_over_concurrent_success() {
        let cb = breaker(trip_after(1).max_requests(2).build().unwrap());
        cb.allow().unwrap().failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        let failing = cb.allow().unwrap();
        let succeeding = cb.allow().unwrap();
        failing.failure();
        assert_eq!(cb.state(), CircuitState::Open);

        succeeding.success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.counts(), Counts::default());

        // Expiry restarted at the failure.
        tokio::time::advance(Duration::from_millis(99)).await;
        assert_eq!(cb.state(), CircuitState::Open);
        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[tokio::test(start_paused = true)]
    async fn closed_counts_reset_every_interval() {
        let cb = breaker(
            BreakerSettings::builder()
                .interval(Duration::from_secs(1))
                .ready_to_trip(|c| c.total_failures >= 3)
                .build()
                .unwrap(),
        );
        cb.allow().unwrap().failure();
        cb.allow().unwrap().failure();
        assert_eq!(cb.counts().total_failures, 2);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(cb.counts(), Counts::default());
        cb.allow().unwrap().failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn dropped_ticket_counts_as_failure() {
        let cb = breaker(trip_after(1).build().unwrap());
        drop(cb.allow().unwrap());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn is_successful_predicate_classifies_errors() {
        let cb = breaker(
            trip_after(1)
                .is_successful(|err| matches!(err, Error::Handler(_)))
                .build()
                .unwrap(),
        );
        let res: Result<(), Error> = cb.call(|| async { Err(Error::handler("not found")) }).await;
        assert!(res.is_err());
        assert_eq!(cb.state(), CircuitState::Closed);

        let _ = cb.call(|| async { Err::<(), _>(Error::DeadlineExceeded) }).await;
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn state_changes_are_reported() {
        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let cb = breaker(
            trip_after(1)
                .on_state_change(move |name, from, to| {
                    sink.lock().push(format!("{name}:{from}->{to}"));
                })
                .build()
                .unwrap(),
        );
        cb.allow().unwrap().failure();
        tokio::time::advance(Duration::from_millis(100)).await;
        cb.allow().unwrap().success();

        assert_eq!(
            *seen.lock(),
            vec![
                "test:closed->open".to_string(),
                "test:open->half-open".to_string(),
                "test:half-open->closed".to_string(),
            ]
        );
    }

    #[test]
    fn default_trip_rule() {
        let trip = trip_on_failure_ratio(DEFAULT_MIN_REQUESTS, DEFAULT_FAILURE_RATIO);
        let mut counts = Counts {
            requests: 9,
            total_failures: 9,
            ..Counts::default()
        };
        assert!(!trip(&counts));
        counts.requests = 10;
        counts.total_failures = 5;
        assert!(trip(&counts));
        counts.total_failures = 4;
        assert!(!trip(&counts));
    }

    #[test]
    fn invalid_settings_are_rejected() {
        assert!(BreakerSettings::builder().max_requests(0).build().is_err());
        assert!(BreakerSettings::builder().timeout(Duration::ZERO).build().is_err());
    }
}
