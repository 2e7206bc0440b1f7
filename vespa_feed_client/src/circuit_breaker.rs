use std::{
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, Ordering},
    },
    time::Duration,
};

use vespa_feed_time::TimeProvider;

use crate::OperationResult;

const NO_FAILURE: i64 = i64::MAX;

/// Health signal of a [`CircuitBreaker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Operations are succeeding, or failures are recent
    Closed,
    /// Failures have persisted beyond the grace period; feed cautiously
    HalfOpen,
    /// Failures have persisted beyond the doom period; stop feeding
    Open,
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::HalfOpen => write!(f, "half-open"),
            Self::Open => write!(f, "open"),
        }
    }
}

/// Detects sustained failure from the time elapsed since the oldest unresolved failure
///
/// The state is computed lazily in [`CircuitBreaker::state`]. Once the breaker is
/// [`CircuitState::Open`] it stays open; recovering requires a new breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    grace: i64,
    doom: i64,
    failing_since_millis: AtomicI64,
    half_open: AtomicBool,
    open: AtomicBool,
    time_provider: Arc<dyn TimeProvider>,
}

impl CircuitBreaker {
    /// Create a breaker that goes half-open after failing for longer than `grace`, and open
    /// after failing for longer than `doom`. A zero `doom` means the breaker never opens.
    pub fn new(grace: Duration, doom: Duration, time_provider: Arc<dyn TimeProvider>) -> Self {
        let millis = |d: Duration| i64::try_from(d.as_millis()).unwrap_or(i64::MAX);
        Self {
            grace: millis(grace),
            doom: millis(doom),
            failing_since_millis: AtomicI64::new(NO_FAILURE),
            half_open: AtomicBool::new(false),
            open: AtomicBool::new(false),
            time_provider,
        }
    }

    pub fn success(&self) {
        self.failing_since_millis.store(NO_FAILURE, Ordering::SeqCst);
        if !self.open.load(Ordering::SeqCst) {
            self.half_open.store(false, Ordering::SeqCst);
        }
    }

    /// Record a failure; only the first failure after a success starts the clock
    pub fn failure(&self) {
        let now = self.time_provider.now().timestamp_millis();
        let _ = self.failing_since_millis.compare_exchange(
            NO_FAILURE,
            now,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    /// Apply the outcome of one operation
    pub fn observe(&self, result: &OperationResult) {
        if result.success() {
            self.success();
        } else if result.is_failure() {
            self.failure();
        }
    }

    pub fn state(&self) -> CircuitState {
        let failing_since = self.failing_since_millis.load(Ordering::SeqCst);
        if failing_since != NO_FAILURE {
            let now = self.time_provider.now().timestamp_millis();
            let failing_for = now.saturating_sub(failing_since);
            if failing_for > self.grace {
                self.half_open.store(true, Ordering::SeqCst);
            }
            if self.doom > 0 && failing_for > self.doom {
                self.open.store(true, Ordering::SeqCst);
            }
        }

        if self.open.load(Ordering::SeqCst) {
            CircuitState::Open
        } else if self.half_open.load(Ordering::SeqCst) {
            CircuitState::HalfOpen
        } else {
            CircuitState::Closed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Status;
    use vespa_feed_document::DocumentId;
    use vespa_feed_time::{MockProvider, Time};

    fn breaker(grace: u64, doom: u64) -> (CircuitBreaker, Arc<MockProvider>) {
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let breaker = CircuitBreaker::new(
            Duration::from_secs(grace),
            Duration::from_secs(doom),
            Arc::clone(&time_provider) as _,
        );
        (breaker, time_provider)
    }

    #[test]
    fn closed_without_failures() {
        let (breaker, clock) = breaker(10, 60);
        assert_eq!(breaker.state(), CircuitState::Closed);
        clock.inc(Duration::from_secs(3600));
        assert_eq!(breaker.state(), CircuitState::Closed);
        breaker.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn half_open_after_grace() {
        let (breaker, clock) = breaker(10, 60);
        breaker.failure();
        clock.inc(Duration::from_secs(10));
        assert_eq!(breaker.state(), CircuitState::Closed);
        clock.inc(Duration::from_millis(1));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.success();
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[test]
    fn first_failure_starts_the_clock() {
        let (breaker, clock) = breaker(10, 60);
        breaker.failure();
        clock.inc(Duration::from_secs(8));
        breaker.failure();
        clock.inc(Duration::from_secs(3));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn open_after_doom_and_stays_open() {
        let (breaker, clock) = breaker(10, 60);
        breaker.failure();
        clock.inc(Duration::from_secs(30));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
        clock.inc(Duration::from_secs(31));
        assert_eq!(breaker.state(), CircuitState::Open);

        breaker.success();
        assert_eq!(breaker.state(), CircuitState::Open);
        clock.inc(Duration::from_secs(3600));
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[test]
    fn zero_doom_never_opens() {
        let (breaker, clock) = breaker(10, 0);
        breaker.failure();
        clock.inc(Duration::from_secs(3600));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn observes_results() {
        let (breaker, clock) = breaker(1, 60);
        let id: DocumentId = "id:ns:type::a".parse().unwrap();
        let result = |status| OperationResult::new(id.clone()).with_status(status, 0);

        breaker.observe(&result(Status::ConditionNotMet));
        breaker.observe(&result(Status::VespaFailure));
        clock.inc(Duration::from_secs(2));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        breaker.observe(&result(Status::Success));
        assert_eq!(breaker.state(), CircuitState::Closed);

        breaker.observe(&result(Status::TransportFailure));
        clock.inc(Duration::from_secs(2));
        assert_eq!(breaker.state(), CircuitState::HalfOpen);
    }
}
