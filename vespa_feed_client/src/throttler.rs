use std::sync::{
    Arc,
    atomic::{AtomicI64, Ordering},
};

use parking_lot::Mutex;
use rand::Rng;
use vespa_feed_time::{Time, TimeProvider};

use crate::OperationResult;

/// Trade-off between throughput and latency: closer to 1 favors throughput, closer to 0
/// favors latency
const WEIGHT: f64 = 0.7;

/// Number of log-scale buckets of throughput measurements, spanning
/// `[min_inflight, max_inflight)`
const BUCKETS: usize = 128;

/// Computes how many operations should be in flight
///
/// Two limits are combined. A static ceiling grows slowly with every success and collapses
/// as soon as the server signals throttling. A dynamic target is recomputed from measured
/// throughput at increasingly sparse intervals, searching for the in-flight level that best
/// balances throughput against latency.
#[derive(Debug)]
pub struct Throttler {
    min_inflight: i64,
    max_inflight: i64,
    /// Static ceiling, in tenths of an operation
    target_times_ten: AtomicI64,
    target_inflight: AtomicI64,
    ok: AtomicI64,
    window: Mutex<Window>,
    time_provider: Arc<dyn TimeProvider>,
}

#[derive(Debug)]
struct Window {
    sent: i64,
    start: Time,
    throughputs: Vec<f64>,
}

impl Throttler {
    pub fn new(connections: usize, time_provider: Arc<dyn TimeProvider>) -> Self {
        let min_inflight = 16 * i64::try_from(connections.max(1)).unwrap_or(i64::MAX / 4096);
        // a connection multiplexes at most 4096 streams on the server side
        let max_inflight = 256 * min_inflight;
        Self {
            min_inflight,
            max_inflight,
            target_times_ten: AtomicI64::new(10 * max_inflight),
            target_inflight: AtomicI64::new(8 * min_inflight),
            ok: AtomicI64::new(0),
            window: Mutex::new(Window {
                sent: 0,
                start: time_provider.now(),
                throughputs: vec![0.0; BUCKETS],
            }),
            time_provider,
        }
    }

    pub fn min_inflight(&self) -> i64 {
        self.min_inflight
    }

    pub fn max_inflight(&self) -> i64 {
        self.max_inflight
    }

    /// Record that an operation was sent, recomputing the dynamic target now and then
    pub fn sent(&self) {
        let current = self.target_inflight.load(Ordering::Relaxed);
        let mut window = self.window.lock();
        window.sent += 1;
        let sent = window.sent;
        if sent.saturating_mul(sent).saturating_mul(sent)
            < current.saturating_mul(current).saturating_mul(100)
        {
            return;
        }

        window.sent = 0;
        let now = self.time_provider.now();
        let elapsed = now.saturating_duration_since(window.start);
        window.start = now;
        let ok = self.ok.swap(0, Ordering::Relaxed);
        // nothing can be measured over an empty interval, but the walk still moves
        if !elapsed.is_zero() {
            let throughput = ok as f64 / elapsed.as_nanos() as f64;
            let ratio = (current as f64 / self.min_inflight as f64).clamp(1.0, 255.0);
            let index = (BUCKETS as f64 * ratio.ln() / 256f64.ln()) as usize;
            window.throughputs[index.min(BUCKETS - 1)] = throughput;
        }

        let mut choice = current as f64;
        let mut max_objective = -1.0;
        for (i, &throughput) in window.throughputs.iter().enumerate().rev() {
            // unknown
            if throughput == 0.0 {
                continue;
            }
            let inflight =
                self.min_inflight as f64 * 256f64.powf((i as f64 + 0.5) / BUCKETS as f64);
            let objective = throughput * inflight.powf(WEIGHT - 1.0);
            if objective > max_objective {
                max_objective = objective;
                choice = inflight;
            }
        }

        // random walk, skewed towards increase
        let target = (rand::thread_rng().gen_range(0.92..1.12) * choice) as i64;
        self.target_inflight.store(
            target.clamp(self.min_inflight, self.max_inflight),
            Ordering::Relaxed,
        );
    }

    pub fn success(&self) {
        self.ok.fetch_add(1, Ordering::Relaxed);
        let ceiling = 10 * self.max_inflight;
        let _ = self
            .target_times_ten
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |t| {
                (t < ceiling).then_some(t + 1)
            });
    }

    /// The server asked us to back off while `inflight` operations were outstanding
    pub fn throttled(&self, inflight: i64) {
        self.target_times_ten.store(
            inflight.saturating_mul(5).max(self.min_inflight * 10),
            Ordering::Relaxed,
        );
    }

    /// Apply the outcome of one operation, given the number of operations in flight
    pub fn observe(&self, result: &OperationResult, inflight: i64) {
        if result.success() {
            self.success();
        } else if result.is_throttled() {
            self.throttled(inflight);
        }
    }

    /// The static ceiling, which reacts immediately to throttling
    pub fn static_target_inflight(&self) -> i64 {
        self.max_inflight
            .min(self.target_times_ten.load(Ordering::Relaxed) / 10)
    }

    pub fn target_inflight(&self) -> i64 {
        self.static_target_inflight()
            .min(self.target_inflight.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::Status;
    use vespa_feed_document::DocumentId;
    use vespa_feed_time::MockProvider;

    fn throttler(connections: usize) -> (Throttler, Arc<MockProvider>) {
        let clock = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        (
            Throttler::new(connections, Arc::clone(&clock) as _),
            clock,
        )
    }

    #[test]
    fn bounds_scale_with_connections() {
        let (throttler, _) = throttler(8);
        assert_eq!(throttler.min_inflight(), 128);
        assert_eq!(throttler.max_inflight(), 32768);
        assert_eq!(throttler.static_target_inflight(), throttler.max_inflight());
        assert_eq!(throttler.target_inflight(), 8 * 128);
    }

    #[test]
    fn idle_sends_drift_to_max() {
        let (throttler, _) = throttler(8);
        let mut sends = 0;
        while throttler.target_inflight() < throttler.max_inflight() && sends < 20_000_000 {
            throttler.sent();
            sends += 1;
        }
        assert_eq!(throttler.target_inflight(), throttler.max_inflight());
        assert_eq!(throttler.static_target_inflight(), 32768);
    }

    #[test]
    fn recompute_without_elapsed_time_moves_the_target() {
        let (throttler, _) = throttler(1);
        assert_eq!(throttler.target_inflight(), 128);

        let mut sends = 0;
        while throttler.target_inflight() == 128 && sends < 1_000_000 {
            throttler.sent();
            sends += 1;
        }
        let target = throttler.target_inflight();
        assert_ne!(target, 128);
        assert!(
            (throttler.min_inflight()..=throttler.max_inflight()).contains(&target),
            "target was {target}"
        );
    }

    #[test]
    fn throttling_collapses_the_static_ceiling() {
        let (throttler, _) = throttler(8);
        throttler.throttled(5);
        // max(5 * 5, 128 * 10) tenths
        assert_eq!(throttler.target_inflight(), 128);
        assert!(throttler.target_inflight() <= (5i64 * 5).max(128 * 10));

        throttler.throttled(1000);
        assert_eq!(throttler.target_inflight(), 500);

        for _ in 0..10 {
            throttler.success();
        }
        assert_eq!(throttler.static_target_inflight(), 501);
        assert_eq!(throttler.target_inflight(), 501);
    }

    #[test]
    fn static_ceiling_does_not_exceed_max() {
        let (throttler, _) = throttler(1);
        for _ in 0..100 {
            throttler.success();
        }
        assert_eq!(throttler.static_target_inflight(), throttler.max_inflight());
    }

    #[test]
    fn recomputes_from_measured_throughput() {
        let (throttler, clock) = throttler(1);
        assert_eq!(throttler.target_inflight(), 128);

        // 118³ is the first cube above 100 * 128²
        for _ in 0..117 {
            throttler.sent();
            throttler.success();
        }
        clock.inc(Duration::from_secs(1));
        assert_eq!(throttler.target_inflight(), 128);
        throttler.sent();

        // the only measurement lands in the bucket holding 128, centered near 130.8
        let target = throttler.target_inflight();
        assert!((120..=147).contains(&target), "target was {target}");
    }

    #[test]
    fn observes_results() {
        let (throttler, _) = throttler(1);
        let id: DocumentId = "id:ns:type::a".parse().unwrap();
        let throttled = OperationResult::new(id.clone()).with_status(Status::TransportFailure, 429);
        throttler.observe(&throttled, 100);
        assert_eq!(throttler.static_target_inflight(), 50);

        let ok = OperationResult::new(id).with_status(Status::Success, 200);
        for _ in 0..10 {
            throttler.observe(&ok, 100);
        }
        assert_eq!(throttler.static_target_inflight(), 51);
    }
}
