use std::{collections::BTreeMap, time::Duration};

use parking_lot::Mutex;
use serde_json::json;

use crate::OperationResult;

/// Cumulative feed counters
///
/// [`Stats::add`] is associative and commutative, so partial stats gathered by different
/// workers can be merged in any order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stats {
    pub requests: i64,
    pub responses: i64,
    pub responses_by_code: BTreeMap<u16, i64>,
    pub errors: i64,
    pub inflight: i64,
    pub total_latency: Duration,
    /// Smallest non-zero latency seen, zero if none
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

impl Stats {
    /// Merge `other` into `self`
    pub fn add(&mut self, other: &Self) {
        self.requests += other.requests;
        self.responses += other.responses;
        for (code, count) in &other.responses_by_code {
            *self.responses_by_code.entry(*code).or_default() += count;
        }
        self.errors += other.errors;
        self.inflight += other.inflight;
        self.total_latency += other.total_latency;
        if self.min_latency.is_zero()
            || (!other.min_latency.is_zero() && other.min_latency < self.min_latency)
        {
            self.min_latency = other.min_latency;
        }
        self.max_latency = self.max_latency.max(other.max_latency);
        self.bytes_sent += other.bytes_sent;
        self.bytes_recv += other.bytes_recv;
    }

    /// Operations that got a `200 OK`
    pub fn successes(&self) -> i64 {
        self.responses_by_code.get(&200).copied().unwrap_or_default()
    }

    /// Operations that ended in anything but `200 OK`, including errors
    pub fn unsuccessful(&self) -> i64 {
        self.responses - self.successes() + self.errors
    }

    pub fn avg_latency(&self) -> Duration {
        let finished = self.responses + self.errors;
        if finished <= 0 {
            return Duration::ZERO;
        }
        self.total_latency / u32::try_from(finished).unwrap_or(u32::MAX)
    }

    /// Summary suitable for printing at the end of a feed
    pub fn to_json(&self) -> serde_json::Value {
        let by_code: BTreeMap<String, i64> = self
            .responses_by_code
            .iter()
            .map(|(code, count)| (code.to_string(), *count))
            .collect();
        json!({
            "feeder.ok.count": self.successes(),
            "feeder.error.count": self.unsuccessful(),
            "feeder.inflight.count": self.inflight,
            "http.request.count": self.requests,
            "http.request.bytes": self.bytes_sent,
            "http.exception.count": self.errors,
            "http.response.count": self.responses,
            "http.response.bytes": self.bytes_recv,
            "http.response.latency.millis.min": self.min_latency.as_millis() as u64,
            "http.response.latency.millis.avg": self.avg_latency().as_millis() as u64,
            "http.response.latency.millis.max": self.max_latency.as_millis() as u64,
            "http.response.code.counts": by_code,
        })
    }
}

impl From<&OperationResult> for Stats {
    /// The counters contributed by one finalized operation
    fn from(result: &OperationResult) -> Self {
        let mut stats = Self {
            total_latency: result.latency,
            min_latency: result.latency,
            max_latency: result.latency,
            bytes_sent: result.bytes_sent,
            bytes_recv: result.bytes_recv,
            ..Default::default()
        };
        if result.error.is_some() {
            stats.errors = 1;
        } else {
            stats.responses = 1;
            stats.responses_by_code.insert(result.http_status, 1);
        }
        stats
    }
}

/// Concurrent accumulator of [`Stats`], shared by the dispatcher's workers
#[derive(Debug, Default)]
pub struct StatsCollector {
    stats: Mutex<Stats>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, stats: &Stats) {
        self.stats.lock().add(stats);
    }

    /// An operation was handed to the feeder for the first time
    pub fn operation_started(&self) {
        self.add(&Stats {
            requests: 1,
            inflight: 1,
            ..Default::default()
        });
    }

    /// A started operation reached its final result
    pub fn operation_finished(&self, result: &OperationResult) {
        let mut stats = Stats::from(result);
        stats.inflight = -1;
        self.add(&stats);
    }

    /// An operation was dropped without ever being sent
    pub fn operation_abandoned(&self, result: &OperationResult) {
        self.add(&Stats::from(result));
    }

    pub fn inflight(&self) -> i64 {
        self.stats.lock().inflight
    }

    pub fn snapshot(&self) -> Stats {
        self.stats.lock().clone()
    }
}
