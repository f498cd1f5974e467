use metrics::{Counter, Gauge, Histogram};
use std::time::Duration;

/// Counter/gauge handles for the batch pipeline.
///
/// Handles default to no-op; wiring an exporter swaps them for real ones
/// without touching call sites.
pub struct Metrics {
    pub runs_started: Counter,
    pub runs_finalized: Counter,
    pub runs_aborted: Counter,
    pub tests_passed: Counter,
    pub tests_failed: Counter,
    pub test_duration: Histogram,
    pub scroll_duration: Histogram,
    pub ingest_failures: Counter,
    pub timeouts: Counter,
    pub active_jobs: Gauge,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            runs_started: Counter::noop(),
            runs_finalized: Counter::noop(),
            runs_aborted: Counter::noop(),
            tests_passed: Counter::noop(),
            tests_failed: Counter::noop(),
            test_duration: Histogram::noop(),
            scroll_duration: Histogram::noop(),
            ingest_failures: Counter::noop(),
            timeouts: Counter::noop(),
            active_jobs: Gauge::noop(),
        }
    }

    pub fn record_test(&self, duration: Duration, passed: bool) {
        if passed {
            self.tests_passed.increment(1);
        } else {
            self.tests_failed.increment(1);
        }
        self.test_duration.record(duration.as_secs_f64());
    }

    pub fn record_timeout(&self) {
        self.timeouts.increment(1);
        self.tests_failed.increment(1);
    }

    pub fn record_ingest_failure(&self) {
        self.ingest_failures.increment(1);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
