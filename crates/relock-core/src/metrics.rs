// Metrics for lock traffic and the local waiter table.
// All emission goes through the metrics facade; exporters are the embedding
// application's concern.

use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};

/// Initialize all metric descriptions.
/// Should be called once at application startup; safe to skip entirely.
pub fn init_metrics() {
    describe_counter!(
        "relock_acquires_total",
        "Total number of acquire calls, labeled by outcome (acquired/timeout)"
    );
    describe_counter!(
        "relock_releases_total",
        "Total number of release calls, labeled by outcome (fully_released/still_held/absent)"
    );
    describe_histogram!(
        "relock_acquire_wait_seconds",
        "Time spent waiting in contended acquire calls, in seconds"
    );
    describe_counter!(
        "relock_notifications_total",
        "Total number of release notifications delivered to the local registry"
    );
    describe_counter!(
        "relock_evictions_total",
        "Total number of waiter entries removed by idle eviction"
    );
    describe_gauge!(
        "relock_waiter_entries",
        "Current number of entries in the local waiter table"
    );
}

/// `waited` is passed only by calls that registered a wait; uncontended
/// acquires contribute no histogram sample.
pub fn record_acquire(outcome: &'static str, waited: Option<Duration>) {
    counter!("relock_acquires_total", "outcome" => outcome).increment(1);
    if let Some(waited) = waited {
        histogram!("relock_acquire_wait_seconds").record(waited.as_secs_f64());
    }
}

pub fn record_release(outcome: &'static str) {
    counter!("relock_releases_total", "outcome" => outcome).increment(1);
}

pub fn record_notification() {
    counter!("relock_notifications_total").increment(1);
}

pub fn record_evictions(evicted: usize) {
    counter!("relock_evictions_total").increment(evicted as u64);
}

pub fn record_waiter_entries(len: usize) {
    gauge!("relock_waiter_entries").set(len as f64);
}
