//! Metrics collection for observability

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Session metrics
    describe_counter!("session.groups.created", "Number of groups created locally");
    describe_counter!("session.groups.joined", "Number of groups joined via welcome or external commit");
    describe_counter!("session.groups.rebooted", "Number of groups replaced wholesale");
    describe_counter!("session.commits.created", "Number of local commits staged");
    describe_counter!("session.commits.merged", "Number of pending commits merged");
    describe_counter!("session.commits.discarded", "Number of pending commits discarded");
    describe_counter!("session.commits.processed", "Number of remote commits applied");
    describe_counter!("session.proposals.processed", "Number of remote proposals applied");
    describe_counter!("session.forks.recovered", "Number of fork recoveries by re-adding");
    describe_counter!("session.messages.sent", "Number of application messages encrypted");
    describe_counter!("session.messages.received", "Number of application messages decrypted");
    describe_histogram!("session.commit.duration_ms", "Commit processing duration in milliseconds");
    describe_gauge!("session.groups.active", "Number of active groups");

    // Welcome staging metrics
    describe_counter!("welcome.staged", "Number of welcomes staged for inspection");
    describe_counter!("welcome.accepted", "Number of staged welcomes accepted");
    describe_counter!("welcome.rejected", "Number of staged welcomes rejected");
    describe_counter!("welcome.purged", "Number of stale pending welcomes purged");

    // Trust store metrics
    describe_counter!("trust.sightings", "Number of fingerprint sightings recorded");
    describe_counter!("trust.changes", "Number of fingerprint changes detected");
    describe_counter!("trust.verifications", "Number of explicit user verifications");

    // Dedup filter metrics
    describe_counter!("dedup.hits", "Number of duplicate messages suppressed");
    describe_counter!("dedup.evictions", "Number of dedup eviction passes");
    describe_gauge!("dedup.entries", "Number of processed-message records held");

    // Conversation store metrics
    describe_counter!("convo.messages.appended", "Number of messages appended to conversations");
    describe_counter!("convo.diagnostics.recorded", "Number of diagnostic events recorded");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

/// Record a histogram metric
pub fn record_histogram(name: &'static str, value: f64) {
    histogram!(name).record(value);
}

/// Timer for measuring operation duration
pub struct Timer {
    name: String,
    start: Instant,
}

impl Timer {
    /// Create a new timer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            start: Instant::now(),
        }
    }

    /// Stop the timer and record the duration
    pub fn stop(self) {
        let duration = self.start.elapsed();
        histogram!(self.name).record(duration.as_secs_f64() * 1000.0);
    }
}
