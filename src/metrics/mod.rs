// Private module declaration
mod server;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    IntGauge, Opts, Registry,
};

pub use server::start_metrics_server;

// ============================================================================
// Metrics Module - Prometheus metrics for the write path
// ============================================================================
//
// Covers:
// - Event appends (throughput, latency, idempotent replays, conflicts)
// - Projection outcomes and partial writes
// - Retry attempts and outcomes
// - Reconciliation passes
// - Backend circuit breaker state
//
// Each Metrics owns its own Registry, scraped via /metrics.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    // Append Metrics
    pub events_appended: IntCounterVec,
    pub idempotent_replays: IntCounter,
    pub idempotency_conflicts: IntCounter,
    pub append_duration: HistogramVec,

    // Projection Metrics
    pub projections: IntCounterVec,
    pub partial_writes: IntCounter,

    // Retry Metrics
    pub retry_attempts_total: IntCounterVec,
    pub retry_success: IntCounterVec,
    pub retry_failure: IntCounterVec,

    // Reconciler Metrics
    pub streams_repaired: IntCounterVec,
    pub lagging_streams: IntGauge,

    // Circuit Breaker Metrics
    pub circuit_breaker_state: IntGauge,
    pub circuit_breaker_transitions: IntCounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_appended = IntCounterVec::new(
            Opts::new("events_appended_total", "Events durably appended to the log"),
            &["event_type"],
        )?;
        registry.register(Box::new(events_appended.clone()))?;

        let idempotent_replays = IntCounter::new(
            "idempotent_replays_total",
            "Appends resolved to an existing event with the same idempotency key",
        )?;
        registry.register(Box::new(idempotent_replays.clone()))?;

        let idempotency_conflicts = IntCounter::new(
            "idempotency_conflicts_total",
            "Appends rejected because the idempotency key carried a different payload",
        )?;
        registry.register(Box::new(idempotency_conflicts.clone()))?;

        let append_duration = HistogramVec::new(
            HistogramOpts::new("append_duration_seconds", "Event append latency")
                .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
            &["outcome"],
        )?;
        registry.register(Box::new(append_duration.clone()))?;

        let projections = IntCounterVec::new(
            Opts::new("projections_total", "Read model projections by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(projections.clone()))?;

        let partial_writes = IntCounter::new(
            "partial_writes_total",
            "Records whose event was written but whose projection failed",
        )?;
        registry.register(Box::new(partial_writes.clone()))?;

        let retry_attempts_total = IntCounterVec::new(
            Opts::new("retry_attempts_total", "Total retry attempts"),
            &["operation", "attempt"],
        )?;
        registry.register(Box::new(retry_attempts_total.clone()))?;

        let retry_success = IntCounterVec::new(
            Opts::new("retry_success_total", "Total successful retries"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_success.clone()))?;

        let retry_failure = IntCounterVec::new(
            Opts::new("retry_failure_total", "Total failed retries after all attempts"),
            &["operation"],
        )?;
        registry.register(Box::new(retry_failure.clone()))?;

        let streams_repaired = IntCounterVec::new(
            Opts::new("reconciler_streams_total", "Streams handled by the reconciler"),
            &["outcome"],
        )?;
        registry.register(Box::new(streams_repaired.clone()))?;

        let lagging_streams = IntGauge::new(
            "reconciler_lagging_streams",
            "Streams found behind the log in the last reconciliation pass",
        )?;
        registry.register(Box::new(lagging_streams.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "circuit_breaker_state",
            "Circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        let circuit_breaker_transitions = IntCounterVec::new(
            Opts::new("circuit_breaker_transitions_total", "Circuit breaker state transitions"),
            &["from_state", "to_state"],
        )?;
        registry.register(Box::new(circuit_breaker_transitions.clone()))?;

        Ok(Self {
            registry,
            events_appended,
            idempotent_replays,
            idempotency_conflicts,
            append_duration,
            projections,
            partial_writes,
            retry_attempts_total,
            retry_success,
            retry_failure,
            streams_repaired,
            lagging_streams,
            circuit_breaker_state,
            circuit_breaker_transitions,
        })
    }

    /// Get the Prometheus registry for exposing metrics via HTTP
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_append(&self, event_type: &str, duration_secs: f64, replayed: bool) {
        if replayed {
            self.idempotent_replays.inc();
            self.append_duration.with_label_values(&["replayed"]).observe(duration_secs);
        } else {
            self.events_appended.with_label_values(&[event_type]).inc();
            self.append_duration.with_label_values(&["appended"]).observe(duration_secs);
        }
    }

    pub fn record_conflict(&self) {
        self.idempotency_conflicts.inc();
    }

    /// `outcome` is one of applied, rebuilt, skipped, failed
    pub fn record_projection(&self, outcome: &str) {
        self.projections.with_label_values(&[outcome]).inc();
    }

    pub fn record_partial_write(&self) {
        self.partial_writes.inc();
    }

    pub fn record_retry_attempt(&self, operation: &str, attempt: u32) {
        self.retry_attempts_total.with_label_values(&[operation, &attempt.to_string()]).inc();
    }

    pub fn record_retry_outcome(&self, operation: &str, success: bool) {
        if success {
            self.retry_success.with_label_values(&[operation]).inc();
        } else {
            self.retry_failure.with_label_values(&[operation]).inc();
        }
    }

    pub fn record_reconcile_pass(&self, lagging: usize, repaired: usize, failed: usize) {
        self.lagging_streams.set(lagging as i64);
        self.streams_repaired.with_label_values(&["repaired"]).inc_by(repaired as u64);
        self.streams_repaired.with_label_values(&["failed"]).inc_by(failed as u64);
    }

    pub fn update_circuit_breaker_state(&self, state: i64) {
        self.circuit_breaker_state.set(state);
    }

    pub fn record_circuit_breaker_transition(&self, from_state: &str, to_state: &str) {
        self.circuit_breaker_transitions.with_label_values(&[from_state, to_state]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();
        metrics.record_projection("applied");
        assert!(!metrics.registry.gather().is_empty());
    }

    #[test]
    fn test_record_append_and_replay() {
        let metrics = Metrics::new().unwrap();
        metrics.record_append("reading-recorded", 0.01, false);
        metrics.record_append("reading-recorded", 0.01, true);

        let gathered = metrics.registry.gather();
        let appended = gathered.iter().find(|m| m.name() == "events_appended_total").unwrap();
        assert_eq!(appended.metric[0].counter.value, Some(1.0));

        let replays = gathered.iter().find(|m| m.name() == "idempotent_replays_total").unwrap();
        assert_eq!(replays.metric[0].counter.value, Some(1.0));
    }

    #[test]
    fn test_record_retry() {
        let metrics = Metrics::new().unwrap();
        metrics.record_retry_attempt("project", 1);
        metrics.record_retry_attempt("project", 2);
        metrics.record_retry_outcome("project", true);

        let gathered = metrics.registry.gather();
        let attempts = gathered.iter().find(|m| m.name() == "retry_attempts_total").unwrap();
        assert_eq!(attempts.metric.len(), 2);
    }

    #[test]
    fn test_reconcile_pass_sets_gauge() {
        let metrics = Metrics::new().unwrap();
        metrics.record_reconcile_pass(3, 2, 1);

        let gathered = metrics.registry.gather();
        let lagging = gathered.iter().find(|m| m.name() == "reconciler_lagging_streams").unwrap();
        assert_eq!(lagging.metric[0].gauge.value, Some(3.0));
    }
}
