//! Prometheus metrics for KAIKU

use crate::error::{KaikuError, Result};
use prometheus::{
    CounterVec, Encoder, Gauge, GaugeVec, Histogram, TextEncoder, register_counter_vec,
    register_gauge, register_gauge_vec, register_histogram,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All KAIKU metrics
pub struct Metrics {
    /// Raw notifications fetched from the source
    pub notifications_fetched: CounterVec,

    /// Mentions ingested (by result: new, duplicate)
    pub mentions_ingested: CounterVec,

    /// Events emitted on the bus (by topic)
    pub events_emitted: CounterVec,

    /// Envelopes moved to the dead-letter topic (by topic, group)
    pub events_dead_lettered: CounterVec,

    /// Malformed stream entries skipped (by topic)
    pub events_malformed: CounterVec,

    /// Routing decisions (by outcome)
    pub routing_decisions: CounterVec,

    /// Requests rejected by the rate limiter
    pub rate_limited: CounterVec,

    /// Circuit breaker state (1 for the active state, 0 otherwise)
    pub breaker_state: GaugeVec,

    /// Current durable polling offset
    pub poll_offset: Gauge,

    /// Poll cycle duration
    pub poll_cycle_seconds: Histogram,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            notifications_fetched: register_counter_vec!(
                "kaiku_notifications_fetched_total",
                "Raw notifications fetched from the source",
                &["source"]
            )
            .map_err(|e| KaikuError::Metrics(format!("notifications_fetched: {e}")))?,

            mentions_ingested: register_counter_vec!(
                "kaiku_mentions_ingested_total",
                "Mentions ingested by the poller",
                &["result"]
            )
            .map_err(|e| KaikuError::Metrics(format!("mentions_ingested: {e}")))?,

            events_emitted: register_counter_vec!(
                "kaiku_events_emitted_total",
                "Events emitted on the bus",
                &["topic"]
            )
            .map_err(|e| KaikuError::Metrics(format!("events_emitted: {e}")))?,

            events_dead_lettered: register_counter_vec!(
                "kaiku_events_dead_lettered_total",
                "Envelopes moved to the dead-letter topic",
                &["topic", "group"]
            )
            .map_err(|e| KaikuError::Metrics(format!("events_dead_lettered: {e}")))?,

            events_malformed: register_counter_vec!(
                "kaiku_events_malformed_total",
                "Malformed stream entries skipped",
                &["topic"]
            )
            .map_err(|e| KaikuError::Metrics(format!("events_malformed: {e}")))?,

            routing_decisions: register_counter_vec!(
                "kaiku_routing_decisions_total",
                "Routing decisions by outcome",
                &["outcome"]
            )
            .map_err(|e| KaikuError::Metrics(format!("routing_decisions: {e}")))?,

            rate_limited: register_counter_vec!(
                "kaiku_rate_limited_total",
                "Requests rejected by the sliding-window rate limiter",
                &["stage"]
            )
            .map_err(|e| KaikuError::Metrics(format!("rate_limited: {e}")))?,

            breaker_state: register_gauge_vec!(
                "kaiku_breaker_state",
                "Circuit breaker state (1 for the active state)",
                &["state"]
            )
            .map_err(|e| KaikuError::Metrics(format!("breaker_state: {e}")))?,

            poll_offset: register_gauge!("kaiku_poll_offset", "Current durable polling offset")
                .map_err(|e| KaikuError::Metrics(format!("poll_offset: {e}")))?,

            poll_cycle_seconds: register_histogram!(
                "kaiku_poll_cycle_seconds",
                "Poll cycle duration",
                vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]
            )
            .map_err(|e| KaikuError::Metrics(format!("poll_cycle_seconds: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| KaikuError::Metrics("failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

// Record-if-initialized helpers: call sites never care whether metrics are
// up yet (tests mostly run without them).

pub fn try_record_fetched(count: u64) {
    if let Some(m) = Metrics::get() {
        m.notifications_fetched
            .with_label_values(&["http"])
            .inc_by(count as f64);
    }
}

pub fn try_record_ingested(result: &str) {
    if let Some(m) = Metrics::get() {
        m.mentions_ingested.with_label_values(&[result]).inc();
    }
}

pub fn try_record_emitted(topic: &str) {
    if let Some(m) = Metrics::get() {
        m.events_emitted.with_label_values(&[topic]).inc();
    }
}

pub fn try_record_dead_lettered(topic: &str, group: &str) {
    if let Some(m) = Metrics::get() {
        m.events_dead_lettered
            .with_label_values(&[topic, group])
            .inc();
    }
}

pub fn try_record_malformed(topic: &str) {
    if let Some(m) = Metrics::get() {
        m.events_malformed.with_label_values(&[topic]).inc();
    }
}

pub fn try_record_decision(outcome: &str) {
    if let Some(m) = Metrics::get() {
        m.routing_decisions.with_label_values(&[outcome]).inc();
    }
}

pub fn try_record_rate_limited() {
    if let Some(m) = Metrics::get() {
        m.rate_limited.with_label_values(&["router"]).inc();
    }
}

pub fn try_set_breaker_state(active: &str) {
    if let Some(m) = Metrics::get() {
        for state in ["closed", "open", "half_open"] {
            let value = if state == active { 1.0 } else { 0.0 };
            m.breaker_state.with_label_values(&[state]).set(value);
        }
    }
}

pub fn try_set_offset(offset: u64) {
    if let Some(m) = Metrics::get() {
        m.poll_offset.set(offset as f64);
    }
}

pub fn try_observe_poll_cycle(seconds: f64) {
    if let Some(m) = Metrics::get() {
        m.poll_cycle_seconds.observe(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_record() {
        // Metrics::init() may fail if already initialized from another test
        // so we just check get() works after any successful init
        let _ = Metrics::init();
        if let Some(metrics) = Metrics::get() {
            metrics.mentions_ingested.with_label_values(&["new"]).inc();
            metrics.poll_offset.set(7.0);
        }
        try_set_breaker_state("open");
        let text = gather();
        assert!(text.contains("kaiku_"));
    }
}
