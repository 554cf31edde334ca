//! Prometheus metrics for the recorder

use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, Registry, TextEncoder};

use crate::error::{RecorderError, Result};

/// Recorder counters, registered on a private registry
pub struct RecorderMetrics {
    registry: Registry,
    pub events_received: IntCounterVec,
    pub events_dropped: IntCounterVec,
    pub events_written: IntCounterVec,
    pub bytes_flushed: IntCounterVec,
    pub deltas_applied: IntCounter,
    pub deltas_stale: IntCounter,
    pub sequence_gaps: IntCounter,
    pub resyncs: IntCounter,
    pub snapshot_failures: IntCounter,
    pub book_last_update_id: IntGauge,
}

impl RecorderMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("recorder".to_string()), None)?;

        let events_received = IntCounterVec::new(
            Opts::new("events_received_total", "Events delivered by the feed"),
            &["category"],
        )?;
        let events_dropped = IntCounterVec::new(
            Opts::new("events_dropped_total", "Events lost to queue overflow"),
            &["category"],
        )?;
        let events_written = IntCounterVec::new(
            Opts::new("events_written_total", "Lines appended to the output files"),
            &["category"],
        )?;
        let bytes_flushed = IntCounterVec::new(
            Opts::new("bytes_flushed_total", "Bytes written to the output files"),
            &["category"],
        )?;
        let deltas_applied = IntCounter::new("deltas_applied_total", "Diff depth events applied")?;
        let deltas_stale = IntCounter::new("deltas_stale_total", "Diff depth events discarded as stale")?;
        let sequence_gaps = IntCounter::new("sequence_gaps_total", "Sequence gaps detected")?;
        let resyncs = IntCounter::new("resyncs_total", "Order book resynchronizations")?;
        let snapshot_failures =
            IntCounter::new("snapshot_failures_total", "Failed snapshot fetch attempts")?;
        let book_last_update_id =
            IntGauge::new("book_last_update_id", "Last update id applied to the order book")?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(events_written.clone()))?;
        registry.register(Box::new(bytes_flushed.clone()))?;
        registry.register(Box::new(deltas_applied.clone()))?;
        registry.register(Box::new(deltas_stale.clone()))?;
        registry.register(Box::new(sequence_gaps.clone()))?;
        registry.register(Box::new(resyncs.clone()))?;
        registry.register(Box::new(snapshot_failures.clone()))?;
        registry.register(Box::new(book_last_update_id.clone()))?;

        Ok(Self {
            registry,
            events_received,
            events_dropped,
            events_written,
            bytes_flushed,
            deltas_applied,
            deltas_stale,
            sequence_gaps,
            resyncs,
            snapshot_failures,
            book_last_update_id,
        })
    }

    /// Prometheus text exposition
    pub fn render(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| RecorderError::SerializationError(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_contains_counters() {
        let metrics = RecorderMetrics::new().unwrap();
        metrics.events_dropped.with_label_values(&["klines"]).inc_by(3);
        metrics.deltas_applied.inc();

        let text = metrics.render().unwrap();
        assert!(text.contains("recorder_events_dropped_total{category=\"klines\"} 3"));
        assert!(text.contains("recorder_deltas_applied_total 1"));
    }

    #[test]
    fn test_instances_are_independent() {
        let first = RecorderMetrics::new().unwrap();
        let second = RecorderMetrics::new().unwrap();
        first.resyncs.inc();
        assert_eq!(second.resyncs.get(), 0);
    }
}
