//! Prometheus metrics for the read-ahead reader.

use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Container for all read-ahead reader metrics.
pub struct ReaderMetrics {
    registry: Registry,

    /// Counter of entries pushed into the read-ahead cache.
    pub entries_read_total: Counter,

    /// Counter of read batches completed against the segment store.
    pub batches_read_total: Counter,

    /// Alerts raised when positioning a reader on a truncated range.
    pub truncation_position_alerts_total: Counter,

    /// Metadata refreshes forced by the idle detector.
    pub idle_refreshes_total: Counter,
}

impl Default for ReaderMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReaderMetrics {
    /// Create a new metrics registry with all metrics registered.
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let entries_read_total = Counter::default();
        registry.register(
            "readahead_entries_read_total",
            "Total number of entries read ahead into the cache",
            entries_read_total.clone(),
        );

        let batches_read_total = Counter::default();
        registry.register(
            "readahead_batches_read_total",
            "Total number of read batches completed against the segment store",
            batches_read_total.clone(),
        );

        let truncation_position_alerts_total = Counter::default();
        registry.register(
            "readahead_truncation_position_alerts_total",
            "Alerts raised when positioning a reader on a truncated range",
            truncation_position_alerts_total.clone(),
        );

        let idle_refreshes_total = Counter::default();
        registry.register(
            "readahead_idle_refreshes_total",
            "Metadata refreshes forced by the idle reader check",
            idle_refreshes_total.clone(),
        );

        Self {
            registry,
            entries_read_total,
            batches_read_total,
            truncation_position_alerts_total,
            idle_refreshes_total,
        }
    }

    /// Returns a mutable reference to the underlying Prometheus registry.
    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Encode all metrics to Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &self.registry)
            .expect("encoding metrics should not fail");
        buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_create_default_metrics() {
        // given/when
        let metrics = ReaderMetrics::new();

        // then
        let encoded = metrics.encode();
        assert!(encoded.contains("# HELP readahead_entries_read_total"));
        assert!(encoded.contains("# HELP readahead_batches_read_total"));
        assert!(encoded.contains("# HELP readahead_truncation_position_alerts_total"));
        assert!(encoded.contains("# HELP readahead_idle_refreshes_total"));
    }
}
