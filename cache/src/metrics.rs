//! Metrics for [crate::Cache].

use prometheus_client::{metrics::counter::Counter, registry::Registry};

/// Metrics for [crate::Cache].
#[derive(Default)]
pub struct Metrics {
    /// Pages served from residency.
    pub hits: Counter,
    /// Page lookups that required a fill.
    pub misses: Counter,
    /// Completed fill callbacks.
    pub fills: Counter,
    /// Dirty pages handed to the flush callback.
    pub flushes: Counter,
    /// Pages evicted from the LRU tail.
    pub evictions: Counter,
    /// Dirty pages parked on the orphan list.
    pub orphaned: Counter,
}

impl Metrics {
    /// Create and register metrics with the given registry.
    pub fn init(registry: &mut Registry) -> Self {
        let metrics = Self::default();
        registry.register(
            "cache_hits",
            "Pages served from residency",
            metrics.hits.clone(),
        );
        registry.register(
            "cache_misses",
            "Page lookups that required a fill",
            metrics.misses.clone(),
        );
        registry.register(
            "cache_fills",
            "Completed fill callbacks",
            metrics.fills.clone(),
        );
        registry.register(
            "cache_flushes",
            "Dirty pages handed to the flush callback",
            metrics.flushes.clone(),
        );
        registry.register(
            "cache_evictions",
            "Pages evicted from the LRU tail",
            metrics.evictions.clone(),
        );
        registry.register(
            "cache_orphaned",
            "Dirty pages parked on the orphan list",
            metrics.orphaned.clone(),
        );
        metrics
    }
}
