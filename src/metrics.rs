use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use std::sync::{Arc, OnceLock};

/// Counters for mount operations, tree listings and remote range reads
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// FUSE operations served, by operation
    pub operations_total: IntCounterVec,
    /// FUSE operations answered with an error, by operation
    pub operation_errors: IntCounterVec,
    /// Cancelled or timed-out operations answered as empty results, by operation
    pub benign_cancellations: IntCounterVec,
    /// Tree listings served from the per-path cache
    pub tree_cache_hits: IntCounter,
    /// Tree listings fetched from the API
    pub tree_cache_misses: IntCounter,
    /// HTTP range requests issued
    pub range_requests: IntCounter,
    /// Range blocks served from the block cache
    pub range_cache_hits: IntCounter,
    /// Bytes received from range requests
    pub range_bytes_fetched: IntCounter,
}

impl Metrics {
    pub fn new(registry: Arc<Registry>) -> Result<Self, prometheus::Error> {
        let operations_total = IntCounterVec::new(
            Opts::new("tarmount_operations_total", "Filesystem operations served"),
            &["operation"],
        )?;

        let operation_errors = IntCounterVec::new(
            Opts::new("tarmount_operation_errors_total", "Filesystem operations that failed"),
            &["operation"],
        )?;

        let benign_cancellations = IntCounterVec::new(
            Opts::new(
                "tarmount_benign_cancellations_total",
                "Cancelled operations answered with an empty result",
            ),
            &["operation"],
        )?;

        let tree_cache_hits =
            IntCounter::new("tarmount_tree_cache_hits_total", "Tree listings served from cache")?;
        let tree_cache_misses =
            IntCounter::new("tarmount_tree_cache_misses_total", "Tree listings fetched remotely")?;
        let range_requests =
            IntCounter::new("tarmount_range_requests_total", "HTTP range requests issued")?;
        let range_cache_hits =
            IntCounter::new("tarmount_range_cache_hits_total", "Range blocks served from cache")?;
        let range_bytes_fetched =
            IntCounter::new("tarmount_range_bytes_fetched_total", "Bytes fetched by range requests")?;

        registry.register(Box::new(operations_total.clone()))?;
        registry.register(Box::new(operation_errors.clone()))?;
        registry.register(Box::new(benign_cancellations.clone()))?;
        registry.register(Box::new(tree_cache_hits.clone()))?;
        registry.register(Box::new(tree_cache_misses.clone()))?;
        registry.register(Box::new(range_requests.clone()))?;
        registry.register(Box::new(range_cache_hits.clone()))?;
        registry.register(Box::new(range_bytes_fetched.clone()))?;

        Ok(Self {
            registry,
            operations_total,
            operation_errors,
            benign_cancellations,
            tree_cache_hits,
            tree_cache_misses,
            range_requests,
            range_cache_hits,
            range_bytes_fetched,
        })
    }

    /// Record a served operation
    pub fn record_operation(&self, operation: &str, success: bool) {
        self.operations_total.with_label_values(&[operation]).inc();
        if !success {
            self.operation_errors.with_label_values(&[operation]).inc();
        }
    }

    pub fn record_cancellation(&self, operation: &str) {
        self.benign_cancellations.with_label_values(&[operation]).inc();
    }

    /// Prometheus text exposition of every registered metric
    pub fn render(&self) -> Result<String, prometheus::Error> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

static GLOBAL: OnceLock<Option<Metrics>> = OnceLock::new();

/// Process-wide metrics, `None` if registration failed
pub fn global() -> Option<&'static Metrics> {
    GLOBAL
        .get_or_init(|| match Metrics::new(Arc::new(Registry::new())) {
            Ok(metrics) => Some(metrics),
            Err(e) => {
                tracing::warn!(error = %e, "Metrics disabled");
                None
            }
        })
        .as_ref()
}

/// Run `f` against the process-wide metrics when they are available
pub fn with(f: impl FnOnce(&Metrics)) {
    if let Some(metrics) = global() {
        f(metrics);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new(Arc::new(Registry::new())).unwrap();

        metrics.record_operation("lookup", true);
        metrics.record_operation("lookup", false);
        assert_eq!(metrics.operations_total.with_label_values(&["lookup"]).get(), 2);
        assert_eq!(metrics.operation_errors.with_label_values(&["lookup"]).get(), 1);
    }

    #[test]
    fn test_cancellation_counter() {
        let metrics = Metrics::new(Arc::new(Registry::new())).unwrap();

        metrics.record_cancellation("readdir");
        assert_eq!(metrics.benign_cancellations.with_label_values(&["readdir"]).get(), 1);
        assert_eq!(metrics.benign_cancellations.with_label_values(&["read"]).get(), 0);
    }

    #[test]
    fn test_render_contains_metric_names() {
        let metrics = Metrics::new(Arc::new(Registry::new())).unwrap();
        metrics.tree_cache_hits.inc();
        metrics.record_cancellation("lookup");

        let text = metrics.render().unwrap();
        assert!(text.contains("tarmount_tree_cache_hits_total 1"));
        assert!(text.contains("tarmount_benign_cancellations_total"));
    }

    #[test]
    fn test_duplicate_registration_fails() {
        let registry = Arc::new(Registry::new());
        Metrics::new(Arc::clone(&registry)).unwrap();
        assert!(Metrics::new(registry).is_err());
    }

    #[test]
    fn test_global_is_shared() {
        let before = global().unwrap().range_requests.get();
        with(|m| m.range_requests.inc());
        assert!(global().unwrap().range_requests.get() > before);
    }
}
