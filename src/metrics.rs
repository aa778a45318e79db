//! Metrics support for the configuration database

use iroh_metrics::{Counter, MetricsGroup};

/// Metrics for cdb-dal
#[derive(Debug, Default, MetricsGroup)]
#[metrics(name = "cdb")]
pub struct Metrics {
    /// Every façade call, counted before the shutdown check.
    #[metrics(help = "Number of service invocations")]
    pub invocations: Counter,
    /// Documents served from the cache.
    #[metrics(help = "Documents served from the cache")]
    pub cache_hits: Counter,
    /// Document lookups that had to load and assemble records.
    #[metrics(help = "Document lookups that missed the cache")]
    pub cache_misses: Counter,
    /// Documents evicted by the memory check.
    #[metrics(help = "Documents evicted under memory pressure")]
    pub cache_evictions: Counter,
    /// DAO objects created.
    #[metrics(help = "DAO objects created")]
    pub dao_created: Counter,
    /// DAO objects destroyed by invalidation.
    #[metrics(help = "DAO objects destroyed by invalidation")]
    pub dao_destroyed: Counter,
    /// Change notifications delivered to listeners.
    #[metrics(help = "Change notifications delivered to listeners")]
    pub notifications_sent: Counter,
    /// Listeners removed after a failed delivery.
    #[metrics(help = "Listeners dropped after a failed delivery")]
    pub listeners_pruned: Counter,
    /// Lookups of curls that do not exist.
    #[metrics(help = "Lookups of curls that do not exist")]
    pub record_not_found: Counter,
    /// Number of HTTP requests.
    #[metrics(help = "Number of HTTP requests")]
    pub http_requests: Counter,
    /// Number of HTTP requests with a 2xx status code.
    #[metrics(help = "Number of HTTP requests with a 2xx status code")]
    pub http_requests_success: Counter,
    /// Number of HTTP requests with a non-2xx status code.
    #[metrics(help = "Number of HTTP requests with a non-2xx status code")]
    pub http_requests_error: Counter,
    /// Total duration of all HTTP requests, in milliseconds.
    #[metrics(help = "Total duration of all HTTP requests")]
    pub http_requests_duration_ms: Counter,
}
