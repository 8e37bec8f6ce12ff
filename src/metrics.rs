// Prometheus metrics definitions for the Mathlingo backend.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Learners with a live progress session.
    pub static ref ACTIVE_SESSIONS: IntGauge =
        IntGauge::new("mathlingo_active_sessions", "Learners with a live progress session").unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Lessons completed for the first time.
    pub static ref LESSONS_COMPLETED_TOTAL: IntCounter = IntCounter::new(
        "mathlingo_lessons_completed_total",
        "Lessons completed for the first time",
    )
    .unwrap();

    /// Repeat completions absorbed without granting XP.
    pub static ref DUPLICATE_COMPLETIONS_TOTAL: IntCounter = IntCounter::new(
        "mathlingo_duplicate_completions_total",
        "Repeat lesson completions that granted nothing",
    )
    .unwrap();

    /// Total XP granted.
    pub static ref XP_AWARDED_TOTAL: IntCounter =
        IntCounter::new("mathlingo_xp_awarded_total", "Total XP granted").unwrap();

    /// Progress store failures, by operation (load, insert, save).
    pub static ref PROGRESS_STORE_ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mathlingo_progress_store_errors_total", "Progress store failures"),
        &["operation"],
    )
    .unwrap();

    /// Tutoring help requests, by outcome.
    pub static ref AI_HELP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mathlingo_ai_help_requests_total", "Tutoring help requests"),
        &["outcome"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("mathlingo_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Chat-completion provider latency in seconds.
    pub static ref AI_HELP_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new("mathlingo_ai_help_duration_seconds", "Provider call duration in seconds")
            .buckets(vec![0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 20.0, 40.0]),
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "mathlingo_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(ACTIVE_SESSIONS.clone()),
        Box::new(LESSONS_COMPLETED_TOTAL.clone()),
        Box::new(DUPLICATE_COMPLETIONS_TOTAL.clone()),
        Box::new(XP_AWARDED_TOTAL.clone()),
        Box::new(PROGRESS_STORE_ERRORS_TOTAL.clone()),
        Box::new(AI_HELP_REQUESTS_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(AI_HELP_DURATION_SECONDS.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        // Already registered (tests build several routers in one process)
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("metric registration skipped: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// to prevent cardinality explosion.
pub fn normalize_path(path: &str) -> String {
    path.split('/')
        .map(|segment| {
            if segment.parse::<i64>().is_ok() {
                ":id"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}
