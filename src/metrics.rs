// Prometheus metrics definitions for the ladder bot.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Auto-confirm timers currently armed.
    pub static ref AUTO_CONFIRM_TIMERS_ACTIVE: IntGauge = IntGauge::new(
        "ladder_auto_confirm_timers_active",
        "Auto-confirm timers currently armed",
    )
    .unwrap();

    /// Players waiting in matchmaking queues.
    pub static ref MATCHMAKING_QUEUE_DEPTH: IntGauge = IntGauge::new(
        "ladder_matchmaking_queue_depth",
        "Players waiting in matchmaking queues",
    )
    .unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Results reported, by match kind.
    pub static ref MATCHES_REPORTED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ladder_matches_reported_total", "Match results reported"),
        &["kind"],
    )
    .unwrap();

    /// Results confirmed, by match kind and source (manual/auto).
    pub static ref MATCHES_CONFIRMED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ladder_matches_confirmed_total", "Match results confirmed"),
        &["kind", "source"],
    )
    .unwrap();

    pub static ref DISPUTES_OPENED_TOTAL: IntCounter =
        IntCounter::new("ladder_disputes_opened_total", "Disputes opened").unwrap();

    pub static ref DISPUTES_RESOLVED_TOTAL: IntCounter =
        IntCounter::new("ladder_disputes_resolved_total", "Disputes resolved by an admin").unwrap();

    /// Confirmed ladder matches undone by an admin.
    pub static ref MATCHES_CANCELLED_TOTAL: IntCounter =
        IntCounter::new("ladder_matches_cancelled_total", "Confirmed matches cancelled").unwrap();

    pub static ref THREADS_CREATED_TOTAL: IntCounter =
        IntCounter::new("ladder_threads_created_total", "Match threads created").unwrap();

    /// Bracket matches settled without being played.
    pub static ref BYES_RESOLVED_TOTAL: IntCounter =
        IntCounter::new("ladder_byes_resolved_total", "Bracket byes auto-resolved").unwrap();

    /// Ladder matches opened by the matchmaking worker.
    pub static ref MATCHMAKING_PAIRS_TOTAL: IntCounter =
        IntCounter::new("ladder_matchmaking_pairs_total", "Players paired by matchmaking").unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("ladder_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "ladder_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

static REGISTER: std::sync::Once = std::sync::Once::new();

/// Register all metrics with the custom registry. Safe to call more than once.
pub fn register_metrics() {
    REGISTER.call_once(|| {
        let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
            Box::new(AUTO_CONFIRM_TIMERS_ACTIVE.clone()),
            Box::new(MATCHMAKING_QUEUE_DEPTH.clone()),
            Box::new(MATCHES_REPORTED_TOTAL.clone()),
            Box::new(MATCHES_CONFIRMED_TOTAL.clone()),
            Box::new(DISPUTES_OPENED_TOTAL.clone()),
            Box::new(DISPUTES_RESOLVED_TOTAL.clone()),
            Box::new(MATCHES_CANCELLED_TOTAL.clone()),
            Box::new(THREADS_CREATED_TOTAL.clone()),
            Box::new(BYES_RESOLVED_TOTAL.clone()),
            Box::new(MATCHMAKING_PAIRS_TOTAL.clone()),
            Box::new(API_REQUESTS_TOTAL.clone()),
            Box::new(API_REQUEST_DURATION_SECONDS.clone()),
        ];

        for c in collectors {
            if let Err(e) = REGISTRY.register(c) {
                tracing::warn!("failed to register metric: {e}");
            }
        }
    });
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Normalize a URL path for metric labels: replace numeric path segments with `:id`
/// to prevent cardinality explosion. Thread handles are opaque and collapse too.
pub fn normalize_path(path: &str) -> String {
    let mut previous = "";
    path.split('/')
        .map(|segment| {
            let out = if segment.parse::<i64>().is_ok() || previous == "threads" {
                ":id"
            } else {
                segment
            };
            previous = segment;
            out
        })
        .collect::<Vec<_>>()
        .join("/")
}
