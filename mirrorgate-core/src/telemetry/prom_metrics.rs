//! Prometheus metrics using the prometheus-client crate.
//!
//! [`MirrorMetrics`] registers every series the proxy exports. The registry
//! is encoded in OpenMetrics text format by the `/metrics` handler.
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `mirror_requests_total` | counter | route, target |
//! | `mirror_latency_seconds` | histogram | route, target |
//! | `mirror_diff_mismatches_total` | counter | route |
//! | `mirror_diff_errors_total` | counter | route |
//! | `mirror_aborts_total` | counter | |
//! | `mirror_enabled` | gauge | |
//! | `mirror_dropped_total` | counter | reason |
//! | `mirror_in_flight` | gauge | |

use std::fmt;
use std::time::Duration;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use super::cardinality::RouteLimiter;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Which upstream a call went to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    Baseline,
    Candidate,
}

impl Target {
    pub fn as_str(&self) -> &'static str {
        match self {
            Target::Baseline => "baseline",
            Target::Candidate => "candidate",
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels for upstream request counters and latency histograms.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteTargetLabels {
    /// Route label (`"<METHOD> <path>"`, cardinality-limited)
    pub route: String,
    /// `"baseline"` or `"candidate"`
    pub target: String,
}

/// Labels for diff counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RouteLabels {
    /// Route label (cardinality-limited)
    pub route: String,
}

/// Labels for mirror drop counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DropLabels {
    /// Why the mirror was not attempted (e.g. `"saturated"`)
    pub reason: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Histogram Bucket Constants
// ─────────────────────────────────────────────────────────────────────────────

/// Upstream latency buckets in seconds (the Prometheus client defaults).
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Maximum distinct route labels before values collapse to `__other__`.
const MAX_ROUTES: usize = 200;

// ─────────────────────────────────────────────────────────────────────────────
// MirrorMetrics
// ─────────────────────────────────────────────────────────────────────────────

/// Prometheus metrics for the shadow proxy.
///
/// Counters registered without the `_total` suffix; prometheus-client appends
/// it when encoding.
pub struct MirrorMetrics {
    /// Upstream calls per route and target.
    pub requests_total: Family<RouteTargetLabels, Counter>,

    /// Upstream call latency in seconds per route and target.
    pub latency_seconds: Family<RouteTargetLabels, Histogram>,

    /// Structural mismatches between baseline and candidate bodies.
    pub diff_mismatches_total: Family<RouteLabels, Counter>,

    /// Diffs that could not be evaluated (canonical encoding failed).
    pub diff_errors_total: Family<RouteLabels, Counter>,

    /// Times mirroring was disabled, automatically or manually.
    pub aborts_total: Counter,

    /// 1 while mirroring is enabled, 0 while disabled.
    pub enabled: Gauge,

    /// Mirrors skipped after admission (e.g. in-flight limit reached).
    pub dropped_total: Family<DropLabels, Counter>,

    /// Mirror tasks currently running.
    pub in_flight: Gauge,

    route_limiter: RouteLimiter,
}

impl MirrorMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let requests_total = Family::<RouteTargetLabels, Counter>::default();
        registry.register(
            "mirror_requests",
            "Total requests handled by proxy, per route and target (baseline/candidate)",
            requests_total.clone(),
        );

        let latency_seconds =
            Family::<RouteTargetLabels, Histogram>::new_with_constructor(|| {
                Histogram::new(LATENCY_BUCKETS.iter().copied())
            });
        registry.register(
            "mirror_latency_seconds",
            "Latency of upstream calls in seconds, per route and target",
            latency_seconds.clone(),
        );

        let diff_mismatches_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "mirror_diff_mismatches",
            "Response mismatches between baseline and candidate per route",
            diff_mismatches_total.clone(),
        );

        let diff_errors_total = Family::<RouteLabels, Counter>::default();
        registry.register(
            "mirror_diff_errors",
            "Diffs that failed to evaluate per route",
            diff_errors_total.clone(),
        );

        let aborts_total = Counter::default();
        registry.register(
            "mirror_aborts",
            "Number of times mirroring was disabled by the guardrail",
            aborts_total.clone(),
        );

        let enabled = Gauge::default();
        registry.register(
            "mirror_enabled",
            "1 if mirroring to candidate is enabled, 0 if disabled",
            enabled.clone(),
        );

        let dropped_total = Family::<DropLabels, Counter>::default();
        registry.register(
            "mirror_dropped",
            "Mirror attempts skipped after admission, by reason",
            dropped_total.clone(),
        );

        let in_flight = Gauge::default();
        registry.register(
            "mirror_in_flight",
            "Mirror tasks currently running",
            in_flight.clone(),
        );

        Self {
            requests_total,
            latency_seconds,
            diff_mismatches_total,
            diff_errors_total,
            aborts_total,
            enabled,
            dropped_total,
            in_flight,
            route_limiter: RouteLimiter::new(MAX_ROUTES),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Convenience Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Record one upstream call and its latency.
    pub fn record_upstream(&self, route: &str, target: Target, latency: Duration) {
        let labels = RouteTargetLabels {
            route: self.route_limiter.label(route),
            target: target.as_str().to_string(),
        };
        self.requests_total.get_or_create(&labels).inc();
        self.latency_seconds
            .get_or_create(&labels)
            .observe(latency.as_secs_f64());
    }

    /// Record a structural mismatch for `route`.
    pub fn record_mismatch(&self, route: &str) {
        self.diff_mismatches_total
            .get_or_create(&self.route_labels(route))
            .inc();
    }

    /// Record a diff that could not be evaluated for `route`.
    pub fn record_diff_error(&self, route: &str) {
        self.diff_errors_total
            .get_or_create(&self.route_labels(route))
            .inc();
    }

    /// Record a guardrail trip or manual disable.
    pub fn record_abort(&self) {
        self.aborts_total.inc();
    }

    /// Reflect the guardrail state in the `mirror_enabled` gauge.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.set(i64::from(enabled));
    }

    /// Record a mirror that was admitted but not started.
    pub fn record_dropped(&self, reason: &str) {
        self.dropped_total
            .get_or_create(&DropLabels {
                reason: reason.to_string(),
            })
            .inc();
    }

    pub fn mirror_started(&self) {
        self.in_flight.inc();
    }

    pub fn mirror_finished(&self) {
        self.in_flight.dec();
    }

    fn route_labels(&self, route: &str) -> RouteLabels {
        RouteLabels {
            route: self.route_limiter.label(route),
        }
    }
}
