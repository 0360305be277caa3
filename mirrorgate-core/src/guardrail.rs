//! Guardrail circuit breaker for candidate mirroring.
//!
//! The guardrail decides whether mirroring may happen at all and watches the
//! outcome of every mirrored pair. When the candidate is measurably worse than
//! the baseline for long enough, it trips and mirroring stops until either the
//! cooldown expires or an operator re-enables it.
//!
//! # State Machine
//!
//! ```text
//!            breach_streak reaches breach_consecutive
//!                      / disable(reason)
//!   ┌─────────┐ ──────────────────────────────────► ┌──────────┐
//!   │ Enabled │                                     │ Disabled │
//!   └─────────┘ ◄────────────────────────────────── └──────────┘
//!            cooldown elapsed (checked in should_mirror)
//!                      / enable(reason)
//! ```
//!
//! The breach streak is a leaky counter: a breach adds one, a healthy pair
//! removes one (never below zero). It is reset to zero on every trip and on
//! manual enable. Cooldown expiry does not touch it; it is already zero from
//! the trip.
//!
//! All operations serialize on one `parking_lot::Mutex`. Critical sections
//! are pure in-memory transitions plus atomic metric updates; log lines are
//! emitted after the lock is released.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::telemetry::MirrorMetrics;

/// Reason recorded by [`Guardrail::disable`] when none is given.
pub const DEFAULT_DISABLE_REASON: &str = "manual disable";

/// Baseline latencies at or below zero are treated as this.
const MIN_BASELINE_LATENCY: Duration = Duration::from_millis(1);

/// Immutable guardrail thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct GuardrailConfig {
    /// Candidate/baseline latency ratio above which a pair breaches.
    pub latency_ratio_threshold: f64,
    /// Error-delta threshold (see [`Guardrail::observe_pair`]).
    pub error_delta_threshold: f64,
    /// Breach streak that trips the breaker.
    pub breach_consecutive: u32,
    /// Minimum time disabled before auto re-enable. Zero means never.
    pub cooldown: Duration,
}

impl Default for GuardrailConfig {
    fn default() -> Self {
        Self {
            latency_ratio_threshold: 1.15,
            error_delta_threshold: 0.005,
            breach_consecutive: 5,
            cooldown: Duration::from_secs(10),
        }
    }
}

/// Outcome of one mirrored request, consumed by [`Guardrail::observe_pair`].
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorSample {
    /// Route label (`"<METHOD> <path>"`).
    pub route: String,
    pub baseline_latency: Duration,
    pub candidate_latency: Duration,
    /// Baseline answered with a 5xx status.
    pub baseline_error: bool,
    /// Candidate failed at transport/read level or answered with a 5xx status.
    pub candidate_error: bool,
}

/// What a single [`Guardrail::observe_pair`] call did.
#[derive(Debug, Clone, PartialEq)]
pub enum PairOutcome {
    /// Guardrail was disabled; the sample was discarded.
    Ignored,
    /// The pair breached but the streak is still below the trip threshold.
    Breach { streak: u32 },
    /// The pair was healthy; the streak decayed to `streak`.
    Healthy { streak: u32 },
    /// The pair breached and tripped the breaker.
    Tripped { reason: String },
}

/// Read-only snapshot for `/control/status`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardrailStatus {
    pub enabled: bool,
    /// `None` until the first trip or manual disable.
    pub last_abort_time: Option<DateTime<Utc>>,
    pub last_abort_reason: String,
    pub breach_streak: u32,

    pub latency_ratio_threshold: f64,
    pub error_delta_threshold: f64,
    pub breach_consecutive: u32,
    pub cooldown_seconds: u64,
}

/// Time of the most recent transition to disabled.
#[derive(Debug, Clone, Copy)]
struct AbortMark {
    /// Monotonic, for cooldown arithmetic.
    at: Instant,
    /// Wall clock, for reporting.
    wall: DateTime<Utc>,
}

#[derive(Debug)]
struct GuardrailState {
    enabled: bool,
    breach_streak: u32,
    last_abort: Option<AbortMark>,
    last_abort_reason: String,
}

/// Mutex-protected circuit breaker governing the whole proxy.
pub struct Guardrail {
    config: GuardrailConfig,
    state: Mutex<GuardrailState>,
    metrics: Option<Arc<MirrorMetrics>>,
}

impl Guardrail {
    /// Create an enabled guardrail.
    ///
    /// A `breach_consecutive` of zero is raised to one.
    pub fn new(mut config: GuardrailConfig) -> Self {
        if config.breach_consecutive == 0 {
            warn!("breach_consecutive must be positive, using 1");
            config.breach_consecutive = 1;
        }

        Self {
            config,
            state: Mutex::new(GuardrailState {
                enabled: true,
                breach_streak: 0,
                last_abort: None,
                last_abort_reason: String::new(),
            }),
            metrics: None,
        }
    }

    /// Attach metrics. The enabled gauge is synced immediately.
    pub fn with_metrics(mut self, metrics: Arc<MirrorMetrics>) -> Self {
        metrics.set_enabled(self.state.lock().enabled);
        self.metrics = Some(metrics);
        self
    }

    #[cfg(test)]
    pub fn config(&self) -> &GuardrailConfig {
        &self.config
    }

    /// Whether mirroring is currently allowed.
    ///
    /// A disabled guardrail re-enables itself here once the cooldown has
    /// elapsed; with a zero cooldown it stays disabled until [`enable`].
    ///
    /// [`enable`]: Guardrail::enable
    pub fn should_mirror(&self) -> bool {
        self.should_mirror_at(Instant::now())
    }

    /// [`should_mirror`](Guardrail::should_mirror) against an explicit clock.
    pub fn should_mirror_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();

        if state.enabled {
            return true;
        }

        if self.config.cooldown.is_zero() {
            return false;
        }

        let expired = state
            .last_abort
            .map(|mark| now.saturating_duration_since(mark.at) >= self.config.cooldown)
            .unwrap_or(true);
        if !expired {
            return false;
        }

        state.enabled = true;
        self.set_enabled_gauge(true);
        drop(state);

        info!(
            cooldown_secs = self.config.cooldown.as_secs(),
            "Guardrail cooldown expired, mirroring re-enabled"
        );
        true
    }

    /// Feed one baseline/candidate pair into the breaker.
    ///
    /// A pair breaches when `candidate_latency / baseline_latency` exceeds
    /// the latency threshold, or when only the candidate errored. The error
    /// branch compares an error delta of `1.0` against the configured
    /// threshold, so with any threshold below `1.0` every candidate-only
    /// error breaches.
    pub fn observe_pair(&self, sample: MirrorSample) -> PairOutcome {
        self.observe_pair_at(sample, Instant::now())
    }

    /// [`observe_pair`](Guardrail::observe_pair) against an explicit clock.
    pub fn observe_pair_at(&self, sample: MirrorSample, now: Instant) -> PairOutcome {
        let mut state = self.state.lock();

        if !state.enabled {
            return PairOutcome::Ignored;
        }

        let baseline = sample.baseline_latency.max(MIN_BASELINE_LATENCY);
        let latency_ratio = sample.candidate_latency.as_secs_f64() / baseline.as_secs_f64();

        let mut breach = latency_ratio > self.config.latency_ratio_threshold;

        if sample.candidate_error && !sample.baseline_error {
            let error_delta = 1.0;
            if error_delta > self.config.error_delta_threshold {
                breach = true;
            }
        }

        if breach {
            state.breach_streak += 1;
        } else {
            state.breach_streak = state.breach_streak.saturating_sub(1);
        }

        if state.breach_streak < self.config.breach_consecutive {
            return if breach {
                PairOutcome::Breach {
                    streak: state.breach_streak,
                }
            } else {
                PairOutcome::Healthy {
                    streak: state.breach_streak,
                }
            };
        }

        let reason = format!(
            "route={} latencyRatio={:.2} baselineErr={} candidateErr={}",
            sample.route, latency_ratio, sample.baseline_error, sample.candidate_error
        );
        self.trip(&mut state, reason.clone(), now);
        drop(state);

        warn!(
            route = %sample.route,
            latency_ratio = latency_ratio,
            baseline_error = sample.baseline_error,
            candidate_error = sample.candidate_error,
            "Guardrail tripped, mirroring disabled"
        );
        PairOutcome::Tripped { reason }
    }

    /// Operator override: stop mirroring now. No-op if already disabled.
    ///
    /// An empty reason is recorded as [`DEFAULT_DISABLE_REASON`].
    pub fn disable(&self, reason: &str) {
        let mut state = self.state.lock();
        if !state.enabled {
            return;
        }

        let reason = if reason.is_empty() {
            DEFAULT_DISABLE_REASON
        } else {
            reason
        };
        self.trip(&mut state, reason.to_string(), Instant::now());
        drop(state);

        warn!(reason = reason, "Mirroring disabled by operator");
    }

    /// Operator override: resume mirroring now, regardless of cooldown.
    /// No-op if already enabled.
    ///
    /// A non-empty reason replaces the stored reason text.
    pub fn enable(&self, reason: &str) {
        let mut state = self.state.lock();
        if state.enabled {
            return;
        }

        state.enabled = true;
        state.breach_streak = 0;
        if !reason.is_empty() {
            state.last_abort_reason = reason.to_string();
        }
        self.set_enabled_gauge(true);
        drop(state);

        info!(reason = reason, "Mirroring enabled by operator");
    }

    /// Snapshot of state and configuration.
    pub fn status(&self) -> GuardrailStatus {
        let state = self.state.lock();

        GuardrailStatus {
            enabled: state.enabled,
            last_abort_time: state.last_abort.map(|mark| mark.wall),
            last_abort_reason: state.last_abort_reason.clone(),
            breach_streak: state.breach_streak,

            latency_ratio_threshold: self.config.latency_ratio_threshold,
            error_delta_threshold: self.config.error_delta_threshold,
            breach_consecutive: self.config.breach_consecutive,
            cooldown_seconds: self.config.cooldown.as_secs(),
        }
    }

    /// Transition to disabled. Caller holds the lock and has checked `enabled`.
    fn trip(&self, state: &mut GuardrailState, reason: String, now: Instant) {
        state.enabled = false;
        state.breach_streak = 0;
        state.last_abort = Some(AbortMark {
            at: now,
            wall: Utc::now(),
        });
        state.last_abort_reason = reason;

        if let Some(metrics) = &self.metrics {
            metrics.set_enabled(false);
            metrics.record_abort();
        }
    }

    fn set_enabled_gauge(&self, enabled: bool) {
        if let Some(metrics) = &self.metrics {
            metrics.set_enabled(enabled);
        }
    }
}
