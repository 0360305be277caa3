//! Environment-driven configuration for the shadow proxy.
//!
//! Every option has exactly one typed default. Unset variables use the
//! default silently; set-but-unparseable variables log a warning and use the
//! default. Loading itself never fails.
//!
//! # Environment Variables
//!
//! | Variable | Default | Effect |
//! |----------|---------|--------|
//! | `BASELINE_URL` | `http://service-v1:4001` | Baseline base URL |
//! | `CANDIDATE_URL` | `http://service-v2:4002` | Candidate base URL |
//! | `MIRROR_FRACTION` | `0.25` | Sampling probability (≤ 0 disables mirroring) |
//! | `ABORT_P99_RATIO` | `1.15` | Latency ratio threshold |
//! | `ABORT_ERROR_DELTA` | `0.005` | Error-delta threshold |
//! | `ABORT_CONSECUTIVE` | `5` | Breach streak that trips the guardrail |
//! | `ABORT_COOLDOWN` | `10` | Seconds before auto re-enable (0 = never) |
//! | `LISTEN_ADDR` | `:8080` | Bind address |
//! | `BASELINE_TIMEOUT_SECS` | `5` | Baseline round-trip timeout |
//! | `MIRROR_TIMEOUT_SECS` | `5` | Candidate round-trip timeout |
//! | `MIRROR_MAX_IN_FLIGHT` | `1024` | Concurrent mirror tasks (0 = unbounded) |
//! | `SHUTDOWN_TIMEOUT_SECS` | `30` | Drain window for in-flight mirrors |

mod error;

pub use error::ConfigError;

use std::time::Duration;

use tracing::warn;

use crate::guardrail::GuardrailConfig;

/// Runtime configuration for the shadow proxy.
#[derive(Debug, Clone, PartialEq)]
pub struct MirrorConfig {
    /// Baseline base URL (scheme + host).
    pub baseline_url: String,

    /// Candidate base URL (scheme + host).
    pub candidate_url: String,

    /// Probability that an eligible request is mirrored.
    pub mirror_fraction: f64,

    /// Candidate/baseline latency ratio above which an observation breaches.
    pub latency_ratio_threshold: f64,

    /// Error-delta threshold.
    pub error_delta_threshold: f64,

    /// Breach streak that trips the guardrail.
    pub breach_consecutive: u32,

    /// Time after a trip before mirroring may resume. Zero means never.
    pub cooldown: Duration,

    /// Bind address, Go-style `:port` accepted.
    pub listen_addr: String,

    /// Timeout for the client-facing baseline call, including body read.
    pub baseline_timeout: Duration,

    /// Timeout for the detached candidate call, including body read.
    pub mirror_timeout: Duration,

    /// Maximum concurrently running mirror tasks; `0` disables the limit.
    pub mirror_max_in_flight: usize,

    /// How long shutdown waits for in-flight mirror tasks.
    pub shutdown_timeout: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            baseline_url: "http://service-v1:4001".to_string(),
            candidate_url: "http://service-v2:4002".to_string(),
            mirror_fraction: 0.25,
            latency_ratio_threshold: 1.15,
            error_delta_threshold: 0.005,
            breach_consecutive: 5,
            cooldown: Duration::from_secs(10),
            listen_addr: ":8080".to_string(),
            baseline_timeout: Duration::from_secs(5),
            mirror_timeout: Duration::from_secs(5),
            mirror_max_in_flight: 1024,
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl MirrorConfig {
    /// Load configuration from environment variables with defaults.
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            baseline_url: env_string("BASELINE_URL", default.baseline_url),
            candidate_url: env_string("CANDIDATE_URL", default.candidate_url),

            mirror_fraction: parse_env_warn("MIRROR_FRACTION", default.mirror_fraction),

            latency_ratio_threshold: parse_env_warn(
                "ABORT_P99_RATIO",
                default.latency_ratio_threshold,
            ),
            error_delta_threshold: parse_env_warn(
                "ABORT_ERROR_DELTA",
                default.error_delta_threshold,
            ),
            breach_consecutive: parse_breach_consecutive(default.breach_consecutive),
            cooldown: parse_cooldown(default.cooldown),

            listen_addr: env_string("LISTEN_ADDR", default.listen_addr),

            baseline_timeout: parse_upstream_timeout(
                "BASELINE_TIMEOUT_SECS",
                default.baseline_timeout,
            ),
            mirror_timeout: parse_upstream_timeout("MIRROR_TIMEOUT_SECS", default.mirror_timeout),
            mirror_max_in_flight: parse_env_warn(
                "MIRROR_MAX_IN_FLIGHT",
                default.mirror_max_in_flight,
            ),
            shutdown_timeout: Duration::from_secs(parse_env_warn(
                "SHUTDOWN_TIMEOUT_SECS",
                default.shutdown_timeout.as_secs(),
            )),
        }
    }

    /// The immutable subset consumed by the guardrail.
    pub fn guardrail_config(&self) -> GuardrailConfig {
        GuardrailConfig {
            latency_ratio_threshold: self.latency_ratio_threshold,
            error_delta_threshold: self.error_delta_threshold,
            breach_consecutive: self.breach_consecutive,
            cooldown: self.cooldown,
        }
    }

    /// Address to hand to the listener.
    ///
    /// A bare `:port` binds all IPv4 interfaces. Anything else is passed
    /// through untouched, so hostnames (`localhost:8080`) are resolved at
    /// bind time and a bad address surfaces as a bind error.
    pub fn bind_addr(&self) -> String {
        let addr = self.listen_addr.trim();
        if addr.starts_with(':') {
            format!("0.0.0.0{}", addr)
        } else {
            addr.to_string()
        }
    }
}

/// Read a string variable; empty counts as unset.
fn env_string(name: &str, default: String) -> String {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => val,
        _ => default,
    }
}

/// `ABORT_CONSECUTIVE` must be positive: a zero streak would trip on the
/// first observation regardless of outcome.
fn parse_breach_consecutive(default: u32) -> u32 {
    let value = parse_env_warn("ABORT_CONSECUTIVE", default);
    if value == 0 {
        warn!(
            env_var = "ABORT_CONSECUTIVE",
            default = default,
            "ABORT_CONSECUTIVE must be positive, using default"
        );
        return default;
    }
    value
}

/// Upstream timeouts are whole seconds and must be positive: a zero timeout
/// fails every call before it is sent.
fn parse_upstream_timeout(name: &str, default: Duration) -> Duration {
    let secs = parse_env_warn(name, default.as_secs());
    if secs == 0 {
        warn!(
            env_var = name,
            default = default.as_secs(),
            "Upstream timeout must be positive, using default"
        );
        return default;
    }
    Duration::from_secs(secs)
}

/// `ABORT_COOLDOWN` is whole seconds; negative values mean "never
/// auto-recover", same as zero.
fn parse_cooldown(default: Duration) -> Duration {
    let secs = parse_env_warn("ABORT_COOLDOWN", default.as_secs() as i64);
    Duration::from_secs(secs.max(0) as u64)
}

/// Parse an environment variable with a warning on invalid values.
///
/// If the env var is set but cannot be parsed, logs a warning and returns the default.
/// If the env var is unset or empty, returns the default silently.
fn parse_env_warn<T: std::str::FromStr + std::fmt::Display>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(val) if !val.trim().is_empty() => match val.trim().parse::<T>() {
            Ok(parsed) => parsed,
            Err(_) => {
                warn!(
                    env_var = name,
                    value = %val,
                    default = %default,
                    "Invalid value for environment variable, using default"
                );
                default
            }
        },
        _ => default,
    }
}
