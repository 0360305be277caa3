//! MirrorGate Core — shadow-traffic decision library.
//!
//! This library holds everything in the shadow proxy that does not touch the
//! network: the response differ, the guardrail circuit breaker, configuration
//! loading, and the Prometheus metrics shared with the HTTP layer
//! (`mirrorgate-proxy`).

pub mod config;
pub mod differ;
pub mod guardrail;
pub mod telemetry;
