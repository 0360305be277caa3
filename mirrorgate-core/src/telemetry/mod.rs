//! Observability for the shadow proxy.
//!
//! Metrics are owned by a [`MirrorMetrics`] instance that is constructed once
//! at startup and handed to the guardrail and dispatcher; nothing here lives
//! in a process-global registry.

pub mod cardinality;
pub mod prom_metrics;

pub use cardinality::RouteLimiter;
pub use prom_metrics::{MirrorMetrics, Target};
