//! MirrorGate HTTP shadow proxy.
//!
//! This crate contains the network side of MirrorGate: the request
//! dispatcher (baseline passthrough plus candidate mirroring), the upstream
//! client, the control/health router and the request logging layer. The
//! decision logic lives in `mirrorgate-core`.

pub mod control;
pub mod dispatcher;
pub mod error;
pub mod logging_layer;
pub mod upstream;
