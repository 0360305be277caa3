//! Test helpers for MirrorGate integration tests.
//!
//! - Mock HTTP upstreams (baseline / candidate)
//! - In-process proxy harness

#![allow(unused_imports)] // Re-exports may not be used by all test files

pub mod harness;
pub mod mock_upstream;

pub use harness::*;
pub use mock_upstream::*;
