//! Shared test utilities for relocator integration tests.
//!
//! This module provides:
//! - `TestHarness` wiring an orchestrator to in-memory stores, a real
//!   worker pool and a cost guard
//! - Builders for source records and migration configs

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::{FlakyStore, ProcessorContext, RecordingCdn, RecordingTracker, TestHarness};
