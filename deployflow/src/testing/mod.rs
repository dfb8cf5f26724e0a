//! Testing utilities for deployflow.
//!
//! This module provides:
//! - Recording source, build and provisioning collaborators
//! - A run store whose writes can be made to fail
//! - An orchestrator harness over in-memory stores

mod fixtures;
mod mocks;

pub use fixtures::{HarnessBuilder, TestHarness, SETTLE_TIMEOUT};
pub use mocks::{FaultyRunStore, RecordingBackend, RecordingBuildProvider, StaticSourceProvider};
