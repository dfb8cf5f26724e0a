//! Utility functions shared across modules.

pub mod validation;

pub use validation::{validate_channel, validate_commit_ref, validate_pipeline_id};
