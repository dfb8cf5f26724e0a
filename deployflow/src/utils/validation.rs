//! Validation of externally supplied identifiers.
//!
//! Pipeline ids and commit refs arrive from triggers and operators and end
//! up in file names and log fields, so they are checked before a run is
//! created.

use regex::Regex;
use std::sync::LazyLock;

use crate::errors::{DeployflowError, Result};

static PIPELINE_ID: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,99}$").expect("pattern is valid")
});

static COMMIT_REF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/@^~-]{0,254}$").expect("pattern is valid")
});

/// Validates a pipeline identifier.
///
/// Accepts 1-100 characters of letters, digits, `.`, `_` and `-`, starting
/// with a letter or digit.
pub fn validate_pipeline_id(pipeline_id: &str) -> Result<()> {
    if PIPELINE_ID.is_match(pipeline_id) {
        Ok(())
    } else {
        Err(DeployflowError::validation(format!(
            "invalid pipeline id '{pipeline_id}'"
        )))
    }
}

/// Validates a commit reference (sha, branch or tag).
pub fn validate_commit_ref(commit_ref: &str) -> Result<()> {
    if COMMIT_REF.is_match(commit_ref) && !commit_ref.contains("..") {
        Ok(())
    } else {
        Err(DeployflowError::validation(format!(
            "invalid commit ref '{commit_ref}'"
        )))
    }
}

/// Validates a subscriber channel of the form `scheme:address`.
pub fn validate_channel(channel: &str) -> Result<()> {
    match channel.split_once(':') {
        Some((scheme, address)) if !scheme.is_empty() && !address.trim().is_empty() => Ok(()),
        _ => Err(DeployflowError::validation(format!(
            "invalid notification channel '{channel}', expected 'scheme:address'"
        ))),
    }
}
