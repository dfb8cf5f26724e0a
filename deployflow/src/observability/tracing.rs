//! Tracing setup and span helpers.

use std::time::Instant;
use tracing::Span;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

use crate::config::LoggingConfig;
use crate::core::RunTarget;
use crate::errors::{DeployflowError, Result};

/// Installs the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured filter. Fails with a
/// `Config` error if the filter does not parse or a subscriber is already
/// installed.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.filter)
            .map_err(|e| DeployflowError::Config(format!("invalid log filter: {e}")))?,
    };

    let installed = if config.json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer())
            .try_init()
    };

    installed.map_err(|e| DeployflowError::Config(format!("cannot install subscriber: {e}")))
}

/// Creates the span stage tasks of a run execute in.
#[must_use]
pub fn run_span(target: &RunTarget) -> Span {
    tracing::info_span!(
        "run",
        run_id = %target.run_id,
        pipeline_id = %target.pipeline_id,
        commit_ref = %target.commit_ref,
    )
}

/// Simple span timing helper.
#[derive(Debug)]
pub struct SpanTimer {
    start: Instant,
}

impl SpanTimer {
    /// Starts a new span timer.
    #[must_use]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Returns the elapsed time in milliseconds.
    #[must_use]
    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RunId;

    #[test]
    fn test_span_timer() {
        let timer = SpanTimer::start();
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed_ms() >= 5.0);
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            filter: "deployflow=loudest".to_string(),
            json: false,
        };
        assert!(matches!(init_tracing(&config), Err(DeployflowError::Config(_))));
    }

    #[test]
    fn test_run_span_builds_without_subscriber() {
        let target = RunTarget {
            run_id: RunId::new(),
            pipeline_id: "web".to_string(),
            commit_ref: "abc123".to_string(),
        };
        let span = run_span(&target);
        let _entered = span.enter();
    }
}
