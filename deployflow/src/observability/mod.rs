//! Observability utilities: subscriber setup, spans and timers.

mod tracing;

pub use self::tracing::{init_tracing, run_span, SpanTimer};
