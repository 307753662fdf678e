use std::sync::Arc;

use tracing_subscriber::util::{SubscriberInitExt, TryInitError};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt};

use crate::memory::{SharedStageTimings, StageTimingLayer};

fn env_filter(default_directive: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive))
}

/// Install a human-readable subscriber as the global default.
///
/// `RUST_LOG` takes precedence over `default_directive` (e.g. `"linkage=info"`).
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_telemetry(default_directive: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer().with_target(true))
        .try_init()
}

/// Install a JSON subscriber as the global default, one object per line.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_json(default_directive: &str) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer().json().with_current_span(true).with_span_list(false))
        .try_init()
}

/// Install a human-readable subscriber that also records stage timings into `timings`.
///
/// # Errors
///
/// Fails if a global subscriber is already installed.
pub fn init_with_timings(
    default_directive: &str,
    timings: Arc<SharedStageTimings>,
) -> Result<(), TryInitError> {
    tracing_subscriber::registry()
        .with(env_filter(default_directive))
        .with(fmt::layer().with_target(true))
        .with(StageTimingLayer::new(timings))
        .try_init()
}
