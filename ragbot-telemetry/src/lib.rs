//! # ragbot-telemetry
//!
//! Logging setup for ragbot binaries and an in-memory event capture layer
//! for tests.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! ragbot_telemetry::init_telemetry("kb-console").ok();
//! tracing::info!("ready");
//! ```
//!
//! `RUST_LOG` overrides the default `info` filter, e.g.
//! `RUST_LOG=ragbot_kb=debug`.

pub mod capture;

pub use capture::{CapturedEvent, CapturedEvents, EventCaptureLayer};

use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Errors from installing the global subscriber.
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// A global subscriber was already set, by us or by someone else.
    #[error("a global tracing subscriber is already installed")]
    AlreadyInitialized,
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Install a compact, human-readable subscriber as the global default.
///
/// # Errors
///
/// Returns [`TelemetryError::AlreadyInitialized`] on every call after the
/// first.
pub fn init_telemetry(service_name: &str) -> Result<(), TelemetryError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().compact().with_target(true))
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    tracing::info!(service.name = service_name, "telemetry initialized");
    Ok(())
}

/// Install a newline-delimited JSON subscriber as the global default.
///
/// # Errors
///
/// Returns [`TelemetryError::AlreadyInitialized`] on every call after the
/// first.
pub fn init_json_telemetry(service_name: &str) -> Result<(), TelemetryError> {
    tracing_subscriber::registry()
        .with(env_filter())
        .with(fmt::layer().json().with_current_span(false).with_span_list(false))
        .try_init()
        .map_err(|_| TelemetryError::AlreadyInitialized)?;

    tracing::info!(service.name = service_name, "telemetry initialized");
    Ok(())
}
