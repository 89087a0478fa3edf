//! Logging bootstrap and metric helpers shared by IM bridge binaries.
//!
//! Libraries only emit through `tracing` and the `metrics` facade; binaries
//! call [`install`] once at startup to choose how that output is rendered.

use std::sync::OnceLock;

use anyhow::Result;
use tracing::warn;

mod config;
mod context;
mod recorders;
mod tracing_init;

pub use config::{LogFormat, TelemetryConfig};
pub use context::TelemetryLabels;
pub use recorders::{MetricsRecorder, MetricsSnapshot, record_counter, record_gauge};
pub use tracing_init::{init_telemetry, telemetry_initialised};

static RECORDER: OnceLock<MetricsRecorder> = OnceLock::new();

/// Installs the shared subscriber configured from the environment and the
/// in-process metrics recorder.
pub fn install(service_name: &str) -> Result<()> {
    init_telemetry(&TelemetryConfig::from_env(
        service_name,
        env!("CARGO_PKG_VERSION"),
    ))?;
    install_metrics_recorder();
    Ok(())
}

/// Sets [`MetricsRecorder`] as the global `metrics` recorder once. Returns
/// `false` if another recorder was already installed.
pub fn install_metrics_recorder() -> bool {
    if RECORDER.get().is_some() {
        return true;
    }
    let recorder = MetricsRecorder::new();
    if metrics::set_global_recorder(recorder.clone()).is_err() {
        warn!("a metrics recorder is already installed; keeping it");
        return false;
    }
    RECORDER.set(recorder).ok();
    true
}

/// Values recorded since [`install`], if our recorder is the global one.
pub fn metrics_snapshot() -> Option<MetricsSnapshot> {
    RECORDER.get().map(MetricsRecorder::snapshot)
}
