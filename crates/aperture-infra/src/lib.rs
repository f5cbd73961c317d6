//! Aperture Infrastructure Library
//!
//! Process-wide concerns shared by the binaries: tracing subscriber setup.

#[cfg(feature = "observability-basic")]
pub mod telemetry;

#[cfg(feature = "observability-basic")]
pub use telemetry::{init_telemetry, shutdown_telemetry};
