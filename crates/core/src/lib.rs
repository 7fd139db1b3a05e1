//! binscope-core
//!
//! Core library for static analysis of compiled artifacts (executables and
//! firmware images).
//!
//! The pipeline runs one direction:
//! raw bytes -> signature scan -> container extraction (firmware path) ->
//! function recovery -> call graph -> rule-based findings -> report.
//!
//! The `binscope` CLI is one frontend; embedders drive
//! [`services::analysis::AnalysisOrchestrator`] directly.

pub mod model;
pub mod config;
pub mod signatures;
pub mod extract;
pub mod backends;
pub mod image;
pub mod analysis;
pub mod vuln;
pub mod services;

/// Library version, reported by `binscope --version`.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
