//! Pipeline services: the analysis orchestrator and decoder backends.

pub mod analysis;
pub mod backends;
