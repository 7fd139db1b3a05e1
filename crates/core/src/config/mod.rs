//! Run configuration.
//!
//! `AnalysisConfig` is an explicit value threaded through the orchestrator at
//! construction time. Nothing here reads process environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Architecture;

/// Default bound on nested container extraction.
pub const DEFAULT_MAX_DEPTH: u32 = 8;

/// Default cap on a single materialized (decompressed) entry.
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 64 * 1024 * 1024;

/// Default cap on decoded instructions per recovered function.
pub const DEFAULT_MAX_INSTRUCTIONS: usize = 65_536;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config at {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Failed to parse config JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Serializable configuration for one analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Optional signature set file (YAML or JSON). Built-in set when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signatures: Option<PathBuf>,
    /// Optional vulnerability rule file (YAML or JSON). Built-in rules when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rules: Option<PathBuf>,
    /// Maximum container nesting depth.
    pub max_depth: u32,
    /// Worker pool size; `0` lets rayon pick one thread per core.
    pub workers: usize,
    /// Wall-clock budget for the whole run, in seconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_budget_secs: Option<u64>,
    /// When set, extracted entries are written below this directory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staging_dir: Option<PathBuf>,
    /// Largest decompressed entry the extractor will materialize.
    pub max_entry_size: u64,
    /// Instruction budget for a single recovered function.
    pub max_instructions_per_function: usize,
    /// Load address used when the artifact is analyzed as a raw code blob.
    pub base_address: u64,
    /// Architecture hint. Wins over anything detected from headers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arch: Option<Architecture>,
    /// Decoder backend name (see `DecoderRegistry`).
    pub decoder: String,
    /// Routines known never to return; a call to one ends the current path.
    pub no_return: Vec<String>,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            signatures: None,
            rules: None,
            max_depth: DEFAULT_MAX_DEPTH,
            workers: 0,
            time_budget_secs: None,
            staging_dir: None,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            max_instructions_per_function: DEFAULT_MAX_INSTRUCTIONS,
            base_address: 0,
            arch: None,
            decoder: crate::backends::DEFAULT_DECODER.to_string(),
            no_return: default_no_return(),
        }
    }
}

fn default_no_return() -> Vec<String> {
    [
        "exit",
        "_exit",
        "_Exit",
        "abort",
        "__stack_chk_fail",
        "__assert_fail",
        "longjmp",
        "pthread_exit",
        "__libc_start_main",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

impl AnalysisConfig {
    /// Load a config file, choosing JSON or YAML by extension.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        let config: AnalysisConfig = if is_json(path) {
            serde_json::from_slice(&bytes)?
        } else {
            serde_yaml::from_slice(&bytes)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_depth == 0 {
            return Err(ConfigError::Invalid("max_depth must be at least 1".into()));
        }
        if self.max_instructions_per_function == 0 {
            return Err(ConfigError::Invalid(
                "max_instructions_per_function must be at least 1".into(),
            ));
        }
        if self.decoder.trim().is_empty() {
            return Err(ConfigError::Invalid("decoder name is required".into()));
        }
        Ok(())
    }

    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget_secs.map(Duration::from_secs)
    }
}

/// Rule, signature and config files share one convention: `.json` is JSON,
/// everything else is parsed as YAML.
pub fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}
