use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use binscope_core::config::AnalysisConfig;
use binscope_core::model::Architecture;
use tracing_subscriber::EnvFilter;

pub mod commands;

/// Options shared by every subcommand that runs part of the pipeline.
///
/// Flags given on the command line win over values from `--config`.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct GlobalOptions {
    /// Architecture hint (e.g., x86_64, arm, mipsel). Wins over header detection.
    #[arg(long, global = true)]
    pub arch: Option<String>,

    /// Config file (YAML, or JSON by `.json` extension).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Signature set file replacing the built-in signatures.
    #[arg(long, global = true)]
    pub signatures: Option<PathBuf>,

    /// Rule file replacing the built-in vulnerability rules.
    #[arg(long, global = true)]
    pub rules: Option<PathBuf>,

    /// Maximum container nesting depth.
    #[arg(long, global = true)]
    pub max_depth: Option<u32>,

    /// Worker threads (0 = one per core).
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    /// Wall-clock budget for the run, in seconds.
    #[arg(long, global = true)]
    pub time_budget_secs: Option<u64>,

    /// Load address for raw code blobs (hex with 0x prefix, or decimal).
    #[arg(long, global = true, value_parser = parse_address)]
    pub base_address: Option<u64>,

    /// Instruction decoder backend.
    #[arg(long, global = true)]
    pub decoder: Option<String>,
}

impl GlobalOptions {
    /// Resolve the effective analysis config: file first, then flag overrides.
    pub fn analysis_config(&self) -> Result<AnalysisConfig> {
        let mut config = match &self.config {
            Some(path) => AnalysisConfig::load(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?,
            None => AnalysisConfig::default(),
        };
        if let Some(arch) = &self.arch {
            config.arch = Some(parse_arch(arch)?);
        }
        if let Some(path) = &self.signatures {
            config.signatures = Some(path.clone());
        }
        if let Some(path) = &self.rules {
            config.rules = Some(path.clone());
        }
        if let Some(depth) = self.max_depth {
            config.max_depth = depth;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if let Some(secs) = self.time_budget_secs {
            config.time_budget_secs = Some(secs);
        }
        if let Some(base) = self.base_address {
            config.base_address = base;
        }
        if let Some(decoder) = &self.decoder {
            config.decoder = decoder.clone();
        }
        config.validate().context("Invalid analysis config")?;
        Ok(config)
    }
}

pub fn parse_arch(value: &str) -> Result<Architecture> {
    value.parse::<Architecture>().map_err(anyhow::Error::msg)
}

pub fn parse_address(value: &str) -> Result<u64, String> {
    let parsed = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => value.parse::<u64>(),
    };
    parsed.map_err(|e| format!("Invalid address '{value}': {e}"))
}

/// Install the stderr log subscriber. `RUST_LOG` wins over `-v` counts.
pub fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

/// Write `body` to `out`, or to stdout when no path is given.
pub fn emit(body: &str, out: Option<&Path>) -> Result<()> {
    match out {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::write(path, body).with_context(|| format!("Failed to write {}", path.display()))
        }
        None => {
            println!("{body}");
            Ok(())
        }
    }
}
