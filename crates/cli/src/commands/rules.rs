use std::path::Path;

use anyhow::{Context, Result};
use binscope_core::vuln::RuleSet;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct RuleSummary {
    pub path: String,
    pub rules: usize,
}

/// Parse and compile a rule file without running anything.
pub fn check_rules_command(path: &Path, json: bool) -> Result<()> {
    let rules = RuleSet::load(path)
        .with_context(|| format!("Rule file {} is invalid", path.display()))?;
    let summary = RuleSummary { path: path.display().to_string(), rules: rules.len() };

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!("Rules OK: {} ({} rules)", summary.path, summary.rules);
    }
    Ok(())
}
