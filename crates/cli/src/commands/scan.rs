use std::path::Path;

use anyhow::{Context, Result};
use binscope_core::signatures::{SignatureScanner, SignatureSet};
use serde::Serialize;

use crate::GlobalOptions;

fn load_signatures(opts: &GlobalOptions) -> Result<SignatureSet> {
    let config = opts.analysis_config()?;
    match &config.signatures {
        Some(path) => SignatureSet::load(path)
            .with_context(|| format!("Failed to load signatures {}", path.display())),
        None => Ok(SignatureSet::builtin()),
    }
}

/// Report every signature hit in `input` without extracting anything.
pub fn scan_command(opts: &GlobalOptions, input: &Path, json: bool) -> Result<()> {
    let scanner = SignatureScanner::new(&load_signatures(opts)?)?;
    let hits = scanner
        .scan_path(input)
        .with_context(|| format!("Failed to scan {}", input.display()))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
        return Ok(());
    }

    println!("Signature hits ({}):", hits.len());
    if hits.is_empty() {
        println!("  (none)");
    }
    for hit in hits {
        println!(
            "  - {:#010x} {} ({}) len={}",
            hit.offset,
            hit.name,
            hit.format.as_str(),
            hit.length
        );
    }
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct SignatureInfo {
    pub name: String,
    pub format: String,
    pub description: String,
}

/// List the active signature set.
pub fn signatures_command(opts: &GlobalOptions, json: bool) -> Result<()> {
    let set = load_signatures(opts)?;
    set.validate()?;
    let mut entries: Vec<SignatureInfo> = set
        .signatures
        .iter()
        .map(|s| SignatureInfo {
            name: s.name.clone(),
            format: s.format.as_str().to_string(),
            description: s.description.clone().unwrap_or_default(),
        })
        .collect();
    entries.sort_by(|a, b| a.name.cmp(&b.name));

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }

    println!("Signatures ({}):", entries.len());
    for entry in entries {
        println!("- {} [{}]: {}", entry.name, entry.format, entry.description);
    }
    Ok(())
}
