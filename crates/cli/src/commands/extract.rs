use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use binscope_core::extract::{stage_tree, ContainerExtractor, ExtractionTree};
use binscope_core::model::{Artifact, CancellationToken};
use binscope_core::signatures::{SignatureScanner, SignatureSet};

use crate::GlobalOptions;

/// Unpack `input` recursively and print the extraction tree.
///
/// Returns `true` when extraction hit no warnings.
pub fn extract_command(
    opts: &GlobalOptions,
    input: &Path,
    out: Option<&Path>,
    json: bool,
) -> Result<bool> {
    let config = opts.analysis_config()?;
    let set = match &config.signatures {
        Some(path) => SignatureSet::load(path)?,
        None => SignatureSet::builtin(),
    };
    let scanner = Arc::new(SignatureScanner::new(&set)?);
    let artifact = Artifact::from_path(input)
        .with_context(|| format!("Failed to read {}", input.display()))?;

    let hits = scanner.scan(artifact.bytes());
    let extractor = ContainerExtractor::new(scanner, config.max_depth, config.max_entry_size);
    let extraction = extractor.extract(&artifact, &hits, &CancellationToken::new());
    for warning in &extraction.warnings {
        tracing::warn!(location = ?warning.location, "{}", warning.message);
    }

    if let Some(dir) = out {
        let written = stage_tree(&extraction.tree, dir)
            .with_context(|| format!("Failed to stage entries under {}", dir.display()))?;
        eprintln!("Wrote {written} entries under {}", dir.display());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(extraction.tree.entries())?);
    } else {
        print_tree(&extraction.tree);
    }
    Ok(extraction.warnings.is_empty())
}

pub fn print_tree(tree: &ExtractionTree) {
    println!("Entries ({}):", tree.len());
    for entry in tree.entries() {
        let indent = "  ".repeat(entry.depth as usize + 1);
        let format = entry.format.map(|f| format!(" {f}")).unwrap_or_default();
        let label = entry.label.as_deref().map(|l| format!(" \"{l}\"")).unwrap_or_default();
        println!(
            "{indent}- {} [{}{format}] {} bytes @ {:#x}{label}",
            entry.path,
            entry.kind.as_str(),
            entry.size,
            entry.source_offset
        );
    }
}
