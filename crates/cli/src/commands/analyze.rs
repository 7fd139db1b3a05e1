use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use binscope_core::model::CancellationToken;
use binscope_core::services::analysis::{
    AnalysisOrchestrator, AnalysisPath, AnalysisReport, Outcome,
};

use crate::{emit, GlobalOptions};

/// Run the full pipeline on `input` and print (or write) the report.
pub fn analyze_command(
    opts: &GlobalOptions,
    input: &Path,
    json: bool,
    out: Option<&Path>,
    staging: Option<PathBuf>,
) -> Result<Outcome> {
    let mut config = opts.analysis_config()?;
    if staging.is_some() {
        config.staging_dir = staging;
    }
    let orchestrator = AnalysisOrchestrator::new(config).context("Failed to set up analysis")?;
    let output = orchestrator
        .analyze_path(input, &CancellationToken::new())
        .with_context(|| format!("Analysis of {} failed", input.display()))?;
    let report = output.report;

    // A file target always gets the machine-readable form.
    if json || out.is_some() {
        let body =
            serde_json::to_string_pretty(&report).context("Failed to serialize report to JSON")?;
        emit(&body, out)?;
        if let Some(path) = out {
            println!("Report written to {}", path.display());
        }
    } else {
        print_report(&report);
    }
    Ok(report.outcome)
}

pub fn print_report(report: &AnalysisReport) {
    println!("Artifact: {}", report.artifact.id);
    println!("  Size: {} bytes", report.artifact.size);
    println!("  SHA-256: {}", report.artifact.sha256);
    println!(
        "  Path: {}",
        match report.path {
            AnalysisPath::Binary => "binary",
            AnalysisPath::Firmware => "firmware",
        }
    );
    match report.architecture {
        Some(arch) => println!("  Architecture: {arch}"),
        None => println!("  Architecture: (unknown)"),
    }
    println!("Entries: {}", report.entries.len());
    println!("Functions: {}", report.functions.len());
    let unresolved = report.call_graph.unresolved().count();
    println!("Call edges: {} ({} unresolved)", report.call_graph.edges.len(), unresolved);

    println!("Findings ({}):", report.findings.len());
    if report.findings.is_empty() {
        println!("  (none)");
    }
    for finding in &report.findings {
        println!(
            "  - [{}] {} at {}: {}",
            finding.severity.as_str(),
            finding.category,
            finding.location,
            finding.evidence
        );
    }

    if !report.warnings.is_empty() {
        println!("Warnings ({}):", report.warnings.len());
        for warning in &report.warnings {
            match &warning.location {
                Some(location) => println!(
                    "  - [{}] {location}: {}",
                    warning.stage.as_str(),
                    warning.message
                ),
                None => println!("  - [{}] {}", warning.stage.as_str(), warning.message),
            }
        }
    }

    println!(
        "Outcome: {} ({} ms)",
        match report.outcome {
            Outcome::Success => "success",
            Outcome::PartialFailure => "partial failure",
        },
        report.duration_ms
    );
}
