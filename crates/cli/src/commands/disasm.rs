use std::path::Path;

use anyhow::{Context, Result};
use binscope_core::model::CancellationToken;
use binscope_core::services::analysis::{AnalysisOrchestrator, AnalysisOutput};

use crate::{emit, GlobalOptions};

/// Run the pipeline up to call graph construction. Nothing is staged.
fn recover(opts: &GlobalOptions, input: &Path) -> Result<AnalysisOutput> {
    let mut config = opts.analysis_config()?;
    config.staging_dir = None;
    let orchestrator = AnalysisOrchestrator::new(config)
        .context("Failed to set up analysis")?
        .without_vuln_scan();
    orchestrator
        .analyze_path(input, &CancellationToken::new())
        .with_context(|| format!("Analysis of {} failed", input.display()))
}

/// Print recovered functions with their instructions.
///
/// `only` restricts output to functions whose name matches exactly.
pub fn disasm_command(
    opts: &GlobalOptions,
    input: &Path,
    only: Option<&str>,
    json: bool,
) -> Result<()> {
    let output = recover(opts, input)?;
    let functions: Vec<_> = output
        .units
        .iter()
        .flat_map(|u| u.functions.iter())
        .filter(|f| only.map(|name| f.name == name).unwrap_or(true))
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&functions)?);
        return Ok(());
    }

    if functions.is_empty() {
        println!("Functions: (none)");
        return Ok(());
    }
    for function in functions {
        println!(
            "{} {} [{:#x}..{:#x}) in {}",
            function.id, function.name, function.start, function.end, function.owner
        );
        for insn in &function.instructions {
            println!("  {:#010x}  {}", insn.address, insn.text());
        }
        println!();
    }
    Ok(())
}

/// Emit the call graph as Graphviz DOT or JSON.
pub fn graph_command(
    opts: &GlobalOptions,
    input: &Path,
    json: bool,
    out: Option<&Path>,
) -> Result<()> {
    let output = recover(opts, input)?;
    let graph = &output.report.call_graph;
    let body = if json {
        serde_json::to_string_pretty(graph).context("Failed to serialize call graph")?
    } else {
        graph.to_dot()
    };
    emit(&body, out)
}

#[derive(Debug, serde::Serialize)]
pub struct DecoderInfo {
    pub name: String,
    pub description: String,
}

/// List instruction decoders compiled into this binary.
pub fn list_decoders_command(json: bool) -> Result<()> {
    let registry = binscope_core::backends::default_decoder_registry();
    let entries: Vec<DecoderInfo> = registry
        .names()
        .into_iter()
        .map(|name| {
            let description = match name.as_str() {
                "capstone" => "Capstone disassembly engine (x86, ARM, MIPS, RISC-V, PowerPC)"
                    .to_string(),
                other => format!("Decoder '{other}'"),
            };
            DecoderInfo { name, description }
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
        return Ok(());
    }
    if entries.is_empty() {
        println!("Decoders: (none)");
        return Ok(());
    }
    println!("Decoders:");
    for entry in entries {
        println!("- {}: {}", entry.name, entry.description);
    }
    Ok(())
}
