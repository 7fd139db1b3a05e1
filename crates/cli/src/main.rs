use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use binscope::commands::{
    analyze_command, check_rules_command, disasm_command, extract_command, graph_command,
    list_decoders_command, scan_command, signatures_command,
};
use binscope::{init_tracing, GlobalOptions};
use binscope_core::services::analysis::Outcome;
use clap::{Parser, Subcommand};

/// Static analysis of executables and firmware images.
///
/// Every subcommand drives `binscope_core`; this binary only parses flags,
/// prints results and maps outcomes to exit codes.
#[derive(Parser, Debug)]
#[command(
    name = "binscope",
    version = binscope_core::version(),
    about = "Static analysis of executables and firmware images",
    long_about = None
)]
struct Cli {
    #[command(flatten)]
    global: GlobalOptions,

    /// Increase log verbosity (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the whole pipeline and report functions, call graph and findings.
    ///
    /// Exit status is 0 on success, 2 when the run completed with warnings
    /// (partial failure) and 1 on a fatal error.
    Analyze {
        /// Executable or firmware image to analyze.
        input: PathBuf,

        /// Emit the report as JSON instead of human-readable text.
        #[arg(long, default_value_t = false)]
        json: bool,

        /// Write the JSON report to this file.
        #[arg(long)]
        out: Option<PathBuf>,

        /// Also write extracted entries below this directory.
        #[arg(long)]
        staging_dir: Option<PathBuf>,
    },

    /// List signature hits without extracting anything.
    Scan {
        input: PathBuf,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Recursively unpack embedded containers.
    Extract {
        input: PathBuf,

        /// Directory to write extracted entries into.
        #[arg(long)]
        out: Option<PathBuf>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Print recovered functions with their instructions.
    Disasm {
        input: PathBuf,

        /// Only print the function with this name.
        #[arg(long)]
        function: Option<String>,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Emit the call graph (Graphviz DOT by default).
    Graph {
        input: PathBuf,

        #[arg(long, default_value_t = false)]
        json: bool,

        /// Write the graph to this file instead of stdout.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Validate a vulnerability rule file.
    CheckRules {
        path: PathBuf,

        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List the active signature set.
    Signatures {
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// List available instruction decoders.
    Decoders {
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    let opts = &cli.global;
    let code = match cli.command {
        Command::Analyze { input, json, out, staging_dir } => {
            match analyze_command(opts, &input, json, out.as_deref(), staging_dir)? {
                Outcome::Success => ExitCode::SUCCESS,
                Outcome::PartialFailure => ExitCode::from(2),
            }
        }
        Command::Scan { input, json } => {
            scan_command(opts, &input, json)?;
            ExitCode::SUCCESS
        }
        Command::Extract { input, out, json } => {
            if extract_command(opts, &input, out.as_deref(), json)? {
                ExitCode::SUCCESS
            } else {
                ExitCode::from(2)
            }
        }
        Command::Disasm { input, function, json } => {
            disasm_command(opts, &input, function.as_deref(), json)?;
            ExitCode::SUCCESS
        }
        Command::Graph { input, json, out } => {
            graph_command(opts, &input, json, out.as_deref())?;
            ExitCode::SUCCESS
        }
        Command::CheckRules { path, json } => {
            check_rules_command(&path, json)?;
            ExitCode::SUCCESS
        }
        Command::Signatures { json } => {
            signatures_command(opts, json)?;
            ExitCode::SUCCESS
        }
        Command::Decoders { json } => {
            list_decoders_command(json)?;
            ExitCode::SUCCESS
        }
    };
    Ok(code)
}
