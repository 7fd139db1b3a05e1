//! Function recovery and call-graph construction.

pub mod callgraph;
pub mod recover;

pub use callgraph::{CallEdge, CallGraph, CallGraphBuilder, Callee, EdgeKind, GraphNode};
pub use recover::FunctionRecoverer;

use serde::{Deserialize, Serialize};

use crate::backends::{Flow, Instruction, Target};
use crate::image::LoadedImage;
use crate::model::FunctionId;

/// How a recovered function's paths end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitKind {
    Return,
    TailCall,
    Indeterminate,
}

/// Which recovery phase found a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FunctionSource {
    EntryPoint,
    Sweep,
}

/// A recovered function. `end` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Function {
    pub id: FunctionId,
    /// Path of the entry (or the artifact id) the code came from.
    pub owner: String,
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub instructions: Vec<Instruction>,
    pub exit: ExitKind,
    pub source: FunctionSource,
}

impl Function {
    pub fn contains(&self, address: u64) -> bool {
        address >= self.start && address < self.end
    }

    pub fn summary(&self) -> FunctionSummary {
        FunctionSummary {
            id: self.id,
            owner: self.owner.clone(),
            name: self.name.clone(),
            start: self.start,
            end: self.end,
            exit: self.exit,
            source: self.source,
            instruction_count: self.instructions.len(),
        }
    }
}

/// Report view of a function, without its instructions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionSummary {
    pub id: FunctionId,
    pub owner: String,
    pub name: String,
    pub start: u64,
    pub end: u64,
    pub exit: ExitKind,
    pub source: FunctionSource,
    pub instruction_count: usize,
}

/// One disassembled code image and the functions recovered from it.
#[derive(Debug, Clone)]
pub struct CodeUnit {
    pub owner: String,
    pub image: LoadedImage,
    pub functions: Vec<Function>,
}

/// Strip decoration that does not change which routine is meant:
/// leading underscores, `@plt` and `@VERSION` suffixes.
pub fn normalize_symbol(name: &str) -> &str {
    let name = name.split('@').next().unwrap_or(name);
    let trimmed = name.trim_start_matches('_');
    if trimmed.is_empty() {
        name
    } else {
        trimmed
    }
}

/// External name for the destination of a call or jump at `insn`: a
/// relocation patched inside the instruction, an import slot, or a stub.
pub(crate) fn external_name<'a>(image: &'a LoadedImage, insn: &Instruction) -> Option<&'a str> {
    if let Some(name) = image.symbols.relocation_in(insn.address..insn.end()) {
        return Some(name);
    }
    let target = match &insn.flow {
        Flow::Call(t) | Flow::Jump(t) | Flow::ConditionalJump(t) => t,
        _ => return None,
    };
    match target {
        Target::Direct(addr) => image.stub_name(*addr),
        Target::Memory(slot) => image.symbols.import_at(*slot),
        Target::Indirect(_) => None,
    }
}
