use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;
use tracing::debug;

use super::{external_name, normalize_symbol, ExitKind, Function, FunctionSource};
use crate::backends::{Flow, Instruction, InstructionDecoder, Target};
use crate::config::AnalysisConfig;
use crate::image::{CodeSection, LoadedImage};
use crate::model::{CancellationToken, FunctionId, Stage, Warning, WarningKind};

/// Output of function recovery over one image.
#[derive(Debug, Clone, Default)]
pub struct Recovery {
    pub functions: Vec<Function>,
    pub warnings: Vec<Warning>,
}

/// Function under construction.
#[derive(Debug, Clone)]
struct Draft {
    start: u64,
    instructions: BTreeMap<u64, Instruction>,
    exit: ExitKind,
    source: FunctionSource,
    calls: Vec<u64>,
    refs: Vec<u64>,
    warnings: Vec<Warning>,
}

impl Draft {
    fn end(&self) -> u64 {
        self.instructions.values().map(Instruction::end).max().unwrap_or(self.start)
    }

    /// Drop everything at or past `limit`.
    fn truncate(&mut self, limit: u64) {
        self.instructions.retain(|_, insn| insn.end() <= limit);
    }
}

/// Per-trace state shared by all paths of one function.
struct Trace<'a> {
    image: &'a LoadedImage,
    bytes: &'a [u8],
    section: &'a CodeSection,
    bounds: Range<u64>,
    known: &'a BTreeSet<u64>,
    owner: &'a str,
}

/// Recovers function boundaries with a pluggable instruction decoder.
pub struct FunctionRecoverer {
    decoder: Arc<dyn InstructionDecoder>,
    no_return: HashSet<String>,
    max_instructions: usize,
}

impl FunctionRecoverer {
    pub fn new(decoder: Arc<dyn InstructionDecoder>, config: &AnalysisConfig) -> Self {
        let no_return =
            config.no_return.iter().map(|n| normalize_symbol(n).to_string()).collect();
        Self { decoder, no_return, max_instructions: config.max_instructions_per_function }
    }

    pub fn decoder(&self) -> &dyn InstructionDecoder {
        self.decoder.as_ref()
    }

    /// Recover every function in `image`. Ids start at `first_id` and follow
    /// ascending start address.
    pub fn recover(
        &self,
        image: &LoadedImage,
        owner: &str,
        first_id: u32,
        cancel: &CancellationToken,
    ) -> Recovery {
        let mut drafts = Vec::new();
        let mut warnings = Vec::new();
        for section in &image.sections {
            if cancel.is_cancelled() {
                break;
            }
            drafts.extend(self.recover_section(image, section, owner, cancel));
        }
        for draft in &mut drafts {
            warnings.append(&mut draft.warnings);
        }
        drafts.retain(|d| !d.instructions.is_empty());
        drafts.sort_by_key(|d| d.start);

        let functions: Vec<Function> = drafts
            .into_iter()
            .enumerate()
            .map(|(idx, draft)| {
                let end = draft.end();
                let name = image
                    .symbols
                    .function_at(draft.start)
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("sub_{:x}", draft.start));
                Function {
                    id: FunctionId(first_id + idx as u32),
                    owner: owner.to_string(),
                    name,
                    start: draft.start,
                    end,
                    instructions: draft.instructions.into_values().collect(),
                    exit: draft.exit,
                    source: draft.source,
                }
            })
            .collect();
        debug!(owner, functions = functions.len(), "functions recovered");
        Recovery { functions, warnings }
    }

    fn recover_section(
        &self,
        image: &LoadedImage,
        section: &CodeSection,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Vec<Draft> {
        let bytes = image.section_bytes(section);
        let bounds = section.address..section.end();

        // Recursive descent in rounds.
        let mut found: BTreeMap<u64, Draft> = BTreeMap::new();
        let mut queue: BTreeSet<u64> = image
            .entry_points
            .iter()
            .copied()
            .filter(|a| section.contains(*a) && image.stub_name(*a).is_none())
            .collect();
        while !queue.is_empty() {
            if cancel.is_cancelled() {
                break;
            }
            let known: BTreeSet<u64> = found.keys().chain(queue.iter()).copied().collect();
            let round: Vec<Draft> = queue
                .par_iter()
                .map(|start| {
                    let trace = Trace {
                        image,
                        bytes,
                        section,
                        bounds: bounds.clone(),
                        known: &known,
                        owner,
                    };
                    self.trace(&trace, *start, FunctionSource::EntryPoint)
                })
                .collect();
            let mut next = BTreeSet::new();
            for draft in round {
                for target in &draft.calls {
                    if section.contains(*target) && !known.contains(target) {
                        next.insert(*target);
                    }
                }
                found.insert(draft.start, draft);
            }
            queue = next;
        }

        // Earlier entry-point functions stop where the next one starts.
        let starts: Vec<u64> = found.keys().copied().collect();
        for pair in starts.windows(2) {
            if let Some(draft) = found.get_mut(&pair[0]) {
                if draft.end() > pair[1] {
                    draft.truncate(pair[1]);
                }
            }
        }

        let sweep = self.sweep(image, section, bytes, &found, owner, cancel);
        let mut drafts: Vec<Draft> = found.into_values().collect();
        drafts.extend(sweep);
        drafts
    }

    /// Turn address-taken or prologue-like offsets in unclaimed gaps into
    /// functions, each confined to its gap.
    fn sweep(
        &self,
        image: &LoadedImage,
        section: &CodeSection,
        bytes: &[u8],
        found: &BTreeMap<u64, Draft>,
        owner: &str,
        cancel: &CancellationToken,
    ) -> Vec<Draft> {
        let align = self.decoder.alignment().max(1);
        let mut claimed: BTreeMap<u64, u64> = found
            .values()
            .map(|d| (d.start, d.end().max(d.start.saturating_add(1))))
            .collect();
        let is_claimed = |claimed: &BTreeMap<u64, u64>, addr: u64| {
            claimed.range(..=addr).next_back().is_some_and(|(_, end)| addr < *end)
        };

        let mut candidates: BTreeSet<u64> = found
            .values()
            .flat_map(|d| d.refs.iter().copied())
            .filter(|a| section.contains(*a) && a % align == 0)
            .collect();
        let mut next = section.address.div_ceil(align).checked_mul(align);
        while let Some(addr) = next.filter(|a| *a < section.end()) {
            let offset = (addr - section.address) as usize;
            if !is_claimed(&claimed, addr) && self.decoder.looks_like_prologue(&bytes[offset..]) {
                candidates.insert(addr);
            }
            next = addr.checked_add(align);
        }

        let mut swept = Vec::new();
        for start in candidates {
            if cancel.is_cancelled() {
                break;
            }
            if is_claimed(&claimed, start) || image.stub_name(start).is_some() {
                continue;
            }
            let gap_end = claimed
                .range(start..)
                .next()
                .map(|(s, _)| *s)
                .unwrap_or(section.end());
            let known: BTreeSet<u64> = claimed.keys().copied().collect();
            let trace = Trace {
                image,
                bytes,
                section,
                bounds: start..gap_end,
                known: &known,
                owner,
            };
            let draft = self.trace(&trace, start, FunctionSource::Sweep);
            if draft.instructions.is_empty() {
                continue;
            }
            claimed.insert(draft.start, draft.end());
            swept.push(draft);
        }
        swept
    }

    fn callee_is_no_return(&self, image: &LoadedImage, insn: &Instruction) -> bool {
        let name = external_name(image, insn).or_else(|| match &insn.flow {
            Flow::Call(Target::Direct(t)) => image.symbols.function_at(*t),
            _ => None,
        });
        name.is_some_and(|n| self.no_return.contains(normalize_symbol(n)))
    }

    /// Follow every path from `start` within `trace.bounds`.
    fn trace(&self, trace: &Trace<'_>, start: u64, source: FunctionSource) -> Draft {
        let mut draft = Draft {
            start,
            instructions: BTreeMap::new(),
            exit: ExitKind::Return,
            source,
            calls: Vec::new(),
            refs: Vec::new(),
            warnings: Vec::new(),
        };
        let (mut returned, mut tail_called, mut indeterminate) = (false, false, false);
        let mut pending = vec![start];

        'paths: while let Some(mut addr) = pending.pop() {
            loop {
                if draft.instructions.contains_key(&addr)
                    || !trace.bounds.contains(&addr)
                    || (addr != start && trace.known.contains(&addr))
                {
                    continue 'paths;
                }
                if draft.instructions.len() >= self.max_instructions {
                    draft.warnings.push(
                        Warning::new(
                            Stage::Disassembling,
                            WarningKind::ResourceLimit,
                            format!(
                                "instruction limit {} reached in function at {start:#x}",
                                self.max_instructions
                            ),
                        )
                        .at(trace.owner),
                    );
                    indeterminate = true;
                    break 'paths;
                }
                let Some((insn, after)) = self.decode_with_slots(trace, addr, &mut draft) else {
                    indeterminate = true;
                    continue 'paths;
                };
                draft.refs.extend(insn.code_refs.iter().copied());
                match &insn.flow {
                    Flow::Sequential => addr = after,
                    Flow::Return => {
                        returned = true;
                        continue 'paths;
                    }
                    Flow::Trap => continue 'paths,
                    Flow::Call(target) => {
                        let external = external_name(trace.image, &insn).is_some();
                        if let (Target::Direct(t), false) = (target, external) {
                            draft.calls.push(*t);
                        }
                        if self.callee_is_no_return(trace.image, &insn) {
                            continue 'paths;
                        }
                        addr = after;
                    }
                    Flow::ConditionalJump(target) => {
                        if let Target::Direct(t) = target {
                            if self.is_local_target(trace, start, *t) {
                                pending.push(*t);
                            }
                        }
                        addr = after;
                    }
                    Flow::Jump(Target::Direct(t)) => {
                        if self.is_local_target(trace, start, *t)
                            && external_name(trace.image, &insn).is_none()
                        {
                            pending.push(*t);
                        } else {
                            tail_called = true;
                        }
                        continue 'paths;
                    }
                    Flow::Jump(Target::Memory(_))
                        if external_name(trace.image, &insn).is_some() =>
                    {
                        tail_called = true;
                        continue 'paths;
                    }
                    Flow::Jump(_) => {
                        indeterminate = true;
                        continue 'paths;
                    }
                }
            }
        }

        draft.exit = if indeterminate {
            ExitKind::Indeterminate
        } else if tail_called && !returned {
            ExitKind::TailCall
        } else {
            ExitKind::Return
        };
        draft
    }

    /// Jump targets followed inside the current function.
    fn is_local_target(&self, trace: &Trace<'_>, start: u64, target: u64) -> bool {
        target >= start
            && trace.bounds.contains(&target)
            && (target == start || !trace.known.contains(&target))
    }

    /// Decode the instruction at `addr` plus its delay slots. Returns the
    /// transfer instruction and the address after the last slot.
    fn decode_with_slots(
        &self,
        trace: &Trace<'_>,
        addr: u64,
        draft: &mut Draft,
    ) -> Option<(Instruction, u64)> {
        let insn = self.decode_at(trace, addr, draft)?;
        let mut after = insn.end();
        draft.instructions.insert(addr, insn.clone());
        for _ in 0..insn.delay_slots {
            if !trace.bounds.contains(&after) {
                break;
            }
            let Some(slot) = self.decode_at(trace, after, draft) else { break };
            after = slot.end();
            draft.refs.extend(slot.code_refs.iter().copied());
            draft.instructions.insert(slot.address, slot);
        }
        Some((insn, after))
    }

    fn decode_at(&self, trace: &Trace<'_>, addr: u64, draft: &mut Draft) -> Option<Instruction> {
        let offset = (addr - trace.section.address) as usize;
        match self.decoder.decode_one(trace.bytes, offset, addr) {
            Ok(insn) if insn.size > 0 && insn.end() <= trace.bounds.end => Some(insn),
            // Straddles the next claimed function; the path ends quietly.
            Ok(insn) if insn.size > 0 && insn.end() <= trace.section.end() => None,
            Ok(_) => {
                draft.warnings.push(
                    Warning::new(
                        Stage::Disassembling,
                        WarningKind::Decode,
                        format!("instruction at {addr:#x} runs past the end of its section"),
                    )
                    .at(trace.owner),
                );
                None
            }
            Err(e) => {
                draft.warnings.push(
                    Warning::new(Stage::Disassembling, WarningKind::Decode, e.to_string())
                        .at(trace.owner),
                );
                None
            }
        }
    }
}
