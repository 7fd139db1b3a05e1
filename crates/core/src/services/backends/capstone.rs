use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::HashMap;

use capstone::arch::{
    arm::ArmOperandType, arm64::Arm64OperandType, mips::MipsOperand, ppc::PpcOperand,
    riscv::RiscVOperand, x86::X86OperandType, ArchOperand,
};
use capstone::{arch, prelude::*, Capstone, Endian, InsnDetail, InsnGroupId, InsnGroupType};

use crate::backends::{DecodeError, Flow, Instruction, InstructionDecoder, Target};
use crate::model::Architecture;

thread_local! {
    // Capstone handles are not `Send`; each worker keeps its own per architecture.
    static ENGINES: RefCell<HashMap<Architecture, Capstone>> = RefCell::new(HashMap::new());
}

/// Capstone-backed decoder for one architecture.
#[derive(Debug, Clone, Copy)]
pub struct CapstoneDecoder {
    arch: Architecture,
}

impl CapstoneDecoder {
    pub fn new(arch: Architecture) -> Result<Self, DecodeError> {
        // Fail early if the engine cannot be built for this architecture.
        with_engine(arch, |_| Ok(()))?;
        Ok(Self { arch })
    }

    pub fn engine_version() -> String {
        let (major, minor) = Capstone::lib_version();
        format!("{major}.{minor}")
    }
}

fn engine_error(e: capstone::Error) -> DecodeError {
    DecodeError::Engine(format!("capstone init failed: {e}"))
}

fn make_cs(arch: Architecture) -> Result<Capstone, DecodeError> {
    match arch {
        Architecture::X86_64 => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode64).detail(true).build()
        }
        Architecture::X86 => {
            Capstone::new().x86().mode(arch::x86::ArchMode::Mode32).detail(true).build()
        }
        Architecture::Arm => {
            Capstone::new().arm().mode(arch::arm::ArchMode::Arm).detail(true).build()
        }
        Architecture::Arm64 => {
            Capstone::new().arm64().mode(arch::arm64::ArchMode::Arm).detail(true).build()
        }
        Architecture::Mips32 => Capstone::new()
            .mips()
            .mode(arch::mips::ArchMode::Mips32)
            .endian(Endian::Big)
            .detail(true)
            .build(),
        Architecture::Mips32El => Capstone::new()
            .mips()
            .mode(arch::mips::ArchMode::Mips32)
            .endian(Endian::Little)
            .detail(true)
            .build(),
        Architecture::RiscV64 => {
            Capstone::new().riscv().mode(arch::riscv::ArchMode::RiscV64).detail(true).build()
        }
        Architecture::RiscV32 => {
            Capstone::new().riscv().mode(arch::riscv::ArchMode::RiscV32).detail(true).build()
        }
        Architecture::Ppc64 => Capstone::new()
            .ppc()
            .mode(arch::ppc::ArchMode::Mode64)
            .endian(Endian::Big)
            .detail(true)
            .build(),
    }
    .map_err(engine_error)
}

fn with_engine<T>(
    arch: Architecture,
    f: impl FnOnce(&Capstone) -> Result<T, DecodeError>,
) -> Result<T, DecodeError> {
    ENGINES.with(|cell| {
        let mut engines = cell.borrow_mut();
        let cs = match engines.entry(arch) {
            Entry::Occupied(slot) => slot.into_mut(),
            Entry::Vacant(slot) => slot.insert(make_cs(arch)?),
        };
        f(cs)
    })
}

fn has_group(detail: &InsnDetail, group: u8) -> bool {
    detail.groups().iter().any(|g| *g == InsnGroupId(group))
}

/// Immediate operands, as addresses.
fn immediates(arch: Architecture, operands: &[ArchOperand]) -> Vec<u64> {
    operands
        .iter()
        .filter_map(|op| match op {
            ArchOperand::X86Operand(x) => match x.op_type {
                X86OperandType::Imm(imm) => Some(imm as u64),
                _ => None,
            },
            ArchOperand::ArmOperand(a) => match a.op_type {
                ArmOperandType::Imm(imm) => Some(imm as u32 as u64),
                _ => None,
            },
            ArchOperand::Arm64Operand(a) => match a.op_type {
                Arm64OperandType::Imm(imm) => Some(imm as u64),
                _ => None,
            },
            ArchOperand::MipsOperand(MipsOperand::Imm(imm)) => Some(*imm as u64),
            ArchOperand::RiscVOperand(RiscVOperand::Imm(imm)) => Some(*imm as u64),
            ArchOperand::PpcOperand(PpcOperand::Imm(imm)) => Some(*imm as u64),
            _ => None,
        })
        .map(|addr| match arch {
            Architecture::X86
            | Architecture::Arm
            | Architecture::Mips32
            | Architecture::Mips32El => {
                addr & 0xffff_ffff
            }
            _ => addr,
        })
        .collect()
}

/// Fixed memory slot read by an x86 operand: RIP-relative or absolute.
fn x86_memory_slot(cs: &Capstone, operands: &[ArchOperand], next: u64) -> Option<u64> {
    operands.iter().find_map(|op| match op {
        ArchOperand::X86Operand(x) => match &x.op_type {
            X86OperandType::Mem(mem) => {
                let base = mem.base();
                if mem.index().0 != 0 {
                    None
                } else if base.0 == 0 {
                    Some(mem.disp() as u64)
                } else if cs.reg_name(base).as_deref() == Some("rip") {
                    Some(next.wrapping_add(mem.disp() as u64))
                } else {
                    None
                }
            }
            _ => None,
        },
        _ => None,
    })
}

/// Branch target of a transfer instruction.
fn branch_target(
    cs: &Capstone,
    arch: Architecture,
    operands: &[ArchOperand],
    address: u64,
    next: u64,
    op_str: &str,
) -> Target {
    if let Some(imm) = immediates(arch, operands).last().copied() {
        // RISC-V branch immediates are pc-relative.
        let target = match arch {
            Architecture::RiscV32 | Architecture::RiscV64 => address.wrapping_add(imm),
            _ => imm,
        };
        return Target::Direct(target);
    }
    if matches!(arch, Architecture::X86 | Architecture::X86_64) {
        if let Some(slot) = x86_memory_slot(cs, operands, next) {
            return Target::Memory(slot);
        }
    }
    Target::Indirect(op_str.to_string())
}

fn is_return(arch: Architecture, mnemonic: &str, op_str: &str) -> bool {
    match arch {
        Architecture::Arm => {
            (mnemonic == "bx" && op_str == "lr")
                || (mnemonic.starts_with("pop") && op_str.contains("pc"))
        }
        Architecture::Mips32 | Architecture::Mips32El => mnemonic == "jr" && op_str == "$ra",
        Architecture::RiscV32 | Architecture::RiscV64 => mnemonic == "ret",
        Architecture::Ppc64 => mnemonic == "blr",
        _ => false,
    }
}

fn is_trap(mnemonic: &str) -> bool {
    matches!(mnemonic, "hlt" | "ud2" | "int3" | "brk" | "udf" | "ebreak")
}

fn is_conditional(arch: Architecture, mnemonic: &str) -> bool {
    match arch {
        Architecture::X86 | Architecture::X86_64 => {
            (mnemonic.starts_with('j') && mnemonic != "jmp") || mnemonic.starts_with("loop")
        }
        _ => {
            let unconditional = matches!(
                mnemonic,
                "b" | "ba" | "bl" | "bla" | "blx" | "bx" | "br" | "bctr" | "blr" | "bal"
            );
            (mnemonic.starts_with('b') && !unconditional)
                || mnemonic.starts_with("cb")
                || mnemonic.starts_with("tb")
        }
    }
}

impl InstructionDecoder for CapstoneDecoder {
    fn name(&self) -> &str {
        "capstone"
    }

    fn architecture(&self) -> Architecture {
        self.arch
    }

    fn decode_one(
        &self,
        bytes: &[u8],
        offset: usize,
        address: u64,
    ) -> Result<Instruction, DecodeError> {
        let code = bytes.get(offset..).filter(|c| !c.is_empty());
        let Some(code) = code else {
            return Err(DecodeError::Truncated { address });
        };
        let arch = self.arch;
        with_engine(arch, |cs| {
            let insns = cs
                .disasm_count(code, address, 1)
                .map_err(|_| DecodeError::Invalid { address })?;
            let insn = insns.iter().next().ok_or(DecodeError::Invalid { address })?;
            let size = insn.bytes().len() as u32;
            let next = address + size as u64;
            let mnemonic = insn.mnemonic().unwrap_or("").to_lowercase();
            let operands = insn.op_str().unwrap_or("").to_string();
            let detail = cs.insn_detail(insn).map_err(|e| DecodeError::Engine(e.to_string()))?;
            let ops = detail.arch_detail().operands();

            let mut code_refs = Vec::new();
            let flow = if is_trap(&mnemonic) {
                Flow::Trap
            } else if has_group(&detail, InsnGroupType::CS_GRP_RET as u8)
                || is_return(arch, &mnemonic, &operands)
            {
                Flow::Return
            } else if has_group(&detail, InsnGroupType::CS_GRP_CALL as u8) {
                Flow::Call(branch_target(cs, arch, &ops, address, next, &operands))
            } else if has_group(&detail, InsnGroupType::CS_GRP_JUMP as u8) {
                let target = branch_target(cs, arch, &ops, address, next, &operands);
                if is_conditional(arch, &mnemonic) {
                    Flow::ConditionalJump(target)
                } else {
                    Flow::Jump(target)
                }
            } else {
                code_refs = immediates(arch, &ops);
                if mnemonic == "lea" {
                    code_refs.extend(x86_memory_slot(cs, &ops, next));
                }
                Flow::Sequential
            };
            let delay_slots = match (arch, &flow) {
                (Architecture::Mips32 | Architecture::Mips32El, Flow::Sequential | Flow::Trap) => 0,
                (Architecture::Mips32 | Architecture::Mips32El, _) => 1,
                _ => 0,
            };
            Ok(Instruction { address, size, mnemonic, operands, flow, code_refs, delay_slots })
        })
    }

    fn looks_like_prologue(&self, bytes: &[u8]) -> bool {
        match self.arch {
            Architecture::X86_64 => {
                bytes.starts_with(&[0x55, 0x48, 0x89, 0xe5])
                    || bytes.starts_with(&[0xf3, 0x0f, 0x1e, 0xfa])
            }
            Architecture::X86 => {
                bytes.starts_with(&[0x55, 0x89, 0xe5]) || bytes.starts_with(&[0x55, 0x8b, 0xec])
            }
            // stp x29, x30, [sp, #-N]!
            Architecture::Arm64 => {
                bytes.len() >= 4 && bytes[0] == 0xfd && bytes[1] == 0x7b && bytes[3] == 0xa9
            }
            // push {..., lr}
            Architecture::Arm => {
                bytes.len() >= 4 && bytes[1] & 0x40 != 0 && bytes[2] == 0x2d && bytes[3] == 0xe9
            }
            // addiu sp, sp, -N
            Architecture::Mips32 => bytes.starts_with(&[0x27, 0xbd, 0xff]),
            Architecture::Mips32El => bytes.len() >= 4 && bytes[1..4] == [0xff, 0xbd, 0x27],
            _ => false,
        }
    }
}
