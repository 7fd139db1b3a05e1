//! Instruction decoding capability.
//!
//! Function recovery only needs to decode one instruction at a time and learn
//! how control leaves it. Decoders plug in through `InstructionDecoder` and are
//! selected by name from a `DecoderRegistry`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::Architecture;

/// Name of the decoder used when the configuration does not pick one.
pub const DEFAULT_DECODER: &str = "capstone";

/// Where a branch, call or code reference goes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Target {
    /// Immediate destination address.
    Direct(u64),
    /// Destination loaded from a fixed memory slot (e.g. an import table entry).
    Memory(u64),
    /// Register or computed destination, kept as its textual expression.
    Indirect(String),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Direct(addr) => write!(f, "{addr:#x}"),
            Target::Memory(slot) => write!(f, "[{slot:#x}]"),
            Target::Indirect(expr) => f.write_str(expr),
        }
    }
}

/// How control flow leaves an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Flow {
    Sequential,
    Return,
    Jump(Target),
    ConditionalJump(Target),
    Call(Target),
    /// Traps and halts: execution does not fall through.
    Trap,
}

impl Flow {
    /// True when the next sequential instruction is never reached from here.
    pub fn ends_path(&self) -> bool {
        matches!(self, Flow::Return | Flow::Jump(_) | Flow::Trap)
    }
}

/// One decoded instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instruction {
    pub address: u64,
    pub size: u32,
    pub mnemonic: String,
    pub operands: String,
    pub flow: Flow,
    /// Code addresses referenced by operands other than the flow target
    /// (address-taken functions, jump tables).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_refs: Vec<u64>,
    /// Instructions after this one that execute before the transfer.
    #[serde(default)]
    pub delay_slots: u8,
}

impl Instruction {
    pub fn end(&self) -> u64 {
        self.address.saturating_add(u64::from(self.size))
    }

    pub fn text(&self) -> String {
        if self.operands.is_empty() {
            self.mnemonic.clone()
        } else {
            format!("{} {}", self.mnemonic, self.operands)
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("invalid instruction at {address:#x}")]
    Invalid { address: u64 },
    #[error("truncated instruction at {address:#x}")]
    Truncated { address: u64 },
    #[error("decoder {decoder} does not support {arch}")]
    UnsupportedArch { decoder: String, arch: Architecture },
    #[error("decoder not found: {0}")]
    UnknownDecoder(String),
    #[error("decoder engine error: {0}")]
    Engine(String),
}

/// A single-architecture instruction decoder.
pub trait InstructionDecoder: Send + Sync {
    fn name(&self) -> &str;

    fn architecture(&self) -> Architecture;

    /// Decode the instruction at `bytes[offset..]`, which is loaded at
    /// `address`.
    fn decode_one(&self, bytes: &[u8], offset: usize, address: u64)
        -> Result<Instruction, DecodeError>;

    /// Minimum alignment of instruction starts, in bytes.
    fn alignment(&self) -> u64 {
        self.architecture().code_alignment()
    }

    /// Whether `bytes` begins with a typical function prologue.
    fn looks_like_prologue(&self, _bytes: &[u8]) -> bool {
        false
    }
}

type DecoderFactory =
    Box<dyn Fn(Architecture) -> Result<Arc<dyn InstructionDecoder>, DecodeError> + Send + Sync>;

/// Registry of decoder factories; callers select by name and architecture.
#[derive(Default)]
pub struct DecoderRegistry {
    factories: HashMap<String, DecoderFactory>,
}

impl fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecoderRegistry").field("decoders", &self.names()).finish()
    }
}

impl DecoderRegistry {
    pub fn new() -> Self {
        Self { factories: HashMap::new() }
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn(Architecture) -> Result<Arc<dyn InstructionDecoder>, DecodeError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.into(), Box::new(factory));
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Instantiate decoder `name` for `arch`.
    pub fn create(
        &self,
        name: &str,
        arch: Architecture,
    ) -> Result<Arc<dyn InstructionDecoder>, DecodeError> {
        let factory =
            self.factories.get(name).ok_or_else(|| DecodeError::UnknownDecoder(name.to_string()))?;
        factory(arch)
    }

    /// Return a sorted list of registered decoder names for error messages/help.
    pub fn names(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.factories.keys().cloned().collect();
        keys.sort();
        keys
    }
}

/// Registry populated with the decoders compiled into this build.
pub fn default_decoder_registry() -> DecoderRegistry {
    #[allow(unused_mut)]
    let mut registry = DecoderRegistry::new();
    #[cfg(feature = "capstone-backend")]
    {
        registry.register(DEFAULT_DECODER, |arch| {
            crate::services::backends::CapstoneDecoder::new(arch)
                .map(|d| Arc::new(d) as Arc<dyn InstructionDecoder>)
        });
    }
    registry
}
