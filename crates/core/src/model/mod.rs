//! Core data model shared by every stage: the artifact under analysis,
//! architectures, severities and the ids that tie stage outputs together.

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Immutable bytes under analysis plus a logical identifier.
///
/// The bytes are shared (`Arc`) so workers and extracted entries can borrow
/// ranges of the same buffer without copying.
#[derive(Debug, Clone)]
pub struct Artifact {
    id: String,
    bytes: Arc<[u8]>,
}

impl Artifact {
    /// Wrap an in-memory buffer under the given identifier.
    pub fn from_bytes(id: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        let bytes: Vec<u8> = bytes.into();
        Self { id: id.into(), bytes: Arc::from(bytes) }
    }

    /// Read an artifact from disk. The path becomes its identifier.
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        Ok(Self::from_bytes(path.display().to_string(), bytes))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn shared(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// SHA-256 of the artifact bytes as lowercase hex.
    pub fn sha256(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.bytes);
        format!("{:x}", hasher.finalize())
    }

    /// Final path component of the identifier, used to name the extraction root.
    pub fn file_name(&self) -> &str {
        Path::new(&self.id).file_name().and_then(|s| s.to_str()).unwrap_or("artifact")
    }
}

/// Instruction set architectures the analysis understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Architecture {
    #[serde(rename = "x86")]
    X86,
    #[serde(rename = "x86_64")]
    X86_64,
    #[serde(rename = "arm")]
    Arm,
    #[serde(rename = "arm64")]
    Arm64,
    #[serde(rename = "mips32")]
    Mips32,
    #[serde(rename = "mips32el")]
    Mips32El,
    #[serde(rename = "riscv32")]
    RiscV32,
    #[serde(rename = "riscv64")]
    RiscV64,
    #[serde(rename = "ppc64")]
    Ppc64,
}

impl Architecture {
    pub const ALL: [Architecture; 9] = [
        Architecture::X86,
        Architecture::X86_64,
        Architecture::Arm,
        Architecture::Arm64,
        Architecture::Mips32,
        Architecture::Mips32El,
        Architecture::RiscV32,
        Architecture::RiscV64,
        Architecture::Ppc64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Architecture::X86 => "x86",
            Architecture::X86_64 => "x86_64",
            Architecture::Arm => "arm",
            Architecture::Arm64 => "arm64",
            Architecture::Mips32 => "mips32",
            Architecture::Mips32El => "mips32el",
            Architecture::RiscV32 => "riscv32",
            Architecture::RiscV64 => "riscv64",
            Architecture::Ppc64 => "ppc64",
        }
    }

    /// Minimum instruction alignment, used by the function sweep.
    pub fn code_alignment(&self) -> u64 {
        match self {
            Architecture::X86 | Architecture::X86_64 => 16,
            Architecture::RiscV32 | Architecture::RiscV64 => 2,
            _ => 4,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Architecture {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Architecture::X86_64),
            "x86" | "i386" | "i686" => Ok(Architecture::X86),
            "arm" | "armv7" | "armel" => Ok(Architecture::Arm),
            "arm64" | "aarch64" => Ok(Architecture::Arm64),
            "mips" | "mips32" | "mipsbe" => Ok(Architecture::Mips32),
            "mipsel" | "mips32el" | "mipsle" => Ok(Architecture::Mips32El),
            "riscv32" => Ok(Architecture::RiscV32),
            "riscv" | "riscv64" => Ok(Architecture::RiscV64),
            "ppc" | "powerpc" | "ppc64" => Ok(Architecture::Ppc64),
            other => Err(format!(
                "Unknown architecture '{other}'. Allowed: {}",
                Architecture::ALL.iter().map(|a| a.as_str()).collect::<Vec<_>>().join(", ")
            )),
        }
    }
}

/// How serious a finding is. Ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// Identifier of a recovered function, unique within one analysis run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FunctionId(pub u32);

impl fmt::Display for FunctionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Index of an entry in the extraction arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryId(pub usize);

/// Pipeline stages, in the order a run passes through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Idle,
    Scanning,
    Extracting,
    Disassembling,
    GraphBuilding,
    VulnScanning,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Idle => "idle",
            Stage::Scanning => "scanning",
            Stage::Extracting => "extracting",
            Stage::Disassembling => "disassembling",
            Stage::GraphBuilding => "graph_building",
            Stage::VulnScanning => "vuln_scanning",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classes of stage-local problems. None of them abort a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarningKind {
    /// Malformed container or signature metadata; content kept as an opaque blob.
    Format,
    /// An instruction could not be decoded; the function was truncated there.
    Decode,
    /// A depth, size, instruction or time budget cut a stage short.
    ResourceLimit,
    /// The run was cancelled; later work was skipped.
    Cancelled,
}

/// A non-fatal problem recorded in the final report.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Warning {
    pub stage: Stage,
    pub kind: WarningKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    pub message: String,
}

impl Warning {
    pub fn new(stage: Stage, kind: WarningKind, message: impl Into<String>) -> Self {
        Self { stage, kind, location: None, message: message.into() }
    }

    pub fn at(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) => write!(f, "[{}] {}: {}", self.stage, loc, self.message),
            None => write!(f, "[{}] {}", self.stage, self.message),
        }
    }
}

/// Why a run stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    TimeBudget,
}

/// Cooperative cancellation shared between the caller and every worker.
///
/// Cancellation is polled between stages and between independent units of
/// work; nothing is interrupted mid-unit.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<std::sync::atomic::AtomicBool>,
    deadline: Option<std::time::Instant>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token sharing this one's flag that also trips at `deadline`.
    pub fn with_deadline(&self, deadline: std::time::Instant) -> Self {
        Self { flag: Arc::clone(&self.flag), deadline: Some(deadline) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn reason(&self) -> Option<CancelReason> {
        if self.flag.load(std::sync::atomic::Ordering::SeqCst) {
            return Some(CancelReason::Requested);
        }
        match self.deadline {
            Some(deadline) if std::time::Instant::now() >= deadline => {
                Some(CancelReason::TimeBudget)
            }
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.reason().is_some()
    }
}
