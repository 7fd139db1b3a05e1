//! Signature definitions and the multi-pattern scanner.
//!
//! A signature is a magic byte sequence tagged with the container format it
//! announces. Sets are static for a run: either the built-in set or a file
//! loaded once at startup.

mod scanner;

pub use scanner::{ScanError, ScanHit, SignatureScanner};

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::is_json;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Failed to read signature set at {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("Failed to parse signature set: {0}")]
    Parse(String),
    #[error("Invalid signature '{name}': {reason}")]
    Invalid { name: String, reason: String },
    #[error("Failed to build signature automaton: {0}")]
    Automaton(#[from] aho_corasick::BuildError),
}

/// Container formats the extractor knows about.
///
/// Tags without a dedicated parser fall back to `Opaque` handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerFormat {
    Tar,
    Gzip,
    Zip,
    Cpio,
    Squashfs,
    Uimage,
    Elf,
    Xz,
    Bzip2,
    Lzma,
    Jffs2,
    #[serde(other)]
    Opaque,
}

impl ContainerFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerFormat::Tar => "tar",
            ContainerFormat::Gzip => "gzip",
            ContainerFormat::Zip => "zip",
            ContainerFormat::Cpio => "cpio",
            ContainerFormat::Squashfs => "squashfs",
            ContainerFormat::Uimage => "uimage",
            ContainerFormat::Elf => "elf",
            ContainerFormat::Xz => "xz",
            ContainerFormat::Bzip2 => "bzip2",
            ContainerFormat::Lzma => "lzma",
            ContainerFormat::Jffs2 => "jffs2",
            ContainerFormat::Opaque => "opaque",
        }
    }

    /// File extension used when naming extracted entries.
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerFormat::Gzip => "gz",
            ContainerFormat::Bzip2 => "bz2",
            ContainerFormat::Squashfs => "squashfs",
            ContainerFormat::Uimage => "uimage",
            ContainerFormat::Opaque => "bin",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Magic bytes, written either as hex or as an ASCII literal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Magic {
    Hex(String),
    Ascii(String),
}

impl Magic {
    pub fn to_bytes(&self) -> Result<Vec<u8>, String> {
        match self {
            Magic::Hex(h) => {
                let cleaned: String = h.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(&cleaned).map_err(|e| format!("bad hex magic '{h}': {e}"))
            }
            Magic::Ascii(a) => Ok(a.as_bytes().to_vec()),
        }
    }
}

/// A named pattern announcing a container format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub name: String,
    pub format: ContainerFormat,
    pub magic: Magic,
    /// Distance from the start of the container to the magic.
    #[serde(default)]
    pub magic_offset: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Signature {
    fn new(name: &str, format: ContainerFormat, magic: Magic, description: &str) -> Self {
        Self {
            name: name.to_string(),
            format,
            magic,
            magic_offset: 0,
            description: Some(description.to_string()),
        }
    }

    fn at_offset(mut self, magic_offset: u64) -> Self {
        self.magic_offset = magic_offset;
        self
    }

    pub fn validate(&self) -> Result<Vec<u8>, SignatureError> {
        let invalid =
            |reason: String| SignatureError::Invalid { name: self.name.clone(), reason };
        if self.name.trim().is_empty() {
            return Err(invalid("name is required".into()));
        }
        let bytes = self.magic.to_bytes().map_err(invalid)?;
        if bytes.is_empty() {
            return Err(invalid("magic must not be empty".into()));
        }
        Ok(bytes)
    }
}

/// An ordered collection of signatures.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureSet {
    pub signatures: Vec<Signature>,
}

impl SignatureSet {
    /// The signatures shipped with the library.
    pub fn builtin() -> Self {
        use ContainerFormat::*;
        let hex = |s: &str| Magic::Hex(s.to_string());
        let ascii = |s: &str| Magic::Ascii(s.to_string());
        Self {
            signatures: vec![
                Signature::new("tar-ustar", Tar, ascii("ustar"), "POSIX tar archive")
                    .at_offset(257),
                Signature::new("gzip", Gzip, hex("1f8b08"), "gzip compressed data (deflate)"),
                Signature::new("zip", Zip, hex("504b0304"), "Zip archive local file header"),
                Signature::new("cpio-newc", Cpio, ascii("070701"), "ASCII cpio archive (newc)"),
                Signature::new("cpio-crc", Cpio, ascii("070702"), "ASCII cpio archive (crc)"),
                Signature::new("squashfs-le", Squashfs, ascii("hsqs"), "SquashFS, little endian"),
                Signature::new("squashfs-be", Squashfs, ascii("sqsh"), "SquashFS, big endian"),
                Signature::new("uimage", Uimage, hex("27051956"), "U-Boot legacy image header"),
                Signature::new("elf", Elf, hex("7f454c46"), "ELF executable or object"),
                Signature::new("xz", Xz, hex("fd377a585a00"), "xz compressed data"),
                Signature::new("bzip2", Bzip2, hex("425a6839314159265359"), "bzip2 compressed"),
                Signature::new("lzma", Lzma, hex("5d00008000"), "LZMA compressed data"),
                Signature::new("jffs2-le", Jffs2, hex("851901e0"), "JFFS2, little endian"),
                Signature::new("jffs2-be", Jffs2, hex("1985e001"), "JFFS2, big endian"),
                Signature::new("pem", Opaque, ascii("-----BEGIN "), "PEM key or certificate"),
            ],
        }
    }

    /// Load a signature set file (JSON by extension, YAML otherwise) and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SignatureError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|source| SignatureError::Read { path: path.to_path_buf(), source })?;
        let set: SignatureSet = if is_json(path) {
            serde_json::from_slice(&bytes).map_err(|e| SignatureError::Parse(e.to_string()))?
        } else {
            serde_yaml::from_slice(&bytes).map_err(|e| SignatureError::Parse(e.to_string()))?
        };
        set.validate()?;
        Ok(set)
    }

    pub fn validate(&self) -> Result<(), SignatureError> {
        for sig in &self.signatures {
            sig.validate()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
