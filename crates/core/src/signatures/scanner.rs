use std::path::{Path, PathBuf};

use aho_corasick::{AhoCorasick, MatchKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{ContainerFormat, SignatureError, SignatureSet};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
}

/// One signature match. `offset` is where the announced container starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanHit {
    pub name: String,
    pub format: ContainerFormat,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
struct CompiledSignature {
    name: String,
    format: ContainerFormat,
    magic_offset: usize,
}

/// Single-pass multi-pattern scanner over a signature set.
#[derive(Debug, Clone)]
pub struct SignatureScanner {
    automaton: AhoCorasick,
    signatures: Vec<CompiledSignature>,
}

impl SignatureScanner {
    pub fn new(set: &SignatureSet) -> Result<Self, SignatureError> {
        let mut patterns = Vec::with_capacity(set.len());
        let mut signatures = Vec::with_capacity(set.len());
        for sig in &set.signatures {
            patterns.push(sig.validate()?);
            signatures.push(CompiledSignature {
                name: sig.name.clone(),
                format: sig.format,
                magic_offset: sig.magic_offset as usize,
            });
        }
        // Overlapping search requires standard match semantics.
        let automaton = AhoCorasick::builder().match_kind(MatchKind::Standard).build(&patterns)?;
        Ok(Self { automaton, signatures })
    }

    pub fn builtin() -> Result<Self, SignatureError> {
        Self::new(&SignatureSet::builtin())
    }

    /// Every match in `bytes`, ordered by offset, then length, then name.
    ///
    /// Overlapping matches are all reported; deciding between them is the
    /// extractor's job.
    pub fn scan(&self, bytes: &[u8]) -> Vec<ScanHit> {
        let mut hits: Vec<ScanHit> = self
            .automaton
            .find_overlapping_iter(bytes)
            .filter_map(|m| {
                let sig = &self.signatures[m.pattern().as_usize()];
                let start = m.start().checked_sub(sig.magic_offset)?;
                Some(ScanHit {
                    name: sig.name.clone(),
                    format: sig.format,
                    offset: start as u64,
                    length: (m.end() - m.start()) as u64,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            a.offset.cmp(&b.offset).then(a.length.cmp(&b.length)).then(a.name.cmp(&b.name))
        });
        hits
    }

    /// Read `path` and scan it. Fails only when the file cannot be read.
    pub fn scan_path(&self, path: impl AsRef<Path>) -> Result<Vec<ScanHit>, ScanError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)
            .map_err(|source| ScanError::Io { path: path.to_path_buf(), source })?;
        Ok(self.scan(&bytes))
    }

    pub fn signature_count(&self) -> usize {
        self.signatures.len()
    }
}
