//! Recursive container extraction.
//!
//! The extraction tree is an arena of `ExtractedEntry` nodes indexed by
//! `EntryId`; each node only knows its parent id. Children are always built
//! from bytes fully contained in (or decompressed from) their parent, so the
//! tree is acyclic by construction.

mod formats;
mod staging;

pub use staging::{stage_tree, StagingError};

use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::model::{
    Architecture, Artifact, CancellationToken, EntryId, Stage, Warning, WarningKind,
};
use crate::signatures::{ContainerFormat, ScanHit, SignatureScanner};
use formats::{Content, FormatIssue, ParseContext, Parsed};

/// What an extracted entry turned out to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Root,
    Archive,
    Compressed,
    Filesystem,
    Firmware,
    Executable,
    File,
    Opaque,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Root => "root",
            EntryKind::Archive => "archive",
            EntryKind::Compressed => "compressed",
            EntryKind::Filesystem => "filesystem",
            EntryKind::Firmware => "firmware",
            EntryKind::Executable => "executable",
            EntryKind::File => "file",
            EntryKind::Opaque => "opaque",
        }
    }
}

/// Where raw code in an entry is loaded, when a header says so.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadInfo {
    pub arch: Architecture,
    pub base: u64,
    pub entry: u64,
}

/// Shared view of an entry's content.
#[derive(Debug, Clone)]
pub struct EntryData {
    buf: Arc<[u8]>,
    range: Range<usize>,
}

impl Default for EntryData {
    fn default() -> Self {
        Self { buf: Arc::from(Vec::new()), range: 0..0 }
    }
}

impl EntryData {
    pub fn whole(buf: Arc<[u8]>) -> Self {
        let range = 0..buf.len();
        Self { buf, range }
    }

    fn owned(bytes: Vec<u8>) -> Self {
        Self::whole(Arc::from(bytes))
    }

    /// Sub-range relative to this view.
    fn slice(&self, range: Range<usize>) -> Self {
        let start = self.range.start + range.start;
        let end = (self.range.start + range.end).min(self.range.end);
        Self { buf: Arc::clone(&self.buf), range: start..end.max(start) }
    }

    fn from_content(&self, content: Content) -> Self {
        match content {
            Content::Range(range) => self.slice(range),
            Content::Owned(bytes) => Self::owned(bytes),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[self.range.clone()]
    }

    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// One node of the extraction tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractedEntry {
    pub id: EntryId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<EntryId>,
    /// Path relative to the extraction root, using binwalk-style
    /// `_<name>.extracted` directories for children.
    pub path: String,
    /// Last path component; filename rules match against this.
    pub name: String,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ContainerFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Offset of the source range inside the parent's content.
    pub source_offset: u64,
    /// Length of the source range inside the parent's content.
    pub source_length: u64,
    /// Length of this entry's own content (differs for decompressed streams).
    pub size: u64,
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load: Option<LoadInfo>,
    #[serde(skip)]
    data: EntryData,
}

impl ExtractedEntry {
    pub fn data(&self) -> &[u8] {
        self.data.as_bytes()
    }

    pub fn shared_data(&self) -> EntryData {
        self.data.clone()
    }

    /// Entries whose content can be handed to the disassembler.
    pub fn is_code(&self) -> bool {
        self.kind == EntryKind::Executable || self.load.is_some()
    }
}

/// Arena of extracted entries. Index 0 is always the root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionTree {
    entries: Vec<ExtractedEntry>,
}

impl ExtractionTree {
    /// A tree holding only the artifact itself.
    pub fn root_only(artifact: &Artifact) -> Self {
        let mut tree = Self::default();
        tree.push(root_pending(artifact), None, 0);
        tree
    }

    pub fn root(&self) -> &ExtractedEntry {
        &self.entries[0]
    }

    pub fn get(&self, id: EntryId) -> Option<&ExtractedEntry> {
        self.entries.get(id.0)
    }

    pub fn entries(&self) -> &[ExtractedEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn children(&self, id: EntryId) -> impl Iterator<Item = &ExtractedEntry> {
        self.entries.iter().filter(move |e| e.parent == Some(id))
    }

    /// Deepest level reached; 0 when nothing was extracted.
    pub fn max_depth(&self) -> u32 {
        self.entries.iter().map(|e| e.depth).max().unwrap_or(0)
    }

    /// Non-root entries the disassembler can work on.
    pub fn code_entries(&self) -> impl Iterator<Item = &ExtractedEntry> {
        self.entries.iter().skip(1).filter(|e| e.is_code())
    }

    fn push(&mut self, node: Pending, parent: Option<EntryId>, depth: u32) {
        let id = EntryId(self.entries.len());
        let path = match parent.and_then(|p| self.entries.get(p.0)) {
            Some(p) if p.parent.is_some() => child_path(&p.path, &node.name),
            _ => node.name.clone(),
        };
        let name = node.name.rsplit('/').next().unwrap_or(&node.name).to_string();
        self.entries.push(ExtractedEntry {
            id,
            parent,
            path,
            name,
            kind: node.kind,
            format: node.format,
            label: node.label,
            source_offset: node.source_offset as u64,
            source_length: node.source_length as u64,
            size: node.data.len() as u64,
            depth,
            load: node.load,
            data: node.data,
        });
        for child in node.children {
            self.push(child, Some(id), depth + 1);
        }
    }
}

/// `dir/name` becomes `dir/_name.extracted/child`.
fn child_path(parent_path: &str, child: &str) -> String {
    match parent_path.rsplit_once('/') {
        Some((dir, name)) => format!("{dir}/_{name}.extracted/{child}"),
        None => format!("_{parent_path}.extracted/{child}"),
    }
}

/// Output of an extraction stage.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    pub tree: ExtractionTree,
    pub warnings: Vec<Warning>,
}

/// Subtree built by a worker before it is merged into the arena.
#[derive(Debug)]
struct Pending {
    name: String,
    kind: EntryKind,
    format: Option<ContainerFormat>,
    label: Option<String>,
    source_offset: usize,
    source_length: usize,
    load: Option<LoadInfo>,
    data: EntryData,
    children: Vec<Pending>,
}

fn root_pending(artifact: &Artifact) -> Pending {
    Pending {
        name: artifact.file_name().to_string(),
        kind: EntryKind::Root,
        format: None,
        label: None,
        source_offset: 0,
        source_length: artifact.len(),
        load: None,
        data: EntryData::whole(artifact.shared()),
        children: Vec::new(),
    }
}

#[derive(Debug)]
struct Candidate {
    offset: usize,
    format: ContainerFormat,
    parsed: Parsed,
    /// Reported only if the candidate survives overlap resolution.
    warning: Option<Warning>,
}

impl Candidate {
    fn end(&self) -> usize {
        self.offset + self.parsed.span
    }
}

/// Keep non-overlapping candidates, preferring the earliest start, then the
/// longest span.
fn resolve_overlaps(mut candidates: Vec<Candidate>) -> Vec<Candidate> {
    candidates.sort_by(|a, b| a.offset.cmp(&b.offset).then(b.parsed.span.cmp(&a.parsed.span)));
    let mut accepted: Vec<Candidate> = Vec::with_capacity(candidates.len());
    let mut last_end = 0usize;
    for cand in candidates {
        if cand.parsed.span == 0 || (!accepted.is_empty() && cand.offset < last_end) {
            continue;
        }
        last_end = cand.end();
        accepted.push(cand);
    }
    accepted
}

/// Recursively extracts embedded containers into an `ExtractionTree`.
#[derive(Debug, Clone)]
pub struct ContainerExtractor {
    scanner: Arc<SignatureScanner>,
    max_depth: u32,
    max_entry_size: u64,
}

impl ContainerExtractor {
    pub fn new(scanner: Arc<SignatureScanner>, max_depth: u32, max_entry_size: u64) -> Self {
        Self { scanner, max_depth, max_entry_size }
    }

    /// Build the extraction tree for `artifact` from its top-level scan hits.
    ///
    /// Local failures never abort: malformed containers become opaque blobs
    /// and depth or size overruns truncate a branch, each with a warning.
    pub fn extract(
        &self,
        artifact: &Artifact,
        hits: &[ScanHit],
        cancel: &CancellationToken,
    ) -> Extraction {
        let mut root = root_pending(artifact);
        let mut warnings = Vec::new();
        let own_format = None;
        root.children =
            self.expand(&root.data, hits, &root.name, 0, own_format, cancel, &mut warnings);

        let mut tree = ExtractionTree::default();
        tree.push(root, None, 0);
        debug!(entries = tree.len(), depth = tree.max_depth(), "extraction tree built");
        Extraction { tree, warnings }
    }

    /// Parse every hit in `content`, keep the non-overlapping ones and
    /// materialize them (in parallel) as children at `depth + 1`.
    #[allow(clippy::too_many_arguments)]
    fn expand(
        &self,
        content: &EntryData,
        hits: &[ScanHit],
        location: &str,
        depth: u32,
        own_format: Option<ContainerFormat>,
        cancel: &CancellationToken,
        warnings: &mut Vec<Warning>,
    ) -> Vec<Pending> {
        let bytes = content.as_bytes();
        let mut candidates = Vec::new();
        for (idx, hit) in hits.iter().enumerate() {
            let offset = hit.offset as usize;
            if offset >= bytes.len() || (offset == 0 && own_format == Some(hit.format)) {
                continue;
            }
            let fallback_end = hits[idx + 1..]
                .iter()
                .map(|h| h.offset as usize)
                .find(|o| *o > offset)
                .unwrap_or(bytes.len())
                .min(bytes.len());
            let ctx = ParseContext {
                bytes,
                offset,
                fallback_end,
                max_entry_size: self.max_entry_size,
            };
            let (parsed, warning) = match formats::parse(hit.format, &ctx) {
                Ok(parsed) => (parsed, None),
                Err(FormatIssue::Malformed(reason)) => {
                    let warning = Warning::new(
                        Stage::Extracting,
                        WarningKind::Format,
                        format!("{} at {offset:#x}: {reason}; kept as opaque blob", hit.name),
                    );
                    (formats::opaque(&ctx), Some(warning.at(location)))
                }
                Err(FormatIssue::TooLarge(reason)) => {
                    let warning = Warning::new(
                        Stage::Extracting,
                        WarningKind::ResourceLimit,
                        format!("{} at {offset:#x}: {reason}", hit.name),
                    );
                    (formats::opaque(&ctx), Some(warning.at(location)))
                }
            };
            candidates.push(Candidate { offset, format: hit.format, parsed, warning });
        }

        let mut accepted = resolve_overlaps(candidates);
        if accepted.is_empty() {
            return Vec::new();
        }
        warnings.extend(accepted.iter_mut().filter_map(|c| c.warning.take()));
        if depth >= self.max_depth {
            warnings.push(
                Warning::new(
                    Stage::Extracting,
                    WarningKind::ResourceLimit,
                    format!(
                        "{} nested container(s) not extracted: depth limit {} reached",
                        accepted.len(),
                        self.max_depth
                    ),
                )
                .at(location),
            );
            return Vec::new();
        }

        let results: Vec<(Pending, Vec<Warning>)> = accepted
            .into_par_iter()
            .map(|cand| self.materialize(content, cand, location, depth + 1, cancel))
            .collect();
        let mut children = Vec::with_capacity(results.len());
        for (child, child_warnings) in results {
            warnings.extend(child_warnings);
            children.push(child);
        }
        children
    }

    fn materialize(
        &self,
        parent: &EntryData,
        cand: Candidate,
        parent_location: &str,
        depth: u32,
        cancel: &CancellationToken,
    ) -> (Pending, Vec<Warning>) {
        let mut warnings = Vec::new();
        let Candidate { offset, format, parsed, .. } = cand;
        let name = format!("{offset:X}.{}", format.extension());
        let location = format!("{parent_location}/{name}");
        for note in &parsed.notes {
            warnings.push(
                Warning::new(Stage::Extracting, WarningKind::Format, note.clone()).at(&location),
            );
        }
        let kind = parsed.kind;
        let own_format = parsed.content_is_container.then_some(format);
        let mut node = Pending {
            name,
            kind,
            format: (kind != EntryKind::Opaque).then_some(format),
            label: parsed.label,
            source_offset: offset,
            source_length: parsed.span,
            load: parsed.load,
            data: parent.from_content(parsed.content),
            children: Vec::new(),
        };
        if cancel.is_cancelled() {
            return (node, warnings);
        }

        if !parsed.members.is_empty() {
            node.children = self.materialize_members(
                &node.data,
                parent,
                parsed.members,
                &location,
                depth,
                cancel,
                &mut warnings,
            );
            return (node, warnings);
        }
        if kind == EntryKind::Archive {
            return (node, warnings);
        }

        let hits = self.scanner.scan(node.data.as_bytes());
        node.children =
            self.expand(&node.data, &hits, &location, depth, own_format, cancel, &mut warnings);
        (node, warnings)
    }

    /// Archive members become children of the archive node. Their content is
    /// scanned like any other entry.
    #[allow(clippy::too_many_arguments)]
    fn materialize_members(
        &self,
        archive: &EntryData,
        parent: &EntryData,
        members: Vec<formats::Member>,
        location: &str,
        depth: u32,
        cancel: &CancellationToken,
        warnings: &mut Vec<Warning>,
    ) -> Vec<Pending> {
        if depth >= self.max_depth {
            warnings.push(
                Warning::new(
                    Stage::Extracting,
                    WarningKind::ResourceLimit,
                    format!(
                        "{} archive member(s) not extracted: depth limit {} reached",
                        members.len(),
                        self.max_depth
                    ),
                )
                .at(location),
            );
            return Vec::new();
        }
        let archive_start = archive.range.start - parent.range.start;
        let results: Vec<(Pending, Vec<Warning>)> = members
            .into_par_iter()
            .map(|member| {
                let mut member_warnings = Vec::new();
                let data = parent.from_content(member.content);
                let is_elf = formats::is_elf(data.as_bytes());
                let kind = if is_elf { EntryKind::Executable } else { member.kind };
                let member_location = format!("{location}/{}", member.name);
                let mut node = Pending {
                    name: member.name,
                    kind,
                    format: is_elf.then_some(ContainerFormat::Elf),
                    label: None,
                    source_offset: member.offset.saturating_sub(archive_start),
                    source_length: member.length,
                    load: None,
                    data,
                    children: Vec::new(),
                };
                if !cancel.is_cancelled() && kind != EntryKind::Opaque {
                    let hits = self.scanner.scan(node.data.as_bytes());
                    node.children = self.expand(
                        &node.data,
                        &hits,
                        &member_location,
                        depth + 1,
                        node.format,
                        cancel,
                        &mut member_warnings,
                    );
                }
                (node, member_warnings)
            })
            .collect();
        let mut children = Vec::with_capacity(results.len());
        for (child, child_warnings) in results {
            warnings.extend(child_warnings);
            children.push(child);
        }
        children
    }
}
