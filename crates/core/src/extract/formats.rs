//! Per-format container parsers.
//!
//! Each parser looks at the container starting at `offset` inside its parent's
//! content and reports the span it covers, the bytes to descend into, and any
//! archive members. Ranges are relative to the parent content.

use std::io::{Cursor, Read};
use std::ops::Range;

use goblin::elf::Elf;

use super::{EntryKind, LoadInfo};
use crate::model::Architecture;
use crate::signatures::ContainerFormat;

const TAR_BLOCK: usize = 512;
const UIMAGE_HEADER_LEN: usize = 64;
const CPIO_HEADER_LEN: usize = 110;
const CPIO_TRAILER: &[u8] = b"TRAILER!!!";
const ZIP_EOCD_MAGIC: &[u8] = b"PK\x05\x06";
const ZIP_EOCD_LEN: usize = 22;

/// Bytes an entry descends into.
#[derive(Debug)]
pub(crate) enum Content {
    /// A range of the parent content.
    Range(Range<usize>),
    /// Materialized bytes (decompressed streams).
    Owned(Vec<u8>),
}

#[derive(Debug)]
pub(crate) struct Member {
    pub name: String,
    pub offset: usize,
    pub length: usize,
    pub kind: EntryKind,
    pub content: Content,
}

#[derive(Debug)]
pub(crate) struct Parsed {
    pub kind: EntryKind,
    /// Length of the container in the parent, starting at the hit offset.
    pub span: usize,
    pub content: Content,
    /// True when `content` is the raw container range, so rescanning it would
    /// find the container's own magic at offset 0.
    pub content_is_container: bool,
    pub members: Vec<Member>,
    pub label: Option<String>,
    pub load: Option<LoadInfo>,
    /// Member-level problems that degraded to opaque content.
    pub notes: Vec<String>,
}

impl Parsed {
    fn new(kind: EntryKind, span: usize, content: Content) -> Self {
        Self {
            kind,
            span,
            content,
            content_is_container: false,
            members: Vec::new(),
            label: None,
            load: None,
            notes: Vec::new(),
        }
    }

    fn raw(kind: EntryKind, offset: usize, span: usize) -> Self {
        let mut parsed = Self::new(kind, span, Content::Range(offset..offset + span));
        parsed.content_is_container = true;
        parsed
    }
}

#[derive(Debug)]
pub(crate) enum FormatIssue {
    /// Header or structure could not be parsed.
    Malformed(String),
    /// Decompressed output exceeded the configured size cap.
    TooLarge(String),
}

pub(crate) struct ParseContext<'a> {
    pub bytes: &'a [u8],
    pub offset: usize,
    /// Conservative end when the format carries no usable length.
    pub fallback_end: usize,
    pub max_entry_size: u64,
}

impl ParseContext<'_> {
    fn fallback(&self, kind: EntryKind) -> Parsed {
        Parsed::raw(kind, self.offset, self.fallback_end.saturating_sub(self.offset))
    }

    fn remaining(&self) -> &[u8] {
        &self.bytes[self.offset..]
    }
}

pub(crate) fn parse(
    format: ContainerFormat,
    ctx: &ParseContext<'_>,
) -> Result<Parsed, FormatIssue> {
    match format {
        ContainerFormat::Tar => parse_tar(ctx),
        ContainerFormat::Gzip => parse_gzip(ctx),
        ContainerFormat::Zip => parse_zip(ctx),
        ContainerFormat::Cpio => parse_cpio(ctx),
        ContainerFormat::Squashfs => parse_squashfs(ctx),
        ContainerFormat::Uimage => parse_uimage(ctx),
        ContainerFormat::Elf => parse_elf(ctx),
        ContainerFormat::Xz | ContainerFormat::Bzip2 | ContainerFormat::Lzma => {
            Ok(ctx.fallback(EntryKind::Compressed))
        }
        ContainerFormat::Jffs2 => Ok(ctx.fallback(EntryKind::Filesystem)),
        ContainerFormat::Opaque => Ok(ctx.fallback(EntryKind::Opaque)),
    }
}

/// Opaque-blob classification used when a parser rejects its input.
pub(crate) fn opaque(ctx: &ParseContext<'_>) -> Parsed {
    ctx.fallback(EntryKind::Opaque)
}

fn read_u16_le(b: &[u8], at: usize) -> Option<u16> {
    b.get(at..at + 2).map(|s| u16::from_le_bytes([s[0], s[1]]))
}

fn read_u32_le(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4).map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
}

fn read_u32_be(b: &[u8], at: usize) -> Option<u32> {
    b.get(at..at + 4).map(|s| u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

fn read_u64(b: &[u8], at: usize, big_endian: bool) -> Option<u64> {
    let s: [u8; 8] = b.get(at..at + 8)?.try_into().ok()?;
    Some(if big_endian { u64::from_be_bytes(s) } else { u64::from_le_bytes(s) })
}

fn align_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Strip absolute prefixes and parent references from an archive member name.
pub(crate) fn sanitize_member_name(raw: &str) -> Option<String> {
    let parts: Vec<&str> = raw
        .split(['/', '\\'])
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

/// Inflate at most `limit` bytes from `reader`.
fn read_limited(reader: impl Read, limit: u64) -> Result<Vec<u8>, FormatIssue> {
    let mut out = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| FormatIssue::Malformed(format!("decompression failed: {e}")))?;
    if out.len() as u64 > limit {
        return Err(FormatIssue::TooLarge(format!(
            "decompressed size exceeds the {limit} byte entry limit"
        )));
    }
    Ok(out)
}

fn parse_tar(ctx: &ParseContext<'_>) -> Result<Parsed, FormatIssue> {
    let data = ctx.remaining();
    if data.len() < TAR_BLOCK {
        return Err(FormatIssue::Malformed("tar header truncated".into()));
    }
    let malformed = |e: std::io::Error| FormatIssue::Malformed(format!("tar: {e}"));
    let mut archive = tar::Archive::new(data);
    let mut members = Vec::new();
    let mut end = 0usize;
    for entry in archive.entries().map_err(malformed)? {
        let entry = entry.map_err(malformed)?;
        let position = entry.raw_file_position() as usize;
        let size = entry.size() as usize;
        let data_end = position
            .checked_add(size)
            .filter(|e| *e <= data.len())
            .ok_or_else(|| FormatIssue::Malformed("tar member runs past end of data".into()))?;
        end = end.max(position + align_up(size, TAR_BLOCK)).min(data.len());
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw_name = entry.path().map_err(malformed)?.to_string_lossy().into_owned();
        let Some(name) = sanitize_member_name(&raw_name) else { continue };
        members.push(Member {
            name,
            offset: ctx.offset + position,
            length: size,
            kind: EntryKind::File,
            content: Content::Range(ctx.offset + position..ctx.offset + data_end),
        });
    }
    if end == 0 {
        return Err(FormatIssue::Malformed("tar archive has no entries".into()));
    }
    // Two zero blocks mark the end of the archive.
    for _ in 0..2 {
        match data.get(end..end + TAR_BLOCK) {
            Some(block) if block.iter().all(|b| *b == 0) => end += TAR_BLOCK,
            _ => break,
        }
    }
    let mut parsed = Parsed::raw(EntryKind::Archive, ctx.offset, end);
    parsed.members = members;
    Ok(parsed)
}

fn parse_gzip(ctx: &ParseContext<'_>) -> Result<Parsed, FormatIssue> {
    let data = ctx.remaining();
    let mut decoder = flate2::bufread::GzDecoder::new(data);
    let payload = read_limited(&mut decoder, ctx.max_entry_size)?;
    let label = decoder
        .header()
        .and_then(|h| h.filename())
        .map(|name| String::from_utf8_lossy(name).into_owned());
    let consumed = data.len() - decoder.get_ref().len();
    if consumed == 0 {
        return Err(FormatIssue::Malformed("empty gzip stream".into()));
    }
    let mut parsed = Parsed::new(EntryKind::Compressed, consumed, Content::Owned(payload));
    parsed.label = label;
    Ok(parsed)
}

/// End of the first end-of-central-directory record whose central directory
/// sits directly before it, measured from `start`.
fn zip_archive_end(bytes: &[u8], start: usize) -> Option<usize> {
    let data = &bytes[start..];
    data.windows(ZIP_EOCD_MAGIC.len())
        .enumerate()
        .filter(|(_, w)| *w == ZIP_EOCD_MAGIC)
        .find_map(|(eocd, _)| {
            let cd_size = read_u32_le(data, eocd + 12)? as usize;
            let cd_offset = read_u32_le(data, eocd + 16)? as usize;
            let comment_len = read_u16_le(data, eocd + 20)? as usize;
            let end = eocd + ZIP_EOCD_LEN + comment_len;
            (cd_offset.checked_add(cd_size) == Some(eocd) && end <= data.len()).then_some(end)
        })
}

fn parse_zip(ctx: &ParseContext<'_>) -> Result<Parsed, FormatIssue> {
    let span = zip_archive_end(ctx.bytes, ctx.offset)
        .ok_or_else(|| FormatIssue::Malformed("zip end of central directory not found".into()))?;
    let data = &ctx.bytes[ctx.offset..ctx.offset + span];
    let malformed = |e: zip::result::ZipError| FormatIssue::Malformed(format!("zip: {e}"));
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).map_err(malformed)?;

    let mut members = Vec::new();
    let mut notes = Vec::new();
    for index in 0..archive.len() {
        let (raw_name, is_dir, method, start, length) = {
            let file = archive.by_index_raw(index).map_err(malformed)?;
            (
                file.name().to_string(),
                file.is_dir(),
                file.compression(),
                file.data_start() as usize,
                file.compressed_size() as usize,
            )
        };
        let Some(name) = sanitize_member_name(&raw_name).filter(|_| !is_dir) else { continue };
        let archive_end = ctx.offset + span;
        let member_start = (ctx.offset + start).min(archive_end);
        let range = member_start..member_start.saturating_add(length).min(archive_end);
        let inflated = match method {
            zip::CompressionMethod::Stored => None,
            zip::CompressionMethod::Deflated => Some(
                archive
                    .by_index(index)
                    .map_err(malformed)
                    .and_then(|file| read_limited(file, ctx.max_entry_size)),
            ),
            other => Some(Err(FormatIssue::Malformed(format!(
                "unsupported compression method {other:?}"
            )))),
        };
        let (kind, content) = match inflated {
            None => (EntryKind::File, Content::Range(range.clone())),
            Some(Ok(out)) => (EntryKind::File, Content::Owned(out)),
            Some(Err(FormatIssue::Malformed(e) | FormatIssue::TooLarge(e))) => {
                notes.push(format!("zip member {name}: {e}"));
                (EntryKind::Opaque, Content::Range(range.clone()))
            }
        };
        members.push(Member { name, offset: range.start, length: range.len(), kind, content });
    }
    let mut parsed = Parsed::raw(EntryKind::Archive, ctx.offset, span);
    parsed.members = members;
    parsed.notes = notes;
    Ok(parsed)
}

fn cpio_field(header: &[u8], index: usize) -> Result<usize, FormatIssue> {
    let start = 6 + index * 8;
    let text = std::str::from_utf8(&header[start..start + 8])
        .map_err(|_| FormatIssue::Malformed("cpio header field is not ASCII".into()))?;
    usize::from_str_radix(text, 16)
        .map_err(|_| FormatIssue::Malformed(format!("cpio header field '{text}' is not hex")))
}

fn parse_cpio(ctx: &ParseContext<'_>) -> Result<Parsed, FormatIssue> {
    let bytes = ctx.bytes;
    let base = ctx.offset;
    let mut pos = base;
    let mut members = Vec::new();
    loop {
        let header = bytes
            .get(pos..pos + CPIO_HEADER_LEN)
            .ok_or_else(|| FormatIssue::Malformed(format!("cpio header at {pos:#x} truncated")))?;
        if &header[..5] != b"07070" {
            return Err(FormatIssue::Malformed(format!("bad cpio magic at {pos:#x}")));
        }
        let mode = cpio_field(header, 1)?;
        let file_size = cpio_field(header, 6)?;
        let name_size = cpio_field(header, 11)?;
        let name_start = pos + CPIO_HEADER_LEN;
        let name_end = name_start + name_size;
        let data_start = base + align_up(name_end - base, 4);
        let data_end = data_start + file_size;
        if name_size == 0 || data_end > bytes.len() {
            return Err(FormatIssue::Malformed(format!("cpio entry at {pos:#x} truncated")));
        }
        let raw_name = &bytes[name_start..name_end - 1];
        let next = base + align_up(data_end - base, 4);
        if raw_name == CPIO_TRAILER {
            let end = next.min(bytes.len());
            let mut parsed = Parsed::raw(EntryKind::Archive, base, end - base);
            parsed.members = members;
            return Ok(parsed);
        }
        let is_regular = mode & 0o170000 == 0o100000;
        if let Some(name) =
            sanitize_member_name(&String::from_utf8_lossy(raw_name)).filter(|_| is_regular)
        {
            members.push(Member {
                name,
                offset: data_start,
                length: file_size,
                kind: EntryKind::File,
                content: Content::Range(data_start..data_end),
            });
        }
        pos = next;
    }
}

fn squashfs_compression(id: u16) -> &'static str {
    match id {
        1 => "gzip",
        2 => "lzma",
        3 => "lzo",
        4 => "xz",
        5 => "lz4",
        6 => "zstd",
        _ => "unknown",
    }
}

fn parse_squashfs(ctx: &ParseContext<'_>) -> Result<Parsed, FormatIssue> {
    let data = ctx.remaining();
    let big_endian = data.starts_with(b"sqsh");
    let read_u16 = |at: usize| {
        data.get(at..at + 2).map(|s| {
            if big_endian {
                u16::from_be_bytes([s[0], s[1]])
            } else {
                u16::from_le_bytes([s[0], s[1]])
            }
        })
    };
    let major = read_u16(28)
        .ok_or_else(|| FormatIssue::Malformed("squashfs superblock truncated".into()))?;
    if !(2..=4).contains(&major) {
        return Err(FormatIssue::Malformed(format!("unsupported squashfs version {major}")));
    }
    let bytes_used = read_u64(data, 40, big_endian)
        .ok_or_else(|| FormatIssue::Malformed("squashfs superblock truncated".into()))?
        as usize;
    if bytes_used < 96 || bytes_used > data.len() {
        return Err(FormatIssue::Malformed(format!(
            "squashfs bytes_used {bytes_used:#x} outside available data"
        )));
    }
    let compression = squashfs_compression(read_u16(20).unwrap_or(0));
    let mut parsed = Parsed::raw(EntryKind::Filesystem, ctx.offset, bytes_used);
    parsed.label = Some(format!("squashfs v{major}, {compression} compressed"));
    Ok(parsed)
}

/// Map a U-Boot `ih_arch` code to an architecture.
pub(crate) fn uimage_arch(code: u8) -> Option<Architecture> {
    match code {
        2 => Some(Architecture::Arm),
        3 => Some(Architecture::X86),
        5 => Some(Architecture::Mips32),
        22 => Some(Architecture::Arm64),
        24 => Some(Architecture::X86_64),
        26 => Some(Architecture::RiscV64),
        _ => None,
    }
}

fn parse_uimage(ctx: &ParseContext<'_>) -> Result<Parsed, FormatIssue> {
    let data = ctx.remaining();
    let header = data
        .get(..UIMAGE_HEADER_LEN)
        .ok_or_else(|| FormatIssue::Malformed("uImage header truncated".into()))?;
    let stored_crc = read_u32_be(header, 4).unwrap_or_default();
    let mut zeroed = header.to_vec();
    zeroed[4..8].fill(0);
    let mut crc = flate2::Crc::new();
    crc.update(&zeroed);
    if crc.sum() != stored_crc {
        return Err(FormatIssue::Malformed("uImage header CRC mismatch".into()));
    }
    let size = read_u32_be(header, 12).unwrap_or_default() as usize;
    let load = read_u32_be(header, 16).unwrap_or_default() as u64;
    let entry = read_u32_be(header, 20).unwrap_or_default() as u64;
    let (arch_code, image_type, compression) = (header[29], header[30], header[31]);
    let payload_end = UIMAGE_HEADER_LEN + size;
    if payload_end > data.len() {
        return Err(FormatIssue::Malformed(format!(
            "uImage payload of {size:#x} bytes runs past end of data"
        )));
    }
    let name_bytes = &header[32..UIMAGE_HEADER_LEN];
    let name_len = name_bytes.iter().position(|b| *b == 0).unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..name_len]).trim().to_string();

    let payload = ctx.offset + UIMAGE_HEADER_LEN..ctx.offset + payload_end;
    let mut parsed = Parsed::new(EntryKind::Firmware, payload_end, Content::Range(payload));
    parsed.label = (!name.is_empty()).then_some(name);
    // Uncompressed standalone programs and kernels are raw code at `load`.
    if compression == 0 && matches!(image_type, 1 | 2) {
        parsed.load = uimage_arch(arch_code).map(|arch| LoadInfo { arch, base: load, entry });
    }
    Ok(parsed)
}

/// Extent of an ELF image: the furthest byte referenced by its headers.
/// Header fields whose end overflows are ignored.
pub(crate) fn elf_extent(elf: &Elf<'_>, available: usize) -> usize {
    let table_end = |offset: u64, count: u16, entry_size: u16| {
        offset.checked_add(u64::from(count) * u64::from(entry_size))
    };
    let header = u64::from(elf.header.e_ehsize);
    let sh_table = table_end(elf.header.e_shoff, elf.header.e_shnum, elf.header.e_shentsize);
    let ph_table = table_end(elf.header.e_phoff, elf.header.e_phnum, elf.header.e_phentsize);
    let segments = elf
        .program_headers
        .iter()
        .filter_map(|ph| ph.p_offset.checked_add(ph.p_filesz))
        .max();
    let sections = elf
        .section_headers
        .iter()
        .filter(|sh| sh.sh_type != goblin::elf::section_header::SHT_NOBITS)
        .filter_map(|sh| sh.sh_offset.checked_add(sh.sh_size))
        .max();
    let extent = [sh_table, ph_table, segments, sections]
        .into_iter()
        .flatten()
        .fold(header, u64::max);
    usize::try_from(extent).unwrap_or(usize::MAX).min(available)
}

fn parse_elf(ctx: &ParseContext<'_>) -> Result<Parsed, FormatIssue> {
    let data = ctx.remaining();
    let elf = Elf::parse(data).map_err(|e| FormatIssue::Malformed(format!("elf: {e}")))?;
    let span = elf_extent(&elf, data.len());
    let mut parsed = Parsed::raw(EntryKind::Executable, ctx.offset, span);
    parsed.label = crate::image::elf_architecture(&elf).map(|a| format!("ELF {a}"));
    Ok(parsed)
}

/// True when `bytes` is a parseable ELF image.
pub(crate) fn is_elf(bytes: &[u8]) -> bool {
    bytes.starts_with(b"\x7fELF") && Elf::parse(bytes).is_ok()
}
