//! Code images: executable sections, entry points and symbols.
//!
//! Object formats are parsed with goblin; anything else is loaded raw at a
//! caller-supplied base address.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;
use std::sync::Arc;

use goblin::{elf, mach, pe, Object};
use thiserror::Error;

use crate::model::Architecture;

const PLT_ENTRY_SIZE: u64 = 16;
const MACH_S_ATTR_PURE_INSTRUCTIONS: u32 = 0x8000_0000;
const MACH_S_ATTR_SOME_INSTRUCTIONS: u32 = 0x0000_0400;
const MIN_IDENTIFIER_LEN: usize = 3;
const MAX_IDENTIFIER_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("Failed to parse object: {0}")]
    Parse(String),
    #[error("Cannot determine the architecture; pass an explicit hint")]
    UnknownArchitecture,
    #[error("Image has no executable sections")]
    NoCode,
}

/// Executable region of an image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeSection {
    pub name: String,
    pub address: u64,
    /// Byte range in the image buffer.
    pub range: Range<usize>,
}

impl CodeSection {
    /// A section whose address range fits in the address space.
    pub fn new(name: impl Into<String>, address: u64, range: Range<usize>) -> Option<Self> {
        address.checked_add(range.len() as u64)?;
        Some(Self { name: name.into(), address, range })
    }

    pub fn end(&self) -> u64 {
        self.address.saturating_add(self.range.len() as u64)
    }

    pub fn contains(&self, address: u64) -> bool {
        address >= self.address && address < self.end()
    }
}

/// Names known for addresses in an image.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    /// Defined functions.
    pub functions: BTreeMap<u64, String>,
    /// Import stubs and import table slots.
    pub imports: HashMap<u64, String>,
    /// Relocation targets, keyed by the patched address.
    pub relocations: BTreeMap<u64, String>,
}

impl SymbolTable {
    pub fn function_at(&self, address: u64) -> Option<&str> {
        self.functions.get(&address).map(String::as_str)
    }

    pub fn import_at(&self, address: u64) -> Option<&str> {
        self.imports.get(&address).map(String::as_str)
    }

    /// Symbol named by a relocation patched somewhere inside `range`.
    pub fn relocation_in(&self, range: Range<u64>) -> Option<&str> {
        self.relocations.range(range).next().map(|(_, name)| name.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty() && self.imports.is_empty() && self.relocations.is_empty()
    }
}

/// Executable sections and metadata of one code image.
#[derive(Debug, Clone)]
pub struct LoadedImage {
    pub arch: Architecture,
    pub sections: Vec<CodeSection>,
    pub entry_points: BTreeSet<u64>,
    pub symbols: SymbolTable,
    bytes: Arc<[u8]>,
}

/// True when `bytes` parse as an ELF, PE or Mach-O binary.
pub fn is_object(bytes: &[u8]) -> bool {
    matches!(
        Object::parse(bytes),
        Ok(Object::Elf(_) | Object::PE(_) | Object::Mach(mach::Mach::Binary(_)))
    )
}

pub fn elf_architecture(elf: &elf::Elf<'_>) -> Option<Architecture> {
    match elf.header.e_machine {
        elf::header::EM_X86_64 => Some(Architecture::X86_64),
        elf::header::EM_386 => Some(Architecture::X86),
        elf::header::EM_AARCH64 => Some(Architecture::Arm64),
        elf::header::EM_ARM => Some(Architecture::Arm),
        elf::header::EM_MIPS if elf.little_endian => Some(Architecture::Mips32El),
        elf::header::EM_MIPS => Some(Architecture::Mips32),
        elf::header::EM_RISCV if elf.is_64 => Some(Architecture::RiscV64),
        elf::header::EM_RISCV => Some(Architecture::RiscV32),
        elf::header::EM_PPC64 => Some(Architecture::Ppc64),
        _ => None,
    }
}

fn pe_architecture(pe: &pe::PE<'_>) -> Option<Architecture> {
    match pe.header.coff_header.machine {
        pe::header::COFF_MACHINE_X86 => Some(Architecture::X86),
        pe::header::COFF_MACHINE_X86_64 => Some(Architecture::X86_64),
        pe::header::COFF_MACHINE_ARM => Some(Architecture::Arm),
        pe::header::COFF_MACHINE_ARM64 => Some(Architecture::Arm64),
        _ => None,
    }
}

fn mach_architecture(bin: &mach::MachO<'_>) -> Option<Architecture> {
    match bin.header.cputype() {
        mach::cputype::CPU_TYPE_X86 => Some(Architecture::X86),
        mach::cputype::CPU_TYPE_X86_64 => Some(Architecture::X86_64),
        mach::cputype::CPU_TYPE_ARM => Some(Architecture::Arm),
        mach::cputype::CPU_TYPE_ARM64 => Some(Architecture::Arm64),
        _ => None,
    }
}

/// Clamp a section's file range to the buffer.
fn file_range(offset: u64, size: u64, bytes_len: usize) -> Option<Range<usize>> {
    let start = usize::try_from(offset).ok()?;
    if start >= bytes_len {
        return None;
    }
    let end = start.saturating_add(usize::try_from(size).ok()?).min(bytes_len);
    (end > start).then_some(start..end)
}

impl LoadedImage {
    /// Load an object file, or fall back to a raw image when `bytes` is not
    /// a recognized object and an architecture hint is available.
    pub fn load(
        bytes: Arc<[u8]>,
        hint: Option<Architecture>,
        base_address: u64,
    ) -> Result<Self, ImageError> {
        if is_object(&bytes) {
            Self::from_object(bytes, hint)
        } else {
            let arch = hint.ok_or(ImageError::UnknownArchitecture)?;
            Ok(Self::raw(bytes, arch, base_address, base_address))
        }
    }

    /// The whole buffer as a single code section at `base`, cut short where
    /// it would run past the top of the address space.
    pub fn raw(bytes: Arc<[u8]>, arch: Architecture, base: u64, entry: u64) -> Self {
        let room = usize::try_from(u64::MAX - base).unwrap_or(usize::MAX);
        let range = 0..bytes.len().min(room);
        let section = CodeSection { name: "raw".into(), address: base, range };
        let entry = if section.contains(entry) { entry } else { base };
        Self {
            arch,
            sections: vec![section],
            entry_points: BTreeSet::from([entry]),
            symbols: SymbolTable::default(),
            bytes,
        }
    }

    pub fn from_object(bytes: Arc<[u8]>, hint: Option<Architecture>) -> Result<Self, ImageError> {
        let parsed = match Object::parse(&bytes).map_err(|e| ImageError::Parse(e.to_string()))? {
            Object::Elf(elf) => load_elf(&elf, bytes.len(), hint),
            Object::PE(pe) => load_pe(&pe, bytes.len(), hint),
            Object::Mach(mach::Mach::Binary(bin)) => load_mach(&bin, bytes.len(), hint),
            _ => Err(ImageError::Parse("unsupported object kind".into())),
        }?;
        let (arch, sections, entry_points, symbols) = parsed;
        if sections.is_empty() {
            return Err(ImageError::NoCode);
        }
        let entry_points =
            entry_points.into_iter().filter(|a| sections.iter().any(|s| s.contains(*a))).collect();
        Ok(Self { arch, sections, entry_points, symbols, bytes })
    }

    pub fn section_bytes(&self, section: &CodeSection) -> &[u8] {
        &self.bytes[section.range.clone()]
    }

    pub fn section_containing(&self, address: u64) -> Option<&CodeSection> {
        self.sections.iter().find(|s| s.contains(address))
    }

    /// A NUL-terminated C identifier stored at `address`, as raw images use
    /// for import-by-name labels.
    pub fn identifier_at(&self, address: u64) -> Option<&str> {
        let section = self.section_containing(address)?;
        let bytes = self.section_bytes(section);
        let start = (address - section.address) as usize;
        let window = &bytes[start..bytes.len().min(start + MAX_IDENTIFIER_LEN + 1)];
        let len = window.iter().position(|b| *b == 0)?;
        let ident = &window[..len];
        let valid = len >= MIN_IDENTIFIER_LEN
            && (ident[0].is_ascii_alphabetic() || ident[0] == b'_')
            && ident.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'_');
        if valid {
            std::str::from_utf8(ident).ok()
        } else {
            None
        }
    }

    /// Name of an external routine at `address`: an import, or an identifier
    /// label. Such targets are not disassembled.
    pub fn stub_name(&self, address: u64) -> Option<&str> {
        self.symbols.import_at(address).or_else(|| self.identifier_at(address))
    }
}

type Parts = (Architecture, Vec<CodeSection>, BTreeSet<u64>, SymbolTable);

fn load_elf(
    elf: &elf::Elf<'_>,
    bytes_len: usize,
    hint: Option<Architecture>,
) -> Result<Parts, ImageError> {
    let arch = hint.or_else(|| elf_architecture(elf)).ok_or(ImageError::UnknownArchitecture)?;
    let relocatable = elf.header.e_type == elf::header::ET_REL;
    // Relocatable objects have no addresses; sections sit at their file offset.
    let section_address = |idx: usize| {
        elf.section_headers
            .get(idx)
            .map(|sh| if relocatable { sh.sh_offset } else { sh.sh_addr })
    };
    let section_name = |sh: &elf::SectionHeader| {
        elf.shdr_strtab.get_at(sh.sh_name).unwrap_or("").to_string()
    };

    let mut sections = Vec::new();
    for (idx, sh) in elf.section_headers.iter().enumerate() {
        if !sh.is_executable() || sh.sh_type == elf::section_header::SHT_NOBITS {
            continue;
        }
        let Some(range) = file_range(sh.sh_offset, sh.sh_size, bytes_len) else { continue };
        let address = section_address(idx).unwrap_or(sh.sh_addr);
        sections.extend(CodeSection::new(section_name(sh), address, range));
    }

    let mut symbols = SymbolTable::default();
    let mut entry_points = BTreeSet::new();
    if elf.entry != 0 && !relocatable {
        entry_points.insert(elf.entry);
    }
    for (syms, strtab) in [(&elf.syms, &elf.strtab), (&elf.dynsyms, &elf.dynstrtab)] {
        for sym in syms.iter() {
            if !sym.is_function() || sym.st_shndx == elf::section_header::SHN_UNDEF as usize {
                continue;
            }
            let name = strtab.get_at(sym.st_name).unwrap_or("");
            if name.is_empty() {
                continue;
            }
            let address = if relocatable {
                match section_address(sym.st_shndx).and_then(|b| b.checked_add(sym.st_value)) {
                    Some(address) => address,
                    None => continue,
                }
            } else if sym.st_value > 0 {
                sym.st_value
            } else {
                continue;
            };
            symbols.functions.entry(address).or_insert_with(|| name.to_string());
            entry_points.insert(address);
        }
    }

    // GOT slots patched by the dynamic loader.
    let dyn_name = |r_sym: usize| {
        elf.dynsyms
            .get(r_sym)
            .and_then(|s| elf.dynstrtab.get_at(s.st_name))
            .filter(|n| !n.is_empty())
            .map(str::to_string)
    };
    let mut plt_names = Vec::new();
    for reloc in elf.pltrelocs.iter() {
        let name = dyn_name(reloc.r_sym);
        if let Some(name) = &name {
            symbols.imports.insert(reloc.r_offset, name.clone());
        }
        plt_names.push(name);
    }
    for reloc in elf.dynrelas.iter().chain(elf.dynrels.iter()) {
        if let Some(name) = dyn_name(reloc.r_sym) {
            symbols.imports.entry(reloc.r_offset).or_insert(name);
        }
    }

    // x86 PLT stubs are laid out in pltrelocs order; `.plt` starts with PLT0.
    if matches!(arch, Architecture::X86 | Architecture::X86_64) {
        for sh in &elf.section_headers {
            let skip = match section_name(sh).as_str() {
                ".plt" => 1,
                ".plt.sec" => 0,
                _ => continue,
            };
            let plt_end = sh.sh_addr.saturating_add(sh.sh_size);
            for (i, name) in plt_names.iter().enumerate() {
                let Some(stub) = (i as u64 + skip)
                    .checked_mul(PLT_ENTRY_SIZE)
                    .and_then(|offset| sh.sh_addr.checked_add(offset))
                    .filter(|stub| *stub < plt_end)
                else {
                    break;
                };
                if let Some(name) = name {
                    symbols.imports.insert(stub, name.clone());
                }
            }
        }
    }

    // Section relocations in relocatable objects.
    for (reloc_idx, relocs) in &elf.shdr_relocs {
        let Some(target) = elf
            .section_headers
            .get(*reloc_idx)
            .and_then(|sh| section_address(sh.sh_info as usize))
        else {
            continue;
        };
        for reloc in relocs.iter() {
            let Some(name) = elf
                .syms
                .get(reloc.r_sym)
                .and_then(|s| elf.strtab.get_at(s.st_name))
                .filter(|n| !n.is_empty())
            else {
                continue;
            };
            if let Some(patched) = target.checked_add(reloc.r_offset) {
                symbols.relocations.insert(patched, name.to_string());
            }
        }
    }

    Ok((arch, sections, entry_points, symbols))
}

fn load_pe(
    pe: &pe::PE<'_>,
    bytes_len: usize,
    hint: Option<Architecture>,
) -> Result<Parts, ImageError> {
    let arch = hint.or_else(|| pe_architecture(pe)).ok_or(ImageError::UnknownArchitecture)?;
    let image_base = pe.image_base as u64;
    let at_rva = |rva: u64| image_base.checked_add(rva);
    let mut sections = Vec::new();
    for sec in &pe.sections {
        if sec.characteristics & pe::section_table::IMAGE_SCN_MEM_EXECUTE == 0 {
            continue;
        }
        let size = if sec.virtual_size == 0 {
            sec.size_of_raw_data
        } else {
            sec.virtual_size.min(sec.size_of_raw_data)
        };
        let Some(range) = file_range(sec.pointer_to_raw_data as u64, size as u64, bytes_len) else {
            continue;
        };
        let Some(address) = at_rva(u64::from(sec.virtual_address)) else { continue };
        sections.extend(CodeSection::new(sec.name().unwrap_or_default(), address, range));
    }

    let mut symbols = SymbolTable::default();
    let mut entry_points = BTreeSet::new();
    if let Some(entry) = at_rva(pe.entry as u64).filter(|_| pe.entry != 0) {
        entry_points.insert(entry);
    }
    for exp in &pe.exports {
        let Some(name) = exp.name.filter(|n| !n.is_empty()) else { continue };
        let Some(address) = at_rva(exp.rva as u64).filter(|_| exp.rva != 0) else { continue };
        symbols.functions.entry(address).or_insert_with(|| name.to_string());
        entry_points.insert(address);
    }
    for import in &pe.imports {
        if let Some(slot) = at_rva(import.rva as u64) {
            symbols.imports.insert(slot, import.name.to_string());
        }
    }
    Ok((arch, sections, entry_points, symbols))
}

fn load_mach(
    bin: &mach::MachO<'_>,
    bytes_len: usize,
    hint: Option<Architecture>,
) -> Result<Parts, ImageError> {
    let arch = hint.or_else(|| mach_architecture(bin)).ok_or(ImageError::UnknownArchitecture)?;
    let mut sections = Vec::new();
    let mut file_offsets = Vec::new();
    for (sec, _) in bin.segments.sections().flatten().filter_map(Result::ok) {
        if sec.flags & (MACH_S_ATTR_PURE_INSTRUCTIONS | MACH_S_ATTR_SOME_INSTRUCTIONS) == 0 {
            continue;
        }
        let Some(range) = file_range(sec.offset as u64, sec.size, bytes_len) else { continue };
        let Some(section) = CodeSection::new(sec.name().unwrap_or(""), sec.addr, range) else {
            continue;
        };
        file_offsets.push((section.range.clone(), sec.addr));
        sections.push(section);
    }

    let mut symbols = SymbolTable::default();
    let mut entry_points = BTreeSet::new();
    // LC_MAIN records a file offset; LC_UNIXTHREAD an address.
    if bin.entry != 0 {
        let entry = file_offsets
            .iter()
            .find(|(range, _)| range.contains(&(bin.entry as usize)))
            .and_then(|(range, addr)| addr.checked_add(bin.entry - range.start as u64))
            .unwrap_or(bin.entry);
        entry_points.insert(entry);
    }
    for sym in bin.symbols() {
        let Ok((name, nlist)) = sym else { continue };
        if nlist.n_value == 0 {
            continue;
        }
        let name = name.trim_start_matches('_');
        if name.is_empty() || !sections.iter().any(|s| s.contains(nlist.n_value)) {
            continue;
        }
        symbols.functions.entry(nlist.n_value).or_insert_with(|| name.to_string());
        entry_points.insert(nlist.n_value);
    }
    Ok((arch, sections, entry_points, symbols))
}
