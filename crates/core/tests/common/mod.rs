#![allow(dead_code)]

use std::io::Write;
use std::sync::Arc;

use binscope_core::backends::{
    DecodeError, DecoderRegistry, Flow, Instruction, InstructionDecoder, Target,
};
use binscope_core::config::AnalysisConfig;
use binscope_core::model::Architecture;
use binscope_core::services::analysis::AnalysisOrchestrator;

pub const TOY: &str = "toy";

/// A tiny x86-64 subset, enough to write test programs by hand.
///
/// 55 push rbp, 5D pop rbp, 90 nop, C3 ret, CC int3, 48 89 E5 mov rbp,rsp,
/// E8 rel32 call, E9 rel32 / EB rel8 jmp, 74 rel8 je, FF 15 disp32 call [rip+disp].
#[derive(Debug, Clone, Copy)]
pub struct ToyDecoder;

fn rel32(bytes: &[u8]) -> i64 {
    i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as i64
}

impl InstructionDecoder for ToyDecoder {
    fn name(&self) -> &str {
        TOY
    }

    fn architecture(&self) -> Architecture {
        Architecture::X86_64
    }

    fn decode_one(
        &self,
        bytes: &[u8],
        offset: usize,
        address: u64,
    ) -> Result<Instruction, DecodeError> {
        let code = &bytes[offset..];
        let need = |n: usize| {
            if code.len() < n {
                Err(DecodeError::Truncated { address })
            } else {
                Ok(())
            }
        };
        need(1)?;
        let (size, mnemonic, operands, flow): (u32, &str, String, Flow) = match code[0] {
            0x55 => (1, "push", "rbp".into(), Flow::Sequential),
            0x5D => (1, "pop", "rbp".into(), Flow::Sequential),
            0x90 => (1, "nop", String::new(), Flow::Sequential),
            0xC3 => (1, "ret", String::new(), Flow::Return),
            0xCC => (1, "int3", String::new(), Flow::Trap),
            0x48 if code.get(1..3) == Some(&[0x89, 0xE5][..]) => {
                (3, "mov", "rbp, rsp".into(), Flow::Sequential)
            }
            0xE8 | 0xE9 => {
                need(5)?;
                let target = (address as i64 + 5 + rel32(&code[1..5])) as u64;
                let flow = if code[0] == 0xE8 {
                    Flow::Call(Target::Direct(target))
                } else {
                    Flow::Jump(Target::Direct(target))
                };
                let mnemonic = if code[0] == 0xE8 { "call" } else { "jmp" };
                (5, mnemonic, format!("{target:#x}"), flow)
            }
            0xEB | 0x74 => {
                need(2)?;
                let target = (address as i64 + 2 + code[1] as i8 as i64) as u64;
                let flow = if code[0] == 0xEB {
                    Flow::Jump(Target::Direct(target))
                } else {
                    Flow::ConditionalJump(Target::Direct(target))
                };
                let mnemonic = if code[0] == 0xEB { "jmp" } else { "je" };
                (2, mnemonic, format!("{target:#x}"), flow)
            }
            0xFF if code.get(1) == Some(&0x15) => {
                need(6)?;
                let slot = (address as i64 + 6 + rel32(&code[2..6])) as u64;
                (6, "call", format!("qword ptr [{slot:#x}]"), Flow::Call(Target::Memory(slot)))
            }
            _ => return Err(DecodeError::Invalid { address }),
        };
        Ok(Instruction {
            address,
            size,
            mnemonic: mnemonic.to_string(),
            operands,
            flow,
            code_refs: Vec::new(),
            delay_slots: 0,
        })
    }

    fn looks_like_prologue(&self, bytes: &[u8]) -> bool {
        bytes.starts_with(&[0x55, 0x48, 0x89, 0xE5])
    }
}

pub fn toy_registry() -> DecoderRegistry {
    let mut registry = DecoderRegistry::new();
    registry.register(TOY, |arch| {
        if arch == Architecture::X86_64 {
            Ok(Arc::new(ToyDecoder) as Arc<dyn InstructionDecoder>)
        } else {
            Err(DecodeError::UnsupportedArch { decoder: TOY.into(), arch })
        }
    });
    registry
}

pub fn toy_config() -> AnalysisConfig {
    AnalysisConfig { decoder: TOY.into(), workers: 2, ..AnalysisConfig::default() }
}

pub fn toy_orchestrator(config: AnalysisConfig) -> AnalysisOrchestrator {
    AnalysisOrchestrator::with_registry(config, toy_registry()).expect("orchestrator")
}

/// Encode a rel32 branch from `site` (instruction start, 5 bytes long) to `target`.
pub fn rel32_to(site: u64, target: u64) -> [u8; 4] {
    ((target as i64 - (site as i64 + 5)) as i32).to_le_bytes()
}

/// Pad `code` with int3 up to `len` bytes.
pub fn pad_to(code: &mut Vec<u8>, len: usize) {
    assert!(code.len() <= len, "code already past {len:#x}");
    code.resize(len, 0xCC);
}

/// `main` calls `strcpy`, whose name sits as a label right after the code.
pub fn strcpy_blob() -> Vec<u8> {
    let mut code = vec![0x55, 0xE8, 0x0A, 0x00, 0x00, 0x00, 0x5D, 0xC3];
    pad_to(&mut code, 0x10);
    code.extend_from_slice(b"strcpy\0");
    code
}

/// Five functions at 0x00, 0x20, 0x30, 0x40 and 0x50 (relative to `base`):
/// the entry calls 0x20 and 0x30, 0x40 and 0x50 are only reachable by the
/// prologue sweep, and 0x50 tail-jumps to 0x20.
pub fn multi_function_blob() -> Vec<u8> {
    let mut code = vec![0x55, 0x48, 0x89, 0xE5];
    code.push(0xE8);
    code.extend_from_slice(&rel32_to(0x04, 0x20));
    code.push(0xE8);
    code.extend_from_slice(&rel32_to(0x09, 0x30));
    code.extend_from_slice(&[0x5D, 0xC3]);
    pad_to(&mut code, 0x20);
    code.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0x90, 0x5D, 0xC3]);
    pad_to(&mut code, 0x30);
    code.extend_from_slice(&[0x55, 0x74, 0x02, 0x90, 0x90, 0x5D, 0xC3]);
    pad_to(&mut code, 0x40);
    code.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0xC3]);
    pad_to(&mut code, 0x50);
    code.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0x5D, 0xE9]);
    code.extend_from_slice(&rel32_to(0x55, 0x20));
    pad_to(&mut code, 0x60);
    code
}

pub fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// A ustar archive holding `files`.
pub fn tar(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (path, data) in files {
        let mut header = tar::Header::new_ustar();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, path, *data).expect("tar append");
    }
    builder.into_inner().expect("tar finish")
}

/// Relocatable x86-64 ELF with `main` calling the undefined `strcpy`.
pub fn elf_calling_strcpy() -> Vec<u8> {
    use object::write::{Object, Relocation, Symbol, SymbolSection};
    use object::{
        BinaryFormat, Endianness, RelocationEncoding, RelocationFlags, RelocationKind,
        SectionKind, SymbolFlags, SymbolKind, SymbolScope,
    };

    let mut obj =
        Object::new(BinaryFormat::Elf, object::Architecture::X86_64, Endianness::Little);
    let text = obj.add_section(Vec::new(), b".text".to_vec(), SectionKind::Text);
    let code = [0x55, 0x48, 0x89, 0xE5, 0xE8, 0x00, 0x00, 0x00, 0x00, 0x5D, 0xC3];
    let main_offset = obj.append_section_data(text, &code, 16);
    obj.add_symbol(Symbol {
        name: b"main".to_vec(),
        value: main_offset,
        size: code.len() as u64,
        kind: SymbolKind::Text,
        scope: SymbolScope::Linkage,
        weak: false,
        section: SymbolSection::Section(text),
        flags: SymbolFlags::None,
    });
    let strcpy = obj.add_symbol(Symbol {
        name: b"strcpy".to_vec(),
        value: 0,
        size: 0,
        kind: SymbolKind::Text,
        scope: SymbolScope::Dynamic,
        weak: false,
        section: SymbolSection::Undefined,
        flags: SymbolFlags::None,
    });
    obj.add_relocation(
        text,
        Relocation {
            offset: main_offset + 5,
            symbol: strcpy,
            addend: -4,
            flags: RelocationFlags::Generic {
                kind: RelocationKind::PltRelative,
                encoding: RelocationEncoding::X86Branch,
                size: 32,
            },
        },
    )
    .expect("relocation");
    obj.write().expect("write elf")
}

fn cpio_record(out: &mut Vec<u8>, name: &str, mode: u32, data: &[u8]) {
    let fields = [1, mode, 0, 0, 1, 0, data.len() as u32, 0, 0, 0, 0, name.len() as u32 + 1, 0];
    out.extend_from_slice(b"070701");
    for field in fields {
        out.extend_from_slice(format!("{field:08X}").as_bytes());
    }
    out.extend_from_slice(name.as_bytes());
    out.push(0);
    out.resize(out.len().div_ceil(4) * 4, 0);
    out.extend_from_slice(data);
    out.resize(out.len().div_ceil(4) * 4, 0);
}

/// A newc cpio archive of regular files, a directory record and the trailer.
pub fn cpio_newc(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    cpio_record(&mut out, "etc", 0o040755, &[]);
    for (name, data) in files {
        cpio_record(&mut out, name, 0o100644, data);
    }
    cpio_record(&mut out, "TRAILER!!!", 0, &[]);
    out
}

/// A zip archive written with deflated members.
pub fn zip_deflated(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, data) in files {
        writer.start_file(*name, options).expect("zip entry");
        writer.write_all(data).expect("zip write");
    }
    writer.finish().expect("zip finish").into_inner()
}

/// A zip archive as streaming writers produce it: stored members whose local
/// headers carry zero sizes, followed by data descriptors.
pub fn zip_streamed(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut central = Vec::new();
    for (name, data) in files {
        let mut crc = flate2::Crc::new();
        crc.update(data);
        let (crc, size) = (crc.sum(), data.len() as u32);
        let local_offset = out.len() as u32;

        out.extend_from_slice(&0x0403_4b50u32.to_le_bytes());
        out.extend_from_slice(&20u16.to_le_bytes());
        out.extend_from_slice(&0x0008u16.to_le_bytes());
        out.extend_from_slice(&[0; 2 + 4 + 4 + 4 + 4]);
        out.extend_from_slice(&(name.len() as u16).to_le_bytes());
        out.extend_from_slice(&0u16.to_le_bytes());
        out.extend_from_slice(name.as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(&0x0807_4b50u32.to_le_bytes());
        for value in [crc, size, size] {
            out.extend_from_slice(&value.to_le_bytes());
        }

        central.extend_from_slice(&0x0201_4b50u32.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&20u16.to_le_bytes());
        central.extend_from_slice(&0x0008u16.to_le_bytes());
        central.extend_from_slice(&[0; 2 + 4]);
        for value in [crc, size, size] {
            central.extend_from_slice(&value.to_le_bytes());
        }
        central.extend_from_slice(&(name.len() as u16).to_le_bytes());
        central.extend_from_slice(&[0; 2 + 2 + 2 + 2 + 4]);
        central.extend_from_slice(&local_offset.to_le_bytes());
        central.extend_from_slice(name.as_bytes());
    }
    let (cd_offset, cd_size) = (out.len() as u32, central.len() as u32);
    out.extend(central);
    out.extend_from_slice(&0x0605_4b50u32.to_le_bytes());
    out.extend_from_slice(&[0; 4]);
    out.extend_from_slice(&(files.len() as u16).to_le_bytes());
    out.extend_from_slice(&(files.len() as u16).to_le_bytes());
    out.extend_from_slice(&cd_size.to_le_bytes());
    out.extend_from_slice(&cd_offset.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out
}

/// A SquashFS superblock (v4, xz) claiming `bytes_used`, padded to `len`.
pub fn squashfs(big_endian: bool, bytes_used: u64, len: usize) -> Vec<u8> {
    let mut image = vec![0u8; len];
    let u16_bytes = |v: u16| if big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
    let u64_bytes = |v: u64| if big_endian { v.to_be_bytes() } else { v.to_le_bytes() };
    image[..4].copy_from_slice(if big_endian { b"sqsh" } else { b"hsqs" });
    image[20..22].copy_from_slice(&u16_bytes(4));
    image[28..30].copy_from_slice(&u16_bytes(4));
    image[40..48].copy_from_slice(&u64_bytes(bytes_used));
    image
}

/// A legacy U-Boot image with a valid header CRC.
pub fn uimage(arch: u8, image_type: u8, load: u32, entry: u32, payload: &[u8]) -> Vec<u8> {
    let mut header = vec![0u8; 64];
    header[0..4].copy_from_slice(&0x2705_1956u32.to_be_bytes());
    header[12..16].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    header[16..20].copy_from_slice(&load.to_be_bytes());
    header[20..24].copy_from_slice(&entry.to_be_bytes());
    header[28] = 5;
    header[29] = arch;
    header[30] = image_type;
    header[32..43].copy_from_slice(b"test kernel");
    let mut crc = flate2::Crc::new();
    crc.update(&header);
    header[4..8].copy_from_slice(&crc.sum().to_be_bytes());
    header.extend_from_slice(payload);
    header
}

/// An x86-64 ELF header with one PT_LOAD whose offset plus size overflows.
pub fn elf_with_wild_segment() -> Vec<u8> {
    let mut elf = vec![0u8; 64];
    elf[..8].copy_from_slice(&[0x7F, b'E', b'L', b'F', 2, 1, 1, 0]);
    elf[16..18].copy_from_slice(&2u16.to_le_bytes());
    elf[18..20].copy_from_slice(&62u16.to_le_bytes());
    elf[20..24].copy_from_slice(&1u32.to_le_bytes());
    elf[32..40].copy_from_slice(&64u64.to_le_bytes());
    elf[52..54].copy_from_slice(&64u16.to_le_bytes());
    elf[54..56].copy_from_slice(&56u16.to_le_bytes());
    elf[56..58].copy_from_slice(&1u16.to_le_bytes());
    elf[58..60].copy_from_slice(&64u16.to_le_bytes());

    let mut phdr = Vec::with_capacity(56);
    phdr.extend_from_slice(&1u32.to_le_bytes());
    phdr.extend_from_slice(&5u32.to_le_bytes());
    for value in [0xFFFF_FFFF_FFFF_FF00u64, 0x40_0000, 0x40_0000, 0x1000, 0x1000, 0x1000] {
        phdr.extend_from_slice(&value.to_le_bytes());
    }
    elf.extend(phdr);
    elf
}
