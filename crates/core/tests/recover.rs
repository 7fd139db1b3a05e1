mod common;

use std::sync::Arc;

use binscope_core::analysis::{ExitKind, FunctionRecoverer, FunctionSource};
use binscope_core::image::LoadedImage;
use binscope_core::model::{Architecture, CancellationToken, WarningKind};
use common::{multi_function_blob, pad_to, rel32_to, toy_config, ToyDecoder};

const BASE: u64 = 0x1000;

fn raw(bytes: Vec<u8>) -> LoadedImage {
    LoadedImage::raw(Arc::from(bytes), Architecture::X86_64, BASE, BASE)
}

fn recoverer() -> FunctionRecoverer {
    FunctionRecoverer::new(Arc::new(ToyDecoder), &toy_config())
}

#[test]
fn prologue_and_return_make_one_function() {
    let image = raw(vec![0x55, 0x48, 0x89, 0xE5, 0xC3]);
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    assert_eq!(recovery.functions.len(), 1);
    let f = &recovery.functions[0];
    assert_eq!((f.start, f.end), (BASE, BASE + 5));
    assert_eq!(f.exit, ExitKind::Return);
    assert_eq!(f.name, "sub_1000");
    assert_eq!(f.instructions.len(), 3);
    assert!(recovery.warnings.is_empty());
}

#[test]
fn calls_and_prologues_are_recovered() {
    let image = raw(multi_function_blob());
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    let starts: Vec<_> = recovery.functions.iter().map(|f| f.start - BASE).collect();
    assert_eq!(starts, vec![0x00, 0x20, 0x30, 0x40, 0x50]);
    let sources: Vec<_> = recovery.functions.iter().map(|f| f.source).collect();
    assert_eq!(
        sources,
        vec![
            FunctionSource::EntryPoint,
            FunctionSource::EntryPoint,
            FunctionSource::EntryPoint,
            FunctionSource::Sweep,
            FunctionSource::Sweep,
        ]
    );
    let ids: Vec<_> = recovery.functions.iter().map(|f| f.id.0).collect();
    assert_eq!(ids, vec![0, 1, 2, 3, 4]);
}

#[test]
fn recovered_functions_do_not_overlap() {
    let image = raw(multi_function_blob());
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    for pair in recovery.functions.windows(2) {
        assert!(pair[0].end <= pair[1].start, "{} overlaps {}", pair[0].name, pair[1].name);
    }
    for f in &recovery.functions {
        assert!(f.instructions.iter().all(|i| f.contains(i.address)), "{}", f.name);
    }
}

#[test]
fn conditional_branch_paths_are_both_followed() {
    let image = raw(multi_function_blob());
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    let f = recovery.functions.iter().find(|f| f.start == BASE + 0x30).unwrap();
    let addrs: Vec<_> = f.instructions.iter().map(|i| i.address - BASE).collect();
    assert_eq!(addrs, vec![0x30, 0x31, 0x33, 0x34, 0x35, 0x36]);
    assert_eq!(f.end, BASE + 0x37);
}

#[test]
fn jump_into_another_function_is_a_tail_call() {
    let image = raw(multi_function_blob());
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    let f = recovery.functions.iter().find(|f| f.start == BASE + 0x50).unwrap();
    assert_eq!(f.exit, ExitKind::TailCall);
}

#[test]
fn first_id_offsets_function_ids() {
    let image = raw(vec![0x55, 0x48, 0x89, 0xE5, 0xC3]);
    let recovery = recoverer().recover(&image, "blob", 7, &CancellationToken::new());
    assert_eq!(recovery.functions[0].id.0, 7);
}

#[test]
fn undecodable_bytes_end_the_path_with_a_warning() {
    let image = raw(vec![0x55, 0x0F, 0x0B]);
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    assert_eq!(recovery.functions.len(), 1);
    assert_eq!(recovery.functions[0].exit, ExitKind::Indeterminate);
    assert_eq!(recovery.functions[0].end, BASE + 1);
    assert!(recovery.warnings.iter().any(|w| w.kind == WarningKind::Decode));
}

#[test]
fn instruction_limit_stops_recovery() {
    let mut config = toy_config();
    config.max_instructions_per_function = 3;
    let recoverer = FunctionRecoverer::new(Arc::new(ToyDecoder), &config);
    let image = raw(vec![0x55, 0x90, 0x90, 0x90, 0x90, 0x5D, 0xC3]);
    let recovery = recoverer.recover(&image, "blob", 0, &CancellationToken::new());

    let f = &recovery.functions[0];
    assert_eq!(f.instructions.len(), 3);
    assert_eq!(f.exit, ExitKind::Indeterminate);
    assert!(recovery.warnings.iter().any(|w| w.kind == WarningKind::ResourceLimit));
}

#[test]
fn call_to_no_return_routine_ends_the_path() {
    // call exit; then bytes that would not decode
    let mut code = vec![0x55, 0xE8, 0x0A, 0x00, 0x00, 0x00, 0x0F, 0x0B];
    common::pad_to(&mut code, 0x10);
    code.extend_from_slice(b"exit\0");
    let image = raw(code);
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    let f = &recovery.functions[0];
    assert_eq!(f.end, BASE + 6);
    assert_eq!(f.exit, ExitKind::Return);
    assert!(recovery.warnings.is_empty());
}

#[test]
fn cancelled_recovery_returns_without_functions() {
    let cancel = CancellationToken::new();
    cancel.cancel();
    let image = raw(multi_function_blob());
    let recovery = recoverer().recover(&image, "blob", 0, &cancel);
    assert!(recovery.functions.is_empty());
}

#[test]
fn swept_function_stops_before_the_next_function() {
    // The entry calls 0x26, which sits inside the operand of the call at 0x24.
    let mut code = vec![0xE8];
    code.extend_from_slice(&rel32_to(0x00, 0x26));
    code.push(0xC3);
    pad_to(&mut code, 0x20);
    code.extend_from_slice(&[0x55, 0x48, 0x89, 0xE5, 0xE8, 0x00, 0xC3, 0x00, 0x00]);
    pad_to(&mut code, 0x30);
    let image = raw(code);
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());

    let starts: Vec<_> = recovery.functions.iter().map(|f| f.start - BASE).collect();
    assert_eq!(starts, vec![0x00, 0x20, 0x26]);
    for pair in recovery.functions.windows(2) {
        assert!(pair[0].end <= pair[1].start, "{} overlaps {}", pair[0].name, pair[1].name);
    }
    let swept = &recovery.functions[1];
    assert_eq!(swept.source, FunctionSource::Sweep);
    assert_eq!(swept.end, BASE + 0x24);
    assert_eq!(swept.exit, ExitKind::Indeterminate);
    assert!(recovery.warnings.is_empty(), "{:?}", recovery.warnings);
}

#[test]
fn raw_image_at_the_top_of_the_address_space_is_cut_short() {
    let base = u64::MAX - 7;
    let image = LoadedImage::raw(Arc::from(vec![0x90; 16]), Architecture::X86_64, base, base);

    assert_eq!(image.sections[0].range, 0..7);
    assert_eq!(image.sections[0].end(), u64::MAX);
    let recovery = recoverer().recover(&image, "blob", 0, &CancellationToken::new());
    let f = &recovery.functions[0];
    assert_eq!((f.start, f.end), (base, u64::MAX));
    assert_eq!(f.instructions.len(), 7);
}
