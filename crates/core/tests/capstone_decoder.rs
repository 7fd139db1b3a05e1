#![cfg(feature = "capstone-backend")]

mod common;

use binscope_core::backends::{default_decoder_registry, Flow, InstructionDecoder, Target};
use binscope_core::config::AnalysisConfig;
use binscope_core::model::{Architecture, Artifact, CancellationToken};
use binscope_core::services::analysis::{AnalysisOrchestrator, Outcome};
use binscope_core::services::backends::CapstoneDecoder;

#[test]
fn x86_64_call_and_return_are_classified() {
    let decoder = CapstoneDecoder::new(Architecture::X86_64).unwrap();
    let code = [0x55, 0xE8, 0x0A, 0x00, 0x00, 0x00, 0xC3];

    let push = decoder.decode_one(&code, 0, 0x1000).unwrap();
    assert_eq!(push.mnemonic, "push");
    assert_eq!(push.flow, Flow::Sequential);

    let call = decoder.decode_one(&code, 1, 0x1001).unwrap();
    assert_eq!(call.size, 5);
    assert_eq!(call.flow, Flow::Call(Target::Direct(0x1010)));

    let ret = decoder.decode_one(&code, 6, 0x1006).unwrap();
    assert_eq!(ret.flow, Flow::Return);
}

#[test]
fn x86_64_prologue_is_recognized() {
    let decoder = CapstoneDecoder::new(Architecture::X86_64).unwrap();
    assert!(decoder.looks_like_prologue(&[0x55, 0x48, 0x89, 0xE5, 0xC3]));
    assert!(!decoder.looks_like_prologue(&[0x90, 0x90, 0x90, 0x90]));
}

#[test]
fn truncated_bytes_do_not_decode() {
    let decoder = CapstoneDecoder::new(Architecture::X86_64).unwrap();
    assert!(decoder.decode_one(&[0xE8, 0x00], 0, 0).is_err());
}

#[test]
fn every_architecture_builds_an_engine() {
    for arch in Architecture::ALL {
        assert!(CapstoneDecoder::new(arch).is_ok(), "{arch}");
    }
    assert!(default_decoder_registry().contains("capstone"));
}

#[test]
fn default_decoder_analyzes_relocatable_elf() {
    let orchestrator = AnalysisOrchestrator::new(AnalysisConfig::default()).unwrap();
    let artifact = Artifact::from_bytes("app.o", common::elf_calling_strcpy());
    let report = orchestrator.analyze(&artifact, &CancellationToken::new()).unwrap().report;

    assert_eq!(report.outcome, Outcome::Success);
    assert_eq!(report.functions.len(), 1);
    assert_eq!(report.functions[0].name, "main");
    assert_eq!(report.findings.len(), 1);
    assert_eq!(report.findings[0].rule, "strcpy");
}
