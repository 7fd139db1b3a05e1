mod common;

use std::sync::Arc;

use binscope_core::analysis::{CallGraphBuilder, CodeUnit, EdgeKind, FunctionRecoverer};
use binscope_core::image::LoadedImage;
use binscope_core::model::{Architecture, CancellationToken, FunctionId};
use common::{multi_function_blob, strcpy_blob, toy_config, ToyDecoder};

const BASE: u64 = 0x1000;

fn unit(bytes: Vec<u8>) -> CodeUnit {
    let image = LoadedImage::raw(Arc::from(bytes), Architecture::X86_64, BASE, BASE);
    let recoverer = FunctionRecoverer::new(Arc::new(ToyDecoder), &toy_config());
    let functions = recoverer.recover(&image, "blob", 0, &CancellationToken::new()).functions;
    CodeUnit { owner: "blob".into(), image, functions }
}

#[test]
fn direct_calls_resolve_to_recovered_functions() {
    let graph = CallGraphBuilder::new().build(&[unit(multi_function_blob())]);

    assert_eq!(graph.nodes.len(), 5);
    let from_main: Vec<_> = graph.edges_from(FunctionId(0)).collect();
    assert_eq!(from_main.len(), 2);
    assert!(from_main.iter().all(|e| e.kind == EdgeKind::DirectCall));
    let callees: Vec<_> = from_main.iter().map(|e| e.callee.function).collect();
    assert_eq!(callees, vec![Some(FunctionId(1)), Some(FunctionId(2))]);
    assert_eq!(from_main[0].site, BASE + 4);
}

#[test]
fn tail_jump_counts_as_a_call_edge() {
    let graph = CallGraphBuilder::new().build(&[unit(multi_function_blob())]);
    let tail: Vec<_> = graph.edges_from(FunctionId(4)).collect();
    assert_eq!(tail.len(), 1);
    assert_eq!(tail[0].callee.function, Some(FunctionId(1)));
    assert_eq!(tail[0].callee.name.as_deref(), Some("sub_1020"));
}

#[test]
fn named_external_targets_stay_unresolved() {
    let graph = CallGraphBuilder::new().build(&[unit(strcpy_blob())]);

    assert_eq!(graph.edges.len(), 1);
    let edge = &graph.edges[0];
    assert_eq!(edge.kind, EdgeKind::DirectCall);
    assert!(!edge.callee.is_resolved());
    assert_eq!(edge.callee.name.as_deref(), Some("strcpy"));
    assert_eq!(edge.callee.address, Some(BASE + 0x10));
    assert_eq!(graph.unresolved().count(), 1);
}

#[test]
fn memory_indirect_calls_are_indirect_edges() {
    // call [rip+0x0a] -> slot at 0x1010; ret
    let mut code = vec![0x55, 0xFF, 0x15, 0x09, 0x00, 0x00, 0x00, 0x5D, 0xC3];
    common::pad_to(&mut code, 0x20);
    let graph = CallGraphBuilder::new().build(&[unit(code)]);

    assert_eq!(graph.edges.len(), 1);
    assert_eq!(graph.edges[0].kind, EdgeKind::IndirectCall);
    assert_eq!(graph.edges[0].callee.expression, "[0x1010]");
    assert!(!graph.edges[0].callee.is_resolved());
}

#[test]
fn empty_input_gives_empty_graph() {
    let graph = CallGraphBuilder::new().build(&[]);
    assert!(graph.nodes.is_empty());
    assert!(graph.edges.is_empty());
}

#[test]
fn dot_output_names_every_node() {
    let graph = CallGraphBuilder::new().build(&[unit(strcpy_blob())]);
    let dot = graph.to_dot();
    assert!(dot.starts_with("digraph callgraph {"));
    assert!(dot.contains("sub_1000"));
    assert!(dot.contains("\"ext:strcpy\""));
}
