use std::collections::BTreeMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{external_name, CodeUnit, Function};
use crate::backends::{Flow, Instruction, Target};
use crate::image::LoadedImage;
use crate::model::FunctionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    DirectCall,
    IndirectCall,
    DataReference,
}

/// What an edge points at. An edge whose `function` is `None` is unresolved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Callee {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<FunctionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Raw target expression as decoded.
    pub expression: String,
}

impl Callee {
    pub fn is_resolved(&self) -> bool {
        self.function.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallEdge {
    pub caller: FunctionId,
    pub site: u64,
    pub kind: EdgeKind,
    pub callee: Callee,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: FunctionId,
    pub owner: String,
    pub name: String,
    pub address: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<CallEdge>,
}

impl CallGraph {
    pub fn node(&self, id: FunctionId) -> Option<&GraphNode> {
        self.nodes.binary_search_by_key(&id, |n| n.id).ok().map(|idx| &self.nodes[idx])
    }

    pub fn edges_from(&self, caller: FunctionId) -> impl Iterator<Item = &CallEdge> {
        self.edges.iter().filter(move |e| e.caller == caller)
    }

    pub fn unresolved(&self) -> impl Iterator<Item = &CallEdge> {
        self.edges.iter().filter(|e| !e.callee.is_resolved())
    }

    /// Graphviz rendering. Unresolved callees become external nodes.
    pub fn to_dot(&self) -> String {
        let mut out = String::from("digraph callgraph {\n    node [shape=box];\n");
        for node in &self.nodes {
            let _ = writeln!(
                out,
                "    \"{}\" [label=\"{}\\n{:#x}\"];",
                node.id,
                escape(&node.name),
                node.address
            );
        }
        for edge in &self.edges {
            let target = match (&edge.callee.function, &edge.callee.name) {
                (Some(id), _) => id.to_string(),
                (None, Some(name)) => format!("ext:{name}"),
                (None, None) => format!("ext:{}", edge.callee.expression),
            };
            let style = match edge.kind {
                EdgeKind::DirectCall => "solid",
                EdgeKind::IndirectCall => "dashed",
                EdgeKind::DataReference => "dotted",
            };
            let _ = writeln!(
                out,
                "    \"{}\" -> \"{}\" [style={style}, label=\"{:#x}\"];",
                edge.caller,
                escape(&target),
                edge.site
            );
        }
        out.push_str("}\n");
        out
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Function lookup by address and by name within one unit.
struct UnitIndex<'a> {
    by_start: BTreeMap<u64, &'a Function>,
    by_name: BTreeMap<&'a str, FunctionId>,
}

impl<'a> UnitIndex<'a> {
    fn new(functions: &'a [Function]) -> Self {
        let mut by_name = BTreeMap::new();
        for f in functions {
            by_name.entry(f.name.as_str()).or_insert(f.id);
        }
        Self { by_start: functions.iter().map(|f| (f.start, f)).collect(), by_name }
    }

    fn containing(&self, address: u64) -> Option<&'a Function> {
        self.by_start
            .range(..=address)
            .next_back()
            .map(|(_, f)| *f)
            .filter(|f| f.contains(address))
    }
}

/// Builds the call graph of all recovered functions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CallGraphBuilder;

impl CallGraphBuilder {
    pub fn new() -> Self {
        Self
    }

    pub fn build(&self, units: &[CodeUnit]) -> CallGraph {
        let mut graph = CallGraph::default();
        for unit in units {
            let index = UnitIndex::new(&unit.functions);
            for function in &unit.functions {
                graph.nodes.push(GraphNode {
                    id: function.id,
                    owner: function.owner.clone(),
                    name: function.name.clone(),
                    address: function.start,
                });
                for insn in &function.instructions {
                    if let Some(edge) = edge_for(&unit.image, &index, function, insn) {
                        graph.edges.push(edge);
                    }
                    for addr in &insn.code_refs {
                        let edge = reference_edge(&unit.image, &index, function, insn, *addr);
                        if let Some(edge) = edge {
                            graph.edges.push(edge);
                        }
                    }
                }
            }
        }
        graph.nodes.sort_by_key(|n| n.id);
        graph.edges.sort_by(|a, b| {
            (a.caller, a.site, a.kind).cmp(&(b.caller, b.site, b.kind))
        });
        debug!(nodes = graph.nodes.len(), edges = graph.edges.len(), "call graph built");
        graph
    }
}

fn edge_for(
    image: &LoadedImage,
    index: &UnitIndex<'_>,
    caller: &Function,
    insn: &Instruction,
) -> Option<CallEdge> {
    let external = external_name(image, insn).map(str::to_string);
    let (kind, target) = match &insn.flow {
        Flow::Call(Target::Direct(_)) => (EdgeKind::DirectCall, None),
        Flow::Call(target) => (EdgeKind::IndirectCall, Some(target)),
        // Jumps out of the function are tail calls.
        Flow::Jump(Target::Direct(t)) if !caller.contains(*t) => (EdgeKind::DirectCall, None),
        Flow::Jump(target @ Target::Memory(_)) if external.is_some() => {
            (EdgeKind::IndirectCall, Some(target))
        }
        _ => return None,
    };
    let transfer_target = match &insn.flow {
        Flow::Call(t) | Flow::Jump(t) => t,
        _ => return None,
    };

    let callee = match (kind, transfer_target) {
        (EdgeKind::DirectCall, Target::Direct(addr)) => {
            let function = match &external {
                // Named routines resolve only to a local definition of that name.
                Some(name) => index.by_name.get(name.as_str()).copied(),
                None => index.containing(*addr).map(|f| f.id),
            };
            let name = external.clone().or_else(|| {
                function.and_then(|id| {
                    index.by_start.values().find(|f| f.id == id).map(|f| f.name.clone())
                })
            });
            Callee {
                function,
                address: Some(*addr),
                name,
                expression: format!("{addr:#x}"),
            }
        }
        _ => Callee {
            function: None,
            address: None,
            name: external,
            expression: target.map(|t| t.to_string()).unwrap_or_default(),
        },
    };
    Some(CallEdge { caller: caller.id, site: insn.address, kind, callee })
}

fn reference_edge(
    image: &LoadedImage,
    index: &UnitIndex<'_>,
    caller: &Function,
    insn: &Instruction,
    address: u64,
) -> Option<CallEdge> {
    image.section_containing(address)?;
    let target = index.containing(address);
    Some(CallEdge {
        caller: caller.id,
        site: insn.address,
        kind: EdgeKind::DataReference,
        callee: Callee {
            function: target.map(|f| f.id),
            address: Some(address),
            name: target.map(|f| f.name.clone()),
            expression: format!("{address:#x}"),
        },
    })
}
