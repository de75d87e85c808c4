//! Versioned binary save/load of execution graphs.
//!
//! Layout, all integers big-endian: magic, format version, globals
//! (max voices, sample rate, chunk size), node records in index order,
//! then edge records as node-index pairs. `load` replays `add_edge` and
//! validates the result, so a malformed file can never install a graph
//! that the rest of the compiler would reject.

use std::io::{Read, Write};
use std::sync::Arc;

use ahash::AHashMap;

use cadenza_core::native_module::{ConstantValue, NativeModuleUid};
use cadenza_core::registry::NativeModuleRegistry;
use cadenza_core::GraphGlobals;

use crate::error::{GraphError, LoadError};
use crate::graph::{ExecutionGraph, NodeKind, NodeRef};

pub const MAGIC: [u8; 4] = *b"cdza";
pub const FORMAT_VERSION: u32 = 1;

const TAG_CONSTANT_REAL: u8 = 0;
const TAG_CONSTANT_BOOL: u8 = 1;
const TAG_CONSTANT_STR: u8 = 2;
const TAG_MODULE_CALL: u8 = 3;
const TAG_INDEXED_INPUT: u8 = 4;
const TAG_INDEXED_OUTPUT: u8 = 5;
const TAG_GRAPH_INPUT: u8 = 6;
const TAG_GRAPH_OUTPUT: u8 = 7;

impl ExecutionGraph {
    pub fn save(&self, out: &mut impl Write) -> std::io::Result<()> {
        out.write_all(&MAGIC)?;
        out.write_all(&FORMAT_VERSION.to_be_bytes())?;

        let globals = self.globals();
        out.write_all(&globals.max_voices.to_be_bytes())?;
        out.write_all(&globals.sample_rate.to_be_bytes())?;
        out.write_all(&globals.chunk_size.to_be_bytes())?;

        // Assign contiguous on-disk indices in storage order.
        let mut indices: AHashMap<NodeRef, u32> = AHashMap::with_capacity(self.node_count());
        for (index, entry) in self.nodes().enumerate() {
            indices.insert(entry.id, index as u32);
        }

        out.write_all(&(self.node_count() as u32).to_be_bytes())?;
        for entry in self.nodes() {
            match &entry.kind {
                NodeKind::Constant(ConstantValue::Real(value)) => {
                    out.write_all(&[TAG_CONSTANT_REAL])?;
                    out.write_all(&value.to_bits().to_be_bytes())?;
                }
                NodeKind::Constant(ConstantValue::Bool(value)) => {
                    out.write_all(&[TAG_CONSTANT_BOOL, *value as u8])?;
                }
                NodeKind::Constant(ConstantValue::Str(value)) => {
                    out.write_all(&[TAG_CONSTANT_STR])?;
                    out.write_all(&(value.len() as u32).to_be_bytes())?;
                    out.write_all(value.as_bytes())?;
                }
                NodeKind::ModuleCall { module } => {
                    out.write_all(&[TAG_MODULE_CALL])?;
                    out.write_all(&module.to_be_bytes())?;
                }
                NodeKind::IndexedInput(index) => {
                    out.write_all(&[TAG_INDEXED_INPUT])?;
                    out.write_all(&index.to_be_bytes())?;
                }
                NodeKind::IndexedOutput(index) => {
                    out.write_all(&[TAG_INDEXED_OUTPUT])?;
                    out.write_all(&index.to_be_bytes())?;
                }
                NodeKind::GraphInput(index) => {
                    out.write_all(&[TAG_GRAPH_INPUT])?;
                    out.write_all(&index.to_be_bytes())?;
                }
                NodeKind::GraphOutput(index) => {
                    out.write_all(&[TAG_GRAPH_OUTPUT])?;
                    out.write_all(&index.to_be_bytes())?;
                }
                NodeKind::TemporaryReference => {
                    unreachable!("temporary references never persist")
                }
            }
        }

        let edge_count: usize = self.nodes().map(|entry| entry.outgoing().len()).sum();
        out.write_all(&(edge_count as u32).to_be_bytes())?;
        for entry in self.nodes() {
            for to in entry.outgoing() {
                out.write_all(&indices[&entry.id].to_be_bytes())?;
                out.write_all(&indices[to].to_be_bytes())?;
            }
        }

        Ok(())
    }

    /// Loads a graph saved with [`save`](ExecutionGraph::save),
    /// validating it against `registry` before returning.
    pub fn load(
        input: &mut impl Read,
        registry: &NativeModuleRegistry,
    ) -> Result<Self, LoadError> {
        let mut magic = [0u8; 4];
        input.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(LoadError::InvalidHeader);
        }

        let version = read_u32(input)?;
        if version != FORMAT_VERSION {
            return Err(LoadError::VersionMismatch {
                found: version,
                expected: FORMAT_VERSION,
            });
        }

        let mut graph = ExecutionGraph::new();
        graph.set_globals(GraphGlobals {
            max_voices: read_u32(input)?,
            sample_rate: read_u32(input)?,
            chunk_size: read_u32(input)?,
        });

        let node_count = read_u32(input)? as usize;
        let mut refs: Vec<NodeRef> = Vec::with_capacity(node_count);
        for _ in 0..node_count {
            let kind = match read_u8(input)? {
                TAG_CONSTANT_REAL => {
                    NodeKind::Constant(ConstantValue::Real(f32::from_bits(read_u32(input)?)))
                }
                TAG_CONSTANT_BOOL => NodeKind::Constant(ConstantValue::Bool(read_u8(input)? != 0)),
                TAG_CONSTANT_STR => {
                    let len = read_u32(input)? as usize;
                    let mut bytes = vec![0u8; len];
                    input.read_exact(&mut bytes)?;
                    let text = String::from_utf8(bytes)
                        .map_err(|_| LoadError::MalformedRecord("non-utf8 string constant"))?;
                    NodeKind::Constant(ConstantValue::Str(Arc::from(text.as_str())))
                }
                TAG_MODULE_CALL => {
                    let mut bytes = [0u8; 8];
                    input.read_exact(&mut bytes)?;
                    NodeKind::ModuleCall {
                        module: NativeModuleUid::from_be_bytes(bytes),
                    }
                }
                TAG_INDEXED_INPUT => NodeKind::IndexedInput(read_u32(input)?),
                TAG_INDEXED_OUTPUT => NodeKind::IndexedOutput(read_u32(input)?),
                TAG_GRAPH_INPUT => NodeKind::GraphInput(read_u32(input)?),
                TAG_GRAPH_OUTPUT => NodeKind::GraphOutput(read_u32(input)?),
                _ => return Err(LoadError::MalformedRecord("unknown node tag")),
            };

            refs.push(graph.insert_raw(kind));
        }

        let edge_count = read_u32(input)? as usize;
        for _ in 0..edge_count {
            let from = read_u32(input)? as usize;
            let to = read_u32(input)? as usize;

            let (Some(&from), Some(&to)) = (refs.get(from), refs.get(to)) else {
                return Err(LoadError::MalformedRecord("edge index out of range"));
            };
            graph
                .add_edge(from, to)
                .map_err(|_| LoadError::InvalidGraph(GraphError::InvalidGraph(
                    "illegal edge record".to_string(),
                )))?;
        }

        graph.validate(registry)?;
        Ok(graph)
    }
}

fn read_u8(input: &mut impl Read) -> std::io::Result<u8> {
    let mut byte = [0u8; 1];
    input.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_u32(input: &mut impl Read) -> std::io::Result<u32> {
    let mut bytes = [0u8; 4];
    input.read_exact(&mut bytes)?;
    Ok(u32::from_be_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::builtin;

    fn example_graph(registry: &NativeModuleRegistry) -> ExecutionGraph {
        let mut graph = ExecutionGraph::new();
        graph.set_globals(GraphGlobals {
            max_voices: 4,
            sample_rate: 48_000,
            chunk_size: 0,
        });

        let input = graph.add_graph_input_node(0);
        let constant = graph.add_constant_node(ConstantValue::Real(440.0));
        let call = graph
            .add_module_call_node(registry, builtin::modules::MULTIPLY)
            .unwrap();
        let output = graph.add_graph_output_node(0);

        graph
            .add_edge(input, graph.call_indexed_input(call, 0).unwrap())
            .unwrap();
        graph
            .add_edge(constant, graph.call_indexed_input(call, 1).unwrap())
            .unwrap();
        graph
            .add_edge(graph.call_indexed_output(call, 0).unwrap(), output)
            .unwrap();

        graph
    }

    fn sorted_kinds(graph: &ExecutionGraph) -> Vec<String> {
        let mut kinds: Vec<String> = graph.nodes().map(|n| format!("{:?}", n.kind)).collect();
        kinds.sort();
        kinds
    }

    #[test]
    fn save_load_round_trip() {
        let registry = builtin::native_module_registry();
        let graph = example_graph(&registry);

        let mut bytes = Vec::new();
        graph.save(&mut bytes).unwrap();

        let loaded = ExecutionGraph::load(&mut bytes.as_slice(), &registry).unwrap();

        assert_eq!(loaded.node_count(), graph.node_count());
        assert_eq!(loaded.globals(), graph.globals());
        assert_eq!(sorted_kinds(&loaded), sorted_kinds(&graph));

        let edge_count = |g: &ExecutionGraph| -> usize {
            g.nodes().map(|entry| entry.outgoing().len()).sum()
        };
        assert_eq!(edge_count(&loaded), edge_count(&graph));
    }

    #[test]
    fn bad_magic_is_rejected() {
        let registry = builtin::native_module_registry();
        let graph = example_graph(&registry);

        let mut bytes = Vec::new();
        graph.save(&mut bytes).unwrap();
        bytes[0] = b'x';

        assert!(matches!(
            ExecutionGraph::load(&mut bytes.as_slice(), &registry),
            Err(LoadError::InvalidHeader)
        ));
    }

    #[test]
    fn version_mismatch_is_rejected() {
        let registry = builtin::native_module_registry();
        let graph = example_graph(&registry);

        let mut bytes = Vec::new();
        graph.save(&mut bytes).unwrap();
        bytes[4..8].copy_from_slice(&99u32.to_be_bytes());

        assert!(matches!(
            ExecutionGraph::load(&mut bytes.as_slice(), &registry),
            Err(LoadError::VersionMismatch {
                found: 99,
                expected: FORMAT_VERSION
            })
        ));
    }

    #[test]
    fn truncated_file_is_rejected() {
        let registry = builtin::native_module_registry();
        let graph = example_graph(&registry);

        let mut bytes = Vec::new();
        graph.save(&mut bytes).unwrap();
        bytes.truncate(bytes.len() - 3);

        assert!(matches!(
            ExecutionGraph::load(&mut bytes.as_slice(), &registry),
            Err(LoadError::Io(_))
        ));
    }
}
