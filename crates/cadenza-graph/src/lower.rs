//! Lowers a validated execution graph into a task graph.
//!
//! Every module call is visited in producer-before-consumer order (ties
//! broken by original node index, so builds are deterministic). Each
//! call's inputs are classified as constant, variable, or
//! branchless-variable; the first matching task mapping picks the
//! concrete task function, and branchless inputs wired to `unshared`
//! task arguments reuse the producer's buffer in place instead of
//! allocating a fresh one.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use ahash::AHashMap;
use smallvec::SmallVec;

use cadenza_core::buffer::BufferKind;
use cadenza_core::native_module::{ConstantValue, ModuleQualifier, ValueKind};
use cadenza_core::registry::{NativeModuleRegistry, TaskFunctionRegistry};
use cadenza_core::task_function::{InputShape, TaskQualifier, TaskValue};

use crate::error::{CompileError, GraphError};
use crate::graph::{ExecutionGraph, NodeKind, NodeRef};
use crate::task_graph::{InputBinding, OutputBinding, TaskGraph, TaskNode};

pub(crate) fn lower(
    graph: &ExecutionGraph,
    modules: &NativeModuleRegistry,
    tasks: &TaskFunctionRegistry,
) -> Result<TaskGraph, CompileError> {
    let call_order = topological_call_order(graph);

    let mut buffer_kinds: Vec<BufferKind> = Vec::new();
    // Value-producing node (graph input or indexed output) -> virtual
    // buffer carrying its samples.
    let mut node_buffers: AHashMap<NodeRef, u32> = AHashMap::new();
    // Indexed output -> index of the task computing it.
    let mut producer_task: AHashMap<NodeRef, u32> = AHashMap::new();

    // Stream inputs get their buffers first; the executor fills them
    // before any task runs.
    let mut inputs: Vec<InputBinding> = Vec::new();
    let mut input_nodes: Vec<(u32, NodeRef)> = graph
        .nodes()
        .filter_map(|entry| match entry.kind {
            NodeKind::GraphInput(index) => Some((index, entry.id)),
            _ => None,
        })
        .collect();
    input_nodes.sort_unstable_by_key(|&(index, _)| index);

    for (index, node) in input_nodes {
        if graph.node(node).unwrap().outgoing().is_empty() {
            continue;
        }
        let buffer = buffer_kinds.len() as u32;
        buffer_kinds.push(BufferKind::Real);
        node_buffers.insert(node, buffer);
        inputs.push(InputBinding {
            input_index: index,
            buffer,
        });
    }

    let mut task_nodes: Vec<TaskNode> = Vec::with_capacity(call_order.len());

    for call in call_order {
        let task_index = task_nodes.len() as u32;
        let NodeKind::ModuleCall { module } = graph.node(call).unwrap().kind else {
            unreachable!("call order only contains module calls");
        };
        let descriptor = modules
            .get(module)
            .ok_or(CompileError::UnregisteredModule(module))?;
        let in_count = descriptor.in_arg_count();

        // Classify each input by its producer.
        let mut shapes: SmallVec<[InputShape; 8]> = SmallVec::new();
        let mut producers: SmallVec<[NodeRef; 8]> = SmallVec::new();
        for index in 0..in_count {
            let producer = graph.call_input_producer(call, index).ok_or_else(|| {
                GraphError::InvalidGraph(format!("call {call:?} input {index} is unconnected"))
            })?;

            let shape = match &graph.node(producer).unwrap().kind {
                NodeKind::Constant(_) => InputShape::Constant,
                _ => {
                    if graph.node(producer).unwrap().outgoing().len() == 1 {
                        InputShape::BranchlessVariable
                    } else {
                        InputShape::Variable
                    }
                }
            };

            shapes.push(shape);
            producers.push(producer);
        }

        let mapping = tasks
            .find_mapping(module, &shapes)
            .ok_or_else(|| CompileError::NoTaskMapping {
                module,
                shapes: shapes.to_vec(),
            })?;
        if mapping.arg_to_task_arg.len() != descriptor.args.len() {
            return Err(CompileError::IncorrectArgumentCount {
                module,
                expected: descriptor.args.len(),
                found: mapping.arg_to_task_arg.len(),
            });
        }
        let function = tasks
            .get(mapping.task)
            .ok_or(CompileError::UnregisteredTaskFunction(mapping.task))?;

        let mut args: Vec<Option<TaskValue>> = (0..function.args.len()).map(|_| None).collect();
        let mut predecessors: SmallVec<[u32; 8]> = SmallVec::new();

        // Bind input arguments first so in-place slots already carry
        // their buffer when the outputs are resolved.
        let mut input_ordinal = 0;
        for (position, arg) in descriptor.args.iter().enumerate() {
            if arg.qualifier == ModuleQualifier::Out {
                continue;
            }
            let producer = producers[input_ordinal];
            input_ordinal += 1;

            let slot = mapping.arg_to_task_arg[position] as usize;
            let value = match &graph.node(producer).unwrap().kind {
                NodeKind::Constant(ConstantValue::Real(value)) => TaskValue::RealConstant(*value),
                NodeKind::Constant(ConstantValue::Bool(value)) => TaskValue::BoolConstant(*value),
                NodeKind::Constant(ConstantValue::Str(value)) => {
                    TaskValue::StringConstant(value.clone())
                }
                _ => {
                    let buffer = node_buffers.get(&producer).copied().ok_or_else(|| {
                        GraphError::InvalidGraph(format!(
                            "producer {producer:?} has no buffer assignment"
                        ))
                    })?;
                    if let Some(&task) = producer_task.get(&producer) {
                        if !predecessors.contains(&task) {
                            predecessors.push(task);
                        }
                    }
                    match arg.kind {
                        ValueKind::Real => TaskValue::RealBuffer(buffer),
                        ValueKind::Bool => TaskValue::BoolBuffer(buffer),
                        ValueKind::Str => {
                            return Err(CompileError::Graph(GraphError::InvalidGraph(
                                "string signals cannot flow through buffers".to_string(),
                            )));
                        }
                    }
                }
            };
            args[slot] = Some(value);
        }

        // Resolve outputs: in-place slots reuse the input buffer already
        // bound to them, plain outputs get a fresh virtual buffer.
        let mut output_ordinal = 0;
        for (position, arg) in descriptor.args.iter().enumerate() {
            if arg.qualifier != ModuleQualifier::Out {
                continue;
            }
            let output_node = graph
                .call_indexed_output(call, output_ordinal)
                .expect("validated call has all outputs");
            output_ordinal += 1;

            let slot = mapping.arg_to_task_arg[position] as usize;
            let buffer = match function.args[slot].qualifier {
                TaskQualifier::InOut => args[slot]
                    .as_ref()
                    .and_then(TaskValue::buffer_index)
                    .ok_or_else(|| {
                        GraphError::InvalidGraph(format!(
                            "in-place slot {slot} of {} is not fed a buffer",
                            function.name
                        ))
                    })?,
                TaskQualifier::Out => {
                    let buffer = buffer_kinds.len() as u32;
                    buffer_kinds.push(match arg.kind {
                        ValueKind::Real => BufferKind::Real,
                        ValueKind::Bool => BufferKind::Bool,
                        ValueKind::Str => {
                            return Err(CompileError::Graph(GraphError::InvalidGraph(
                                "string signals cannot flow through buffers".to_string(),
                            )));
                        }
                    });
                    args[slot] = Some(match arg.kind {
                        ValueKind::Real => TaskValue::RealBuffer(buffer),
                        _ => TaskValue::BoolBuffer(buffer),
                    });
                    buffer
                }
                _ => {
                    return Err(CompileError::Graph(GraphError::InvalidGraph(format!(
                        "module output mapped to non-output slot {slot} of {}",
                        function.name
                    ))));
                }
            };

            node_buffers.insert(output_node, buffer);
            producer_task.insert(output_node, task_index);
        }

        let args = args
            .into_iter()
            .enumerate()
            .map(|(slot, value)| {
                value.ok_or_else(|| {
                    CompileError::Graph(GraphError::InvalidGraph(format!(
                        "argument slot {slot} of {} left unbound by mapping",
                        function.name
                    )))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        for &predecessor in predecessors.iter() {
            task_nodes[predecessor as usize].successors.push(task_index);
        }
        task_nodes.push(TaskNode {
            function: mapping.task,
            args,
            successors: Vec::new(),
            predecessor_count: predecessors.len() as u32,
        });
    }

    let initial_tasks: Vec<u32> = task_nodes
        .iter()
        .enumerate()
        .filter(|(_, task)| task.predecessor_count == 0)
        .map(|(index, _)| index as u32)
        .collect();

    let outputs = resolve_outputs(graph, &node_buffers)?;
    let buffer_usages = count_buffer_usages(&task_nodes, &outputs, buffer_kinds.len());

    Ok(TaskGraph::new(
        task_nodes,
        initial_tasks,
        inputs,
        outputs,
        buffer_kinds,
        buffer_usages,
        *graph.globals(),
    ))
}

/// Kahn's algorithm over the whole node graph, popping the smallest
/// original node index first so the emitted task order is deterministic.
fn topological_call_order(graph: &ExecutionGraph) -> Vec<NodeRef> {
    let mut in_degree: AHashMap<NodeRef, usize> = AHashMap::with_capacity(graph.node_count());
    let mut heap: BinaryHeap<Reverse<(u32, NodeRef)>> = BinaryHeap::new();

    for entry in graph.nodes() {
        in_degree.insert(entry.id, entry.incoming().len());
        if entry.incoming().is_empty() {
            heap.push(Reverse((entry.id.0.slot(), entry.id)));
        }
    }

    let mut order = Vec::new();
    while let Some(Reverse((_, node))) = heap.pop() {
        if matches!(graph.node(node).unwrap().kind, NodeKind::ModuleCall { .. }) {
            order.push(node);
        }

        for &next in graph.node(node).unwrap().outgoing() {
            let degree = in_degree.get_mut(&next).unwrap();
            *degree -= 1;
            if *degree == 0 {
                heap.push(Reverse((next.0.slot(), next)));
            }
        }
    }

    order
}

fn resolve_outputs(
    graph: &ExecutionGraph,
    node_buffers: &AHashMap<NodeRef, u32>,
) -> Result<Vec<OutputBinding>, CompileError> {
    let mut output_nodes: Vec<(u32, NodeRef)> = graph
        .nodes()
        .filter_map(|entry| match entry.kind {
            NodeKind::GraphOutput(index) => Some((index, entry.id)),
            _ => None,
        })
        .collect();
    output_nodes.sort_unstable_by_key(|&(index, _)| index);

    let channel_count = output_nodes
        .last()
        .map(|&(index, _)| index as usize + 1)
        .unwrap_or(0);
    // Unconnected channels render silence.
    let mut outputs = vec![OutputBinding::Constant(0.0); channel_count];

    for (index, node) in output_nodes {
        let producer = graph.node(node).unwrap().incoming()[0];
        let binding = match &graph.node(producer).unwrap().kind {
            NodeKind::Constant(ConstantValue::Real(value)) => OutputBinding::Constant(*value),
            NodeKind::Constant(_) => {
                return Err(CompileError::Graph(GraphError::InvalidGraph(format!(
                    "output {index} is fed a non-real constant"
                ))));
            }
            _ => {
                let buffer = node_buffers.get(&producer).copied().ok_or_else(|| {
                    GraphError::InvalidGraph(format!(
                        "output {index} producer has no buffer assignment"
                    ))
                })?;
                OutputBinding::Buffer(buffer)
            }
        };
        outputs[index as usize] = binding;
    }

    Ok(outputs)
}

fn count_buffer_usages(
    tasks: &[TaskNode],
    outputs: &[OutputBinding],
    buffer_count: usize,
) -> Vec<u32> {
    let mut usages = vec![0u32; buffer_count];

    for task in tasks {
        let mut seen: SmallVec<[u32; 8]> = SmallVec::new();
        for value in &task.args {
            if let Some(buffer) = value.buffer_index() {
                if !seen.contains(&buffer) {
                    seen.push(buffer);
                    usages[buffer as usize] += 1;
                }
            }
        }
    }

    for output in outputs {
        if let OutputBinding::Buffer(buffer) = output {
            usages[*buffer as usize] += 1;
        }
    }

    usages
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::builtin::{self, modules};

    fn registries() -> (NativeModuleRegistry, TaskFunctionRegistry) {
        (
            builtin::native_module_registry(),
            builtin::task_function_registry(),
        )
    }

    fn wire_input(graph: &mut ExecutionGraph, from: NodeRef, call: NodeRef, index: usize) {
        let input = graph.call_indexed_input(call, index).unwrap();
        graph.add_edge(from, input).unwrap();
    }

    fn output_of(graph: &ExecutionGraph, call: NodeRef) -> NodeRef {
        graph.call_indexed_output(call, 0).unwrap()
    }

    #[test]
    fn branchless_input_reuses_producer_buffer_in_place() {
        let (modules_reg, tasks_reg) = registries();
        let mut graph = ExecutionGraph::new();

        // out = sin(x): x is used once, so sin runs in place on x's
        // buffer.
        let x = graph.add_graph_input_node(0);
        let sin = graph
            .add_module_call_node(&modules_reg, modules::SIN)
            .unwrap();
        let out = graph.add_graph_output_node(0);
        wire_input(&mut graph, x, sin, 0);
        graph.add_edge(output_of(&graph, sin), out).unwrap();
        graph.validate(&modules_reg).unwrap();

        let task_graph = lower(&graph, &modules_reg, &tasks_reg).unwrap();

        assert_eq!(task_graph.task_count(), 1);
        // One input buffer, reused as the output: no second allocation.
        assert_eq!(task_graph.buffer_count(), 1);
        assert_eq!(task_graph.task(0).args, vec![TaskValue::RealBuffer(0)]);
        assert_eq!(task_graph.outputs(), &[OutputBinding::Buffer(0)]);
    }

    #[test]
    fn shared_producer_forces_fresh_output_buffer() {
        let (modules_reg, tasks_reg) = registries();
        let mut graph = ExecutionGraph::new();

        // out = x * x: both multiply inputs read the same producer, so
        // neither is branchless and the product gets its own buffer.
        let x = graph.add_graph_input_node(0);
        let mul = graph
            .add_module_call_node(&modules_reg, modules::MULTIPLY)
            .unwrap();
        let out = graph.add_graph_output_node(0);
        wire_input(&mut graph, x, mul, 0);
        wire_input(&mut graph, x, mul, 1);
        graph.add_edge(output_of(&graph, mul), out).unwrap();
        graph.validate(&modules_reg).unwrap();

        let task_graph = lower(&graph, &modules_reg, &tasks_reg).unwrap();

        assert_eq!(task_graph.task_count(), 1);
        assert_eq!(task_graph.buffer_count(), 2);
        assert_eq!(
            task_graph.task(0).args,
            vec![
                TaskValue::RealBuffer(1),
                TaskValue::RealBuffer(0),
                TaskValue::RealBuffer(0),
            ]
        );
    }

    #[test]
    fn constant_input_selects_scalar_variant() {
        let (modules_reg, tasks_reg) = registries();
        let mut graph = ExecutionGraph::new();

        let x = graph.add_graph_input_node(0);
        let half = graph.add_constant_node(ConstantValue::Real(0.5));
        let mul = graph
            .add_module_call_node(&modules_reg, modules::MULTIPLY)
            .unwrap();
        let out = graph.add_graph_output_node(0);
        wire_input(&mut graph, x, mul, 0);
        wire_input(&mut graph, half, mul, 1);
        graph.add_edge(output_of(&graph, mul), out).unwrap();
        graph.validate(&modules_reg).unwrap();

        let task_graph = lower(&graph, &modules_reg, &tasks_reg).unwrap();

        // Branchless input + scalar constant: in-place variant, single
        // buffer, constant inlined.
        assert_eq!(task_graph.buffer_count(), 1);
        assert_eq!(
            task_graph.task(0).args,
            vec![TaskValue::RealBuffer(0), TaskValue::RealConstant(0.5)]
        );
    }

    #[test]
    fn diamond_dependencies_and_counts() {
        let (modules_reg, tasks_reg) = registries();
        let mut graph = ExecutionGraph::new();

        // a = sin(x); b = sin(a); c = negate(a); out = b + c
        let x = graph.add_graph_input_node(0);
        let a = graph
            .add_module_call_node(&modules_reg, modules::SIN)
            .unwrap();
        let b = graph
            .add_module_call_node(&modules_reg, modules::SIN)
            .unwrap();
        let c = graph
            .add_module_call_node(&modules_reg, modules::NEGATE)
            .unwrap();
        let add = graph
            .add_module_call_node(&modules_reg, modules::ADD)
            .unwrap();
        let out = graph.add_graph_output_node(0);

        wire_input(&mut graph, x, a, 0);
        let a_out = output_of(&graph, a);
        wire_input(&mut graph, a_out, b, 0);
        wire_input(&mut graph, a_out, c, 0);
        let b_out = output_of(&graph, b);
        let c_out = output_of(&graph, c);
        wire_input(&mut graph, b_out, add, 0);
        wire_input(&mut graph, c_out, add, 1);
        graph.add_edge(output_of(&graph, add), out).unwrap();
        graph.validate(&modules_reg).unwrap();

        let task_graph = lower(&graph, &modules_reg, &tasks_reg).unwrap();

        assert_eq!(task_graph.task_count(), 4);
        // Tasks come out in topological order: a, b, c, add.
        assert_eq!(task_graph.initial_tasks(), &[0]);
        assert_eq!(task_graph.task(0).predecessor_count, 0);
        assert_eq!(task_graph.task(0).successors, vec![1, 2]);
        assert_eq!(task_graph.task(1).predecessor_count, 1);
        assert_eq!(task_graph.task(2).predecessor_count, 1);
        assert_eq!(task_graph.task(1).successors, vec![3]);
        assert_eq!(task_graph.task(2).successors, vec![3]);
        assert_eq!(task_graph.task(3).predecessor_count, 2);
        assert!(task_graph.task(3).successors.is_empty());
    }

    #[test]
    fn buffer_usage_counts_cover_tasks_and_outputs() {
        let (modules_reg, tasks_reg) = registries();
        let mut graph = ExecutionGraph::new();

        // a = sin(x); out = a * a
        let x = graph.add_graph_input_node(0);
        let sin = graph
            .add_module_call_node(&modules_reg, modules::SIN)
            .unwrap();
        let mul = graph
            .add_module_call_node(&modules_reg, modules::MULTIPLY)
            .unwrap();
        let out = graph.add_graph_output_node(0);

        wire_input(&mut graph, x, sin, 0);
        let sin_out = output_of(&graph, sin);
        wire_input(&mut graph, sin_out, mul, 0);
        wire_input(&mut graph, sin_out, mul, 1);
        graph.add_edge(output_of(&graph, mul), out).unwrap();
        graph.validate(&modules_reg).unwrap();

        let task_graph = lower(&graph, &modules_reg, &tasks_reg).unwrap();

        // Buffer 0 (input, sin in place): used by sin and by multiply.
        assert_eq!(task_graph.buffer_usage(0), 2);
        // Buffer 1 (product): used by multiply and the output copy.
        assert_eq!(task_graph.buffer_usage(1), 2);
    }

    #[test]
    fn missing_mapping_is_reported() {
        let (modules_reg, _) = registries();
        let empty_tasks = TaskFunctionRegistry::new();
        let mut graph = ExecutionGraph::new();

        let x = graph.add_graph_input_node(0);
        let sin = graph
            .add_module_call_node(&modules_reg, modules::SIN)
            .unwrap();
        let out = graph.add_graph_output_node(0);
        wire_input(&mut graph, x, sin, 0);
        graph.add_edge(output_of(&graph, sin), out).unwrap();

        assert!(matches!(
            lower(&graph, &modules_reg, &empty_tasks),
            Err(CompileError::NoTaskMapping { .. })
        ));
    }
}
