//! Pattern-based algebraic simplification of execution graphs.
//!
//! A rule rewrites a source pattern into a target pattern over node
//! symbols. Patterns are prefix module-call trees: `Module` opens a
//! call, its operand symbols follow, and `End` closes it. A match binds
//! `Variable`/`Const` symbols positionally to concrete producer nodes;
//! value symbols must match the stored constant bit-for-bit, since
//! constants are compile-time-folded values, never measured signals.
//!
//! The engine alternates constant folding with rule application until a
//! fixed point, bounded by a pass budget.

use cadenza_core::native_module::{ConstantValue, NativeModuleUid};
use cadenza_core::registry::NativeModuleRegistry;

use crate::error::CompileError;
use crate::graph::{ExecutionGraph, NodeKind, NodeRef};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PatternSymbol {
    /// Opens a module call; the call's operands follow, closed by `End`.
    Module(NativeModuleUid),
    /// Closes the operand list of the innermost open `Module`.
    End,
    /// Binds any producer node positionally.
    Variable(u8),
    /// Binds any constant node positionally.
    Const(u8),
    /// Matches a real constant with this exact bit pattern.
    RealValue(f32),
    /// Matches a bool constant with this value.
    BoolValue(bool),
}

#[derive(Debug, Clone)]
pub struct OptimizationRule {
    pub source: Vec<PatternSymbol>,
    pub target: Vec<PatternSymbol>,
}

/// The algebraic identities of the core module library.
pub fn builtin_rules() -> Vec<OptimizationRule> {
    use cadenza_core::builtin::modules::{ADD, AND, DIVIDE, MULTIPLY, NEGATE, NOT, OR, SUBTRACT};
    use PatternSymbol::{BoolValue as B, End as E, Module as M, RealValue as R, Variable as V};

    let rule = |source: Vec<PatternSymbol>, target: Vec<PatternSymbol>| OptimizationRule {
        source,
        target,
    };

    vec![
        // x * 0 -> 0, 0 * x -> 0
        rule(vec![M(MULTIPLY), V(0), R(0.0), E], vec![R(0.0)]),
        rule(vec![M(MULTIPLY), R(0.0), V(0), E], vec![R(0.0)]),
        // x * 1 -> x, 1 * x -> x
        rule(vec![M(MULTIPLY), V(0), R(1.0), E], vec![V(0)]),
        rule(vec![M(MULTIPLY), R(1.0), V(0), E], vec![V(0)]),
        // x + 0 -> x, 0 + x -> x
        rule(vec![M(ADD), V(0), R(0.0), E], vec![V(0)]),
        rule(vec![M(ADD), R(0.0), V(0), E], vec![V(0)]),
        // x - 0 -> x, 0 - x -> -x
        rule(vec![M(SUBTRACT), V(0), R(0.0), E], vec![V(0)]),
        rule(vec![M(SUBTRACT), R(0.0), V(0), E], vec![M(NEGATE), V(0), E]),
        // x / 1 -> x
        rule(vec![M(DIVIDE), V(0), R(1.0), E], vec![V(0)]),
        // --x -> x
        rule(vec![M(NEGATE), M(NEGATE), V(0), E, E], vec![V(0)]),
        // x && false -> false, x && true -> x (and mirrored)
        rule(vec![M(AND), V(0), B(false), E], vec![B(false)]),
        rule(vec![M(AND), B(false), V(0), E], vec![B(false)]),
        rule(vec![M(AND), V(0), B(true), E], vec![V(0)]),
        rule(vec![M(AND), B(true), V(0), E], vec![V(0)]),
        // x || true -> true, x || false -> x (and mirrored)
        rule(vec![M(OR), V(0), B(true), E], vec![B(true)]),
        rule(vec![M(OR), B(true), V(0), E], vec![B(true)]),
        rule(vec![M(OR), V(0), B(false), E], vec![V(0)]),
        rule(vec![M(OR), B(false), V(0), E], vec![V(0)]),
        // !!x -> x
        rule(vec![M(NOT), M(NOT), V(0), E, E], vec![V(0)]),
    ]
}

/// Runs constant folding plus the given rules to a fixed point. Returns
/// the number of passes taken; exceeding `max_passes` is reported as
/// [`CompileError::OptimizerDivergence`].
pub(crate) fn run(
    graph: &mut ExecutionGraph,
    registry: &NativeModuleRegistry,
    rules: &[OptimizationRule],
    max_passes: u32,
) -> Result<u32, CompileError> {
    for pass in 0..max_passes {
        let mut changed = fold_constants(graph, registry)?;

        let calls: Vec<NodeRef> = graph
            .nodes()
            .filter(|entry| matches!(entry.kind, NodeKind::ModuleCall { .. }))
            .map(|entry| entry.id)
            .collect();

        for call in calls {
            if !graph.contains(call) {
                continue;
            }
            for rule in rules {
                if try_apply_rule(graph, registry, call, rule)? {
                    changed = true;
                    break;
                }
            }
        }

        if !changed {
            return Ok(pass);
        }
    }

    Err(CompileError::OptimizerDivergence(max_passes))
}

/// Replaces every single-output module call whose inputs are all
/// constants with the result of its compile-time evaluator.
///
/// This is a correctness requirement, not just an optimization: several
/// task function families assume at least one non-constant input, so an
/// all-constant call has no lowering.
pub(crate) fn fold_constants(
    graph: &mut ExecutionGraph,
    registry: &NativeModuleRegistry,
) -> Result<bool, CompileError> {
    let mut changed = false;

    loop {
        let mut folded_this_round = false;

        let calls: Vec<NodeRef> = graph
            .nodes()
            .filter(|entry| matches!(entry.kind, NodeKind::ModuleCall { .. }))
            .map(|entry| entry.id)
            .collect();

        for call in calls {
            if !graph.contains(call) {
                continue;
            }
            if fold_call(graph, registry, call)? {
                folded_this_round = true;
                changed = true;
            }
        }

        if !folded_this_round {
            return Ok(changed);
        }
    }
}

fn fold_call(
    graph: &mut ExecutionGraph,
    registry: &NativeModuleRegistry,
    call: NodeRef,
) -> Result<bool, CompileError> {
    let NodeKind::ModuleCall { module } = graph.node(call).map(|n| n.kind.clone()).unwrap() else {
        return Ok(false);
    };
    let descriptor = registry
        .get(module)
        .ok_or(CompileError::UnregisteredModule(module))?;
    let Some(eval) = descriptor.compile_time_eval else {
        return Ok(false);
    };
    if descriptor.out_arg_count() != 1 {
        return Ok(false);
    }

    let in_count = descriptor.in_arg_count();
    let mut values = Vec::with_capacity(in_count);
    for index in 0..in_count {
        let producer = graph
            .call_input_producer(call, index)
            .expect("validated call has all inputs connected");
        match &graph.node(producer).unwrap().kind {
            NodeKind::Constant(value) => values.push(value.clone()),
            _ => return Ok(false),
        }
    }

    let result = eval(&values).map_err(|message| CompileError::ConstantFoldFailed {
        module,
        message,
    })?;

    let folded = graph.add_constant_node(result);
    let output = graph
        .call_indexed_output(call, 0)
        .expect("single-output call");
    replace_producer(graph, output, folded)?;

    Ok(true)
}

/// Rewires every consumer of `from` onto `to`, then sweeps whatever the
/// rewrite left dead. A temporary-reference anchor keeps `to` alive
/// through the sweep even when `from` had no consumers to inherit.
fn replace_producer(
    graph: &mut ExecutionGraph,
    from: NodeRef,
    to: NodeRef,
) -> Result<(), CompileError> {
    let guard = graph.insert_raw(NodeKind::TemporaryReference);
    graph.add_edge(to, guard).map_err(CompileError::Graph)?;

    transfer_consumers(graph, from, to)?;
    cascade_remove(graph, vec![from]);

    graph
        .remove_node(guard, |_| {})
        .map_err(CompileError::Graph)?;
    cascade_remove(graph, vec![to]);

    Ok(())
}

/// Moves every outgoing edge of `from` to originate at `to` instead.
fn transfer_consumers(
    graph: &mut ExecutionGraph,
    from: NodeRef,
    to: NodeRef,
) -> Result<(), CompileError> {
    let consumers = graph.node(from).unwrap().outgoing().to_vec();
    for consumer in consumers {
        graph.remove_edge(from, consumer).map_err(CompileError::Graph)?;
        graph.add_edge(to, consumer).map_err(CompileError::Graph)?;
    }
    Ok(())
}

/// Removes producer nodes that have lost their last consumer, cascading
/// upward through whole module calls. Graph inputs and outputs are never
/// removed here; `compact` owns those.
fn cascade_remove(graph: &mut ExecutionGraph, mut pending: Vec<NodeRef>) {
    while let Some(node) = pending.pop() {
        if !graph.contains(node) {
            continue;
        }

        match &graph.node(node).unwrap().kind {
            NodeKind::Constant(_) => {
                if graph.node(node).unwrap().outgoing().is_empty() {
                    graph.remove_node(node, |_| {}).unwrap();
                }
            }
            NodeKind::IndexedOutput(_) => {
                if !graph.node(node).unwrap().outgoing().is_empty() {
                    continue;
                }
                let call = graph.node(node).unwrap().incoming()[0];
                if call_is_dead(graph, call) {
                    remove_call(graph, call, &mut pending);
                }
            }
            _ => {}
        }
    }
}

/// A call is dead once none of its outputs has a consumer.
fn call_is_dead(graph: &ExecutionGraph, call: NodeRef) -> bool {
    graph
        .node(call)
        .unwrap()
        .outgoing()
        .iter()
        .all(|&output| graph.node(output).unwrap().outgoing().is_empty())
}

fn remove_call(graph: &mut ExecutionGraph, call: NodeRef, check_later: &mut Vec<NodeRef>) {
    for output in graph.node(call).unwrap().outgoing().to_vec() {
        graph.remove_node(output, |_| {}).unwrap();
    }
    for input in graph.node(call).unwrap().incoming().to_vec() {
        if let Some(&producer) = graph.node(input).unwrap().incoming().first() {
            check_later.push(producer);
        }
        graph.remove_node(input, |_| {}).unwrap();
    }
    graph.remove_node(call, |_| {}).unwrap();
}

const MAX_PATTERN_BINDINGS: usize = 4;

#[derive(Default)]
struct Bindings {
    vars: [Option<NodeRef>; MAX_PATTERN_BINDINGS],
    consts: [Option<NodeRef>; MAX_PATTERN_BINDINGS],
}

enum WorkItem {
    Node(NodeRef),
    End,
}

fn try_apply_rule(
    graph: &mut ExecutionGraph,
    registry: &NativeModuleRegistry,
    call: NodeRef,
    rule: &OptimizationRule,
) -> Result<bool, CompileError> {
    let Some(bindings) = match_source(graph, call, &rule.source) else {
        return Ok(false);
    };

    let replacement = build_target(graph, registry, &bindings, &rule.target)?;

    let root_output = graph
        .call_indexed_output(call, 0)
        .expect("matched call has one output");
    replace_producer(graph, root_output, replacement)?;

    Ok(true)
}

/// Stack-based preorder match of `source` against the subtree rooted at
/// `call`. Returns positional bindings on success.
fn match_source(
    graph: &ExecutionGraph,
    call: NodeRef,
    source: &[PatternSymbol],
) -> Option<Bindings> {
    let PatternSymbol::Module(root_module) = source.first()? else {
        return None;
    };
    let NodeKind::ModuleCall { module } = graph.node(call)?.kind else {
        return None;
    };
    if module != *root_module {
        return None;
    }

    let mut bindings = Bindings::default();
    let mut work: Vec<WorkItem> = Vec::new();
    push_call_operands(graph, call, &mut work)?;

    for symbol in &source[1..] {
        match symbol {
            PatternSymbol::Module(uid) => {
                let Some(WorkItem::Node(node)) = work.pop() else {
                    return None;
                };
                let NodeKind::IndexedOutput(0) = graph.node(node)?.kind else {
                    return None;
                };
                let inner = *graph.node(node)?.incoming().first()?;
                let NodeKind::ModuleCall { module } = graph.node(inner)?.kind else {
                    return None;
                };
                if module != *uid {
                    return None;
                }
                push_call_operands(graph, inner, &mut work)?;
            }
            PatternSymbol::End => {
                let Some(WorkItem::End) = work.pop() else {
                    return None;
                };
            }
            PatternSymbol::Variable(index) => {
                let Some(WorkItem::Node(node)) = work.pop() else {
                    return None;
                };
                bindings.vars[*index as usize] = Some(node);
            }
            PatternSymbol::Const(index) => {
                let Some(WorkItem::Node(node)) = work.pop() else {
                    return None;
                };
                if !matches!(graph.node(node)?.kind, NodeKind::Constant(_)) {
                    return None;
                }
                bindings.consts[*index as usize] = Some(node);
            }
            PatternSymbol::RealValue(expected) => {
                let Some(WorkItem::Node(node)) = work.pop() else {
                    return None;
                };
                let NodeKind::Constant(ConstantValue::Real(value)) = graph.node(node)?.kind
                else {
                    return None;
                };
                if value.to_bits() != expected.to_bits() {
                    return None;
                }
            }
            PatternSymbol::BoolValue(expected) => {
                let Some(WorkItem::Node(node)) = work.pop() else {
                    return None;
                };
                let NodeKind::Constant(ConstantValue::Bool(value)) = graph.node(node)?.kind
                else {
                    return None;
                };
                if value != *expected {
                    return None;
                }
            }
        }
    }

    work.is_empty().then_some(bindings)
}

/// Queues a call's operand producers so they pop in argument order,
/// followed by the end marker.
fn push_call_operands(
    graph: &ExecutionGraph,
    call: NodeRef,
    work: &mut Vec<WorkItem>,
) -> Option<()> {
    work.push(WorkItem::End);
    let in_count = graph.node(call)?.incoming().len();
    for index in (0..in_count).rev() {
        work.push(WorkItem::Node(graph.call_input_producer(call, index)?));
    }
    Some(())
}

/// Materializes the target pattern bottom-up, returning the producer
/// node of the replacement value.
fn build_target(
    graph: &mut ExecutionGraph,
    registry: &NativeModuleRegistry,
    bindings: &Bindings,
    target: &[PatternSymbol],
) -> Result<NodeRef, CompileError> {
    struct Frame {
        module: NativeModuleUid,
        args: Vec<NodeRef>,
    }

    let mut frames: Vec<Frame> = Vec::new();
    let mut result: Option<NodeRef> = None;

    let attach = |frames: &mut Vec<Frame>, result: &mut Option<NodeRef>, value: NodeRef| {
        if let Some(frame) = frames.last_mut() {
            frame.args.push(value);
        } else {
            debug_assert!(result.is_none(), "rule target produces multiple roots");
            *result = Some(value);
        }
    };

    for symbol in target {
        match symbol {
            PatternSymbol::Module(uid) => frames.push(Frame {
                module: *uid,
                args: Vec::new(),
            }),
            PatternSymbol::End => {
                let frame = frames.pop().expect("unbalanced rule target");
                let call = graph
                    .add_module_call_node(registry, frame.module)
                    .map_err(CompileError::Graph)?;
                for (index, &arg) in frame.args.iter().enumerate() {
                    let input = graph
                        .call_indexed_input(call, index)
                        .expect("rule target arity matches module");
                    graph.add_edge(arg, input).map_err(CompileError::Graph)?;
                }
                let output = graph
                    .call_indexed_output(call, 0)
                    .expect("rule target uses single-output modules");
                attach(&mut frames, &mut result, output);
            }
            PatternSymbol::Variable(index) => {
                let node = bindings.vars[*index as usize].expect("unbound rule variable");
                attach(&mut frames, &mut result, node);
            }
            PatternSymbol::Const(index) => {
                let node = bindings.consts[*index as usize].expect("unbound rule constant");
                attach(&mut frames, &mut result, node);
            }
            PatternSymbol::RealValue(value) => {
                let node = graph.add_constant_node(ConstantValue::Real(*value));
                attach(&mut frames, &mut result, node);
            }
            PatternSymbol::BoolValue(value) => {
                let node = graph.add_constant_node(ConstantValue::Bool(*value));
                attach(&mut frames, &mut result, node);
            }
        }
    }

    Ok(result.expect("empty rule target"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::builtin::{self, modules};
    use cadenza_core::registry::NativeModuleRegistry;

    fn registry() -> NativeModuleRegistry {
        builtin::native_module_registry()
    }

    /// input -> call(input, constant) -> output; returns (graph, output).
    fn binary_with_constant(
        registry: &NativeModuleRegistry,
        module: cadenza_core::native_module::NativeModuleUid,
        constant: f32,
        constant_first: bool,
    ) -> (ExecutionGraph, NodeRef) {
        let mut graph = ExecutionGraph::new();

        let input = graph.add_graph_input_node(0);
        let constant = graph.add_constant_node(ConstantValue::Real(constant));
        let call = graph.add_module_call_node(registry, module).unwrap();
        let output = graph.add_graph_output_node(0);

        let (first, second) = if constant_first {
            (constant, input)
        } else {
            (input, constant)
        };
        graph
            .add_edge(first, graph.call_indexed_input(call, 0).unwrap())
            .unwrap();
        graph
            .add_edge(second, graph.call_indexed_input(call, 1).unwrap())
            .unwrap();
        graph
            .add_edge(graph.call_indexed_output(call, 0).unwrap(), output)
            .unwrap();

        (graph, output)
    }

    fn output_producer_kind(graph: &ExecutionGraph, output: NodeRef) -> NodeKind {
        let producer = graph.node(output).unwrap().incoming()[0];
        graph.node(producer).unwrap().kind.clone()
    }

    fn call_count(graph: &ExecutionGraph) -> usize {
        graph
            .nodes()
            .filter(|entry| matches!(entry.kind, NodeKind::ModuleCall { .. }))
            .count()
    }

    #[test]
    fn multiply_by_zero_collapses_to_constant_zero() {
        let registry = registry();
        let (mut graph, output) =
            binary_with_constant(&registry, modules::MULTIPLY, 0.0, false);

        run(&mut graph, &registry, &builtin_rules(), 64).unwrap();

        assert_eq!(
            output_producer_kind(&graph, output),
            NodeKind::Constant(ConstantValue::Real(0.0))
        );
        assert_eq!(call_count(&graph), 0);
        graph.compact();
        graph.validate(&registry).unwrap();
    }

    #[test]
    fn multiply_by_one_is_identity() {
        let registry = registry();
        let (mut graph, output) = binary_with_constant(&registry, modules::MULTIPLY, 1.0, true);

        run(&mut graph, &registry, &builtin_rules(), 64).unwrap();

        assert!(matches!(
            output_producer_kind(&graph, output),
            NodeKind::GraphInput(0)
        ));
        assert_eq!(call_count(&graph), 0);
    }

    #[test]
    fn zero_minus_x_becomes_negate() {
        let registry = registry();
        let (mut graph, output) = binary_with_constant(&registry, modules::SUBTRACT, 0.0, true);

        run(&mut graph, &registry, &builtin_rules(), 64).unwrap();

        let NodeKind::IndexedOutput(0) = output_producer_kind(&graph, output) else {
            panic!("expected a module output feeding the graph output");
        };
        let producer = graph.node(output).unwrap().incoming()[0];
        let call = graph.node(producer).unwrap().incoming()[0];
        assert_eq!(
            graph.node(call).unwrap().kind,
            NodeKind::ModuleCall {
                module: modules::NEGATE
            }
        );
    }

    #[test]
    fn all_constant_subtree_folds_recursively() {
        let registry = registry();
        let mut graph = ExecutionGraph::new();

        // sin(0.25 + 0.25) -> constant sin(0.5)
        let a = graph.add_constant_node(ConstantValue::Real(0.25));
        let b = graph.add_constant_node(ConstantValue::Real(0.25));
        let add = graph
            .add_module_call_node(&registry, modules::ADD)
            .unwrap();
        let sin = graph.add_module_call_node(&registry, modules::SIN).unwrap();
        let output = graph.add_graph_output_node(0);

        graph
            .add_edge(a, graph.call_indexed_input(add, 0).unwrap())
            .unwrap();
        graph
            .add_edge(b, graph.call_indexed_input(add, 1).unwrap())
            .unwrap();
        graph
            .add_edge(
                graph.call_indexed_output(add, 0).unwrap(),
                graph.call_indexed_input(sin, 0).unwrap(),
            )
            .unwrap();
        graph
            .add_edge(graph.call_indexed_output(sin, 0).unwrap(), output)
            .unwrap();

        run(&mut graph, &registry, &builtin_rules(), 64).unwrap();

        match output_producer_kind(&graph, output) {
            NodeKind::Constant(ConstantValue::Real(value)) => {
                assert!((value - 0.5f32.sin()).abs() < 1e-6);
            }
            other => panic!("expected folded constant, got {other:?}"),
        }
        assert_eq!(call_count(&graph), 0);
    }

    #[test]
    fn chained_identities_reach_fixed_point() {
        let registry = registry();
        let mut graph = ExecutionGraph::new();

        // ((x * 1) + 0) -> x
        let input = graph.add_graph_input_node(0);
        let one = graph.add_constant_node(ConstantValue::Real(1.0));
        let zero = graph.add_constant_node(ConstantValue::Real(0.0));
        let mul = graph
            .add_module_call_node(&registry, modules::MULTIPLY)
            .unwrap();
        let add = graph.add_module_call_node(&registry, modules::ADD).unwrap();
        let output = graph.add_graph_output_node(0);

        graph
            .add_edge(input, graph.call_indexed_input(mul, 0).unwrap())
            .unwrap();
        graph
            .add_edge(one, graph.call_indexed_input(mul, 1).unwrap())
            .unwrap();
        graph
            .add_edge(
                graph.call_indexed_output(mul, 0).unwrap(),
                graph.call_indexed_input(add, 0).unwrap(),
            )
            .unwrap();
        graph
            .add_edge(zero, graph.call_indexed_input(add, 1).unwrap())
            .unwrap();
        graph
            .add_edge(graph.call_indexed_output(add, 0).unwrap(), output)
            .unwrap();

        run(&mut graph, &registry, &builtin_rules(), 64).unwrap();

        assert!(matches!(
            output_producer_kind(&graph, output),
            NodeKind::GraphInput(0)
        ));
        assert_eq!(call_count(&graph), 0);
    }

    #[test]
    fn non_converging_rules_are_reported() {
        let registry = registry();
        let mut graph = ExecutionGraph::new();

        let x = graph.add_graph_input_node(0);
        let y = graph.add_graph_input_node(1);
        let add = graph.add_module_call_node(&registry, modules::ADD).unwrap();
        let output = graph.add_graph_output_node(0);

        graph
            .add_edge(x, graph.call_indexed_input(add, 0).unwrap())
            .unwrap();
        graph
            .add_edge(y, graph.call_indexed_input(add, 1).unwrap())
            .unwrap();
        graph
            .add_edge(graph.call_indexed_output(add, 0).unwrap(), output)
            .unwrap();

        // A commutation "identity" that keeps firing forever.
        use PatternSymbol::{End as E, Module as M, Variable as V};
        let swap = OptimizationRule {
            source: vec![M(modules::ADD), V(0), V(1), E],
            target: vec![M(modules::ADD), V(1), V(0), E],
        };

        assert!(matches!(
            run(&mut graph, &registry, &[swap], 8),
            Err(CompileError::OptimizerDivergence(8))
        ));
    }
}
