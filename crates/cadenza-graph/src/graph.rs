//! The execution graph: a mutable DAG of typed nodes produced by
//! compiling a program, prior to task-level lowering.
//!
//! A module call node never connects directly to its producers and
//! consumers. Each call owns one `IndexedInput` child per input argument
//! and one `IndexedOutput` child per output argument; the true producer
//! connects to the `IndexedInput`, and consumers connect from the
//! `IndexedOutput`. The indirection lets the Nth argument of a call be
//! located without scanning unrelated edges.

use std::fmt::Debug;

use ahash::{AHashMap, AHashSet};
use smallvec::SmallVec;
use thunderdome::Arena;

use cadenza_core::native_module::{
    ConstantValue, ModuleQualifier, NativeModuleUid, ValueKind,
};
use cadenza_core::registry::NativeModuleRegistry;
use cadenza_core::GraphGlobals;

use crate::error::GraphError;

/// A stable reference to a node in the graph.
///
/// The underlying arena index carries a generation counter, so a
/// reference left dangling by `remove_node` can never alias a node that
/// later reuses the same slot — lookups through a stale reference fail
/// instead.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeRef(pub(crate) thunderdome::Index);

impl Debug for NodeRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "node-{}-{}", self.0.slot(), self.0.generation())
    }
}

/// The kind of a node, together with its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// A compile-time constant. Never has incoming edges.
    Constant(ConstantValue),
    /// A native module call. Connects only to its indexed children.
    ModuleCall { module: NativeModuleUid },
    /// The `index`th input argument of a module call.
    IndexedInput(u32),
    /// The `index`th output argument of a module call.
    IndexedOutput(u32),
    /// An input channel delivered by the stream, filled once per block.
    GraphInput(u32),
    /// An output channel consumed by the stream. Takes exactly one input.
    GraphOutput(u32),
    /// An optimizer-internal anchor that keeps a freshly built
    /// replacement subtree alive while edges are rewired. Never survives
    /// into a validated graph.
    TemporaryReference,
}

pub struct NodeEntry {
    pub id: NodeRef,
    pub kind: NodeKind,
    incoming: SmallVec<[NodeRef; 4]>,
    outgoing: SmallVec<[NodeRef; 4]>,
}

impl NodeEntry {
    fn new(kind: NodeKind) -> Self {
        Self {
            id: NodeRef(thunderdome::Index::DANGLING),
            kind,
            incoming: SmallVec::new(),
            outgoing: SmallVec::new(),
        }
    }

    /// The edges arriving at this node, in insertion order.
    pub fn incoming(&self) -> &[NodeRef] {
        &self.incoming
    }

    /// The edges leaving this node, in insertion order.
    pub fn outgoing(&self) -> &[NodeRef] {
        &self.outgoing
    }
}

impl Clone for NodeEntry {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind.clone(),
            incoming: self.incoming.clone(),
            outgoing: self.outgoing.clone(),
        }
    }
}

#[derive(Clone, Default)]
pub struct ExecutionGraph {
    nodes: Arena<NodeEntry>,
    globals: GraphGlobals,
}

impl ExecutionGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn globals(&self) -> &GraphGlobals {
        &self.globals
    }

    pub fn set_globals(&mut self, globals: GraphGlobals) {
        self.globals = globals;
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn contains(&self, node: NodeRef) -> bool {
        self.nodes.contains(node.0)
    }

    pub fn node(&self, node: NodeRef) -> Option<&NodeEntry> {
        self.nodes.get(node.0)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.iter().map(|(_, entry)| entry)
    }

    fn insert(&mut self, kind: NodeKind) -> NodeRef {
        let id = NodeRef(self.nodes.insert(NodeEntry::new(kind)));
        self.nodes[id.0].id = id;
        id
    }

    /// Inserts a bare node without companion children or edges. Used by
    /// the loader, which replays the edge records afterwards.
    pub(crate) fn insert_raw(&mut self, kind: NodeKind) -> NodeRef {
        self.insert(kind)
    }

    pub fn add_constant_node(&mut self, value: ConstantValue) -> NodeRef {
        self.insert(NodeKind::Constant(value))
    }

    pub fn add_graph_input_node(&mut self, input_index: u32) -> NodeRef {
        self.insert(NodeKind::GraphInput(input_index))
    }

    pub fn add_graph_output_node(&mut self, output_index: u32) -> NodeRef {
        self.insert(NodeKind::GraphOutput(output_index))
    }

    /// Adds a module call node along with its indexed input/output
    /// children, pre-wired in argument order.
    pub fn add_module_call_node(
        &mut self,
        registry: &NativeModuleRegistry,
        module: NativeModuleUid,
    ) -> Result<NodeRef, GraphError> {
        let descriptor = registry
            .get(module)
            .ok_or(GraphError::UnregisteredModule(module))?;
        let in_count = descriptor.in_arg_count();
        let out_count = descriptor.out_arg_count();

        let call = self.insert(NodeKind::ModuleCall { module });

        for index in 0..in_count as u32 {
            let input = self.insert(NodeKind::IndexedInput(index));
            self.add_edge_internal(input, call);
        }
        for index in 0..out_count as u32 {
            let output = self.insert(NodeKind::IndexedOutput(index));
            self.add_edge_internal(call, output);
        }

        Ok(call)
    }

    /// The `IndexedInput` child bound to the call's `index`th input.
    pub fn call_indexed_input(&self, call: NodeRef, index: usize) -> Option<NodeRef> {
        let entry = self.node(call)?;
        debug_assert!(matches!(entry.kind, NodeKind::ModuleCall { .. }));
        entry.incoming.get(index).copied()
    }

    /// The `IndexedOutput` child bound to the call's `index`th output.
    pub fn call_indexed_output(&self, call: NodeRef, index: usize) -> Option<NodeRef> {
        let entry = self.node(call)?;
        debug_assert!(matches!(entry.kind, NodeKind::ModuleCall { .. }));
        entry.outgoing.get(index).copied()
    }

    /// The node producing the call's `index`th input value, reached
    /// through the `IndexedInput` indirection.
    pub fn call_input_producer(&self, call: NodeRef, index: usize) -> Option<NodeRef> {
        let input = self.call_indexed_input(call, index)?;
        self.node(input)?.incoming.first().copied()
    }

    /// Adds an edge from `from` to `to`, mutating both endpoints' edge
    /// lists. Self-loops and duplicate edges are illegal.
    pub fn add_edge(&mut self, from: NodeRef, to: NodeRef) -> Result<(), GraphError> {
        if !self.contains(from) || !self.contains(to) {
            return Err(GraphError::InvalidNode);
        }
        if from == to {
            return Err(GraphError::InvalidEdge("self loop"));
        }
        if self.nodes[from.0].outgoing.contains(&to) {
            return Err(GraphError::InvalidEdge("edge already exists"));
        }

        self.add_edge_internal(from, to);
        Ok(())
    }

    fn add_edge_internal(&mut self, from: NodeRef, to: NodeRef) {
        self.nodes[from.0].outgoing.push(to);
        self.nodes[to.0].incoming.push(from);
    }

    /// Removes the edge from `from` to `to`. The edge must exist.
    pub fn remove_edge(&mut self, from: NodeRef, to: NodeRef) -> Result<(), GraphError> {
        if !self.contains(from) || !self.contains(to) {
            return Err(GraphError::InvalidNode);
        }

        let out_pos = self.nodes[from.0]
            .outgoing
            .iter()
            .position(|&n| n == to)
            .ok_or(GraphError::InvalidEdge("edge does not exist"))?;
        let in_pos = self.nodes[to.0]
            .incoming
            .iter()
            .position(|&n| n == from)
            .ok_or(GraphError::InvalidEdge("edge does not exist"))?;

        self.nodes[from.0].outgoing.remove(out_pos);
        self.nodes[to.0].incoming.remove(in_pos);
        Ok(())
    }

    /// Detaches all edges of `node` and removes it, invalidating its
    /// reference. `on_detached` is invoked once per surviving neighbor so
    /// the caller can cascade removals when a producer loses its last
    /// consumer.
    pub fn remove_node(
        &mut self,
        node: NodeRef,
        mut on_detached: impl FnMut(NodeRef),
    ) -> Result<(), GraphError> {
        if !self.contains(node) {
            return Err(GraphError::InvalidNode);
        }

        let incoming = std::mem::take(&mut self.nodes[node.0].incoming);
        let outgoing = std::mem::take(&mut self.nodes[node.0].outgoing);

        for from in incoming {
            let out = &mut self.nodes[from.0].outgoing;
            if let Some(pos) = out.iter().position(|&n| n == node) {
                out.remove(pos);
            }
            on_detached(from);
        }
        for to in outgoing {
            let inc = &mut self.nodes[to.0].incoming;
            if let Some(pos) = inc.iter().position(|&n| n == node) {
                inc.remove(pos);
            }
            on_detached(to);
        }

        self.nodes.remove(node.0);
        Ok(())
    }

    /// Checks every structural invariant: per-kind edge arity, argument
    /// kinds against the module registry, edge symmetry, unique stream
    /// channel indices, and acyclicity.
    pub fn validate(&self, registry: &NativeModuleRegistry) -> Result<(), GraphError> {
        let mut input_indices = AHashSet::new();
        let mut output_indices = AHashSet::new();

        for entry in self.nodes() {
            self.validate_edge_symmetry(entry)?;

            match &entry.kind {
                NodeKind::Constant(_) => {
                    if !entry.incoming.is_empty() {
                        return Err(GraphError::InvalidGraph(format!(
                            "constant {:?} has incoming edges",
                            entry.id
                        )));
                    }
                }
                NodeKind::ModuleCall { module } => {
                    self.validate_module_call(registry, entry, *module)?;
                }
                NodeKind::IndexedInput(_) => {
                    if entry.incoming.len() != 1 {
                        return Err(GraphError::InvalidGraph(format!(
                            "indexed input {:?} has {} producers",
                            entry.id,
                            entry.incoming.len()
                        )));
                    }
                    if entry.outgoing.len() != 1
                        || !matches!(
                            self.node(entry.outgoing[0]).map(|n| &n.kind),
                            Some(NodeKind::ModuleCall { .. })
                        )
                    {
                        return Err(GraphError::InvalidGraph(format!(
                            "indexed input {:?} is not bound to a single module call",
                            entry.id
                        )));
                    }
                }
                NodeKind::IndexedOutput(_) => {
                    if entry.incoming.len() != 1
                        || !matches!(
                            self.node(entry.incoming[0]).map(|n| &n.kind),
                            Some(NodeKind::ModuleCall { .. })
                        )
                    {
                        return Err(GraphError::InvalidGraph(format!(
                            "indexed output {:?} is not bound to a single module call",
                            entry.id
                        )));
                    }
                }
                NodeKind::GraphInput(index) => {
                    if !entry.incoming.is_empty() {
                        return Err(GraphError::InvalidGraph(format!(
                            "graph input {index} has incoming edges"
                        )));
                    }
                    if !input_indices.insert(*index) {
                        return Err(GraphError::InvalidGraph(format!(
                            "duplicate graph input index {index}"
                        )));
                    }
                }
                NodeKind::TemporaryReference => {
                    return Err(GraphError::InvalidGraph(format!(
                        "temporary reference {:?} left behind by a rewrite",
                        entry.id
                    )));
                }
                NodeKind::GraphOutput(index) => {
                    if entry.incoming.len() != 1 {
                        return Err(GraphError::InvalidGraph(format!(
                            "graph output {index} has {} producers, expected 1",
                            entry.incoming.len()
                        )));
                    }
                    if !entry.outgoing.is_empty() {
                        return Err(GraphError::InvalidGraph(format!(
                            "graph output {index} has outgoing edges"
                        )));
                    }
                    if self.value_kind_of(entry.incoming[0], registry) != Some(ValueKind::Real) {
                        return Err(GraphError::InvalidGraph(format!(
                            "graph output {index} is not fed a real signal"
                        )));
                    }
                    if !output_indices.insert(*index) {
                        return Err(GraphError::InvalidGraph(format!(
                            "duplicate graph output index {index}"
                        )));
                    }
                }
            }
        }

        self.cycle_check()
    }

    fn validate_edge_symmetry(&self, entry: &NodeEntry) -> Result<(), GraphError> {
        for &to in entry.outgoing.iter() {
            let valid = self
                .node(to)
                .is_some_and(|n| n.incoming.iter().any(|&from| from == entry.id));
            if !valid {
                return Err(GraphError::InvalidGraph(format!(
                    "edge {:?} -> {to:?} is not mirrored",
                    entry.id
                )));
            }
        }
        for &from in entry.incoming.iter() {
            let valid = self
                .node(from)
                .is_some_and(|n| n.outgoing.iter().any(|&to| to == entry.id));
            if !valid {
                return Err(GraphError::InvalidGraph(format!(
                    "edge {from:?} -> {:?} is not mirrored",
                    entry.id
                )));
            }
        }
        Ok(())
    }

    fn validate_module_call(
        &self,
        registry: &NativeModuleRegistry,
        entry: &NodeEntry,
        module: NativeModuleUid,
    ) -> Result<(), GraphError> {
        let descriptor = registry
            .get(module)
            .ok_or(GraphError::UnregisteredModule(module))?;

        if entry.incoming.len() != descriptor.in_arg_count()
            || entry.outgoing.len() != descriptor.out_arg_count()
        {
            return Err(GraphError::InvalidGraph(format!(
                "call {:?} of {} has {}/{} edges, expected {}/{}",
                entry.id,
                descriptor.name,
                entry.incoming.len(),
                entry.outgoing.len(),
                descriptor.in_arg_count(),
                descriptor.out_arg_count(),
            )));
        }

        for (position, &child) in entry.incoming.iter().enumerate() {
            let Some(NodeKind::IndexedInput(index)) = self.node(child).map(|n| &n.kind) else {
                return Err(GraphError::InvalidGraph(format!(
                    "call {:?} input {position} is not an indexed input",
                    entry.id
                )));
            };
            if *index as usize != position {
                return Err(GraphError::InvalidGraph(format!(
                    "call {:?} input {position} is bound out of order",
                    entry.id
                )));
            }

            // The producer's value kind must match the declared argument.
            let arg = descriptor.args[descriptor.in_arg_index(position)];
            let producer = self.node(child).and_then(|n| n.incoming.first().copied());
            let Some(producer) = producer else {
                return Err(GraphError::InvalidGraph(format!(
                    "call {:?} input {position} is unconnected",
                    entry.id
                )));
            };
            match self.value_kind_of(producer, registry) {
                Some(kind) if kind == arg.kind => {}
                _ => {
                    return Err(GraphError::InvalidGraph(format!(
                        "call {:?} input {position} kind mismatch",
                        entry.id
                    )));
                }
            }
            if arg.qualifier == ModuleQualifier::Constant
                && !matches!(
                    self.node(producer).map(|n| &n.kind),
                    Some(NodeKind::Constant(_))
                )
            {
                return Err(GraphError::InvalidGraph(format!(
                    "call {:?} input {position} must be a compile-time constant",
                    entry.id
                )));
            }
        }

        for (position, &child) in entry.outgoing.iter().enumerate() {
            let Some(NodeKind::IndexedOutput(index)) = self.node(child).map(|n| &n.kind) else {
                return Err(GraphError::InvalidGraph(format!(
                    "call {:?} output {position} is not an indexed output",
                    entry.id
                )));
            };
            if *index as usize != position {
                return Err(GraphError::InvalidGraph(format!(
                    "call {:?} output {position} is bound out of order",
                    entry.id
                )));
            }
        }

        Ok(())
    }

    /// The value kind a producer node yields, or `None` for nodes that
    /// are not value producers.
    pub fn value_kind_of(
        &self,
        node: NodeRef,
        registry: &NativeModuleRegistry,
    ) -> Option<ValueKind> {
        match &self.node(node)?.kind {
            NodeKind::Constant(value) => Some(value.kind()),
            NodeKind::GraphInput(_) => Some(ValueKind::Real),
            NodeKind::IndexedOutput(index) => {
                let call = self.node(node)?.incoming.first().copied()?;
                let NodeKind::ModuleCall { module } = self.node(call)?.kind else {
                    return None;
                };
                let descriptor = registry.get(module)?;
                Some(descriptor.args[descriptor.out_arg_index(*index as usize)].kind)
            }
            _ => None,
        }
    }

    /// Acyclicity check: iterative depth-first visit with a three-color
    /// marking. Finding a node already on the DFS stack (gray) means a
    /// module call feeds back into itself.
    fn cycle_check(&self) -> Result<(), GraphError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            Gray,
            Black,
        }

        let mut colors: AHashMap<NodeRef, Color> = AHashMap::with_capacity(self.nodes.len());
        let mut stack: Vec<(NodeRef, usize)> = Vec::new();

        for entry in self.nodes() {
            if colors.contains_key(&entry.id) {
                continue;
            }

            colors.insert(entry.id, Color::Gray);
            stack.push((entry.id, 0));

            while let Some(&(node, child)) = stack.last() {
                let outgoing = &self.nodes[node.0].outgoing;

                if child < outgoing.len() {
                    let next = outgoing[child];
                    stack.last_mut().unwrap().1 += 1;

                    match colors.get(&next) {
                        Some(Color::Gray) => return Err(GraphError::CyclicModuleCall),
                        Some(Color::Black) => {}
                        None => {
                            colors.insert(next, Color::Gray);
                            stack.push((next, 0));
                        }
                    }
                } else {
                    colors.insert(node, Color::Black);
                    stack.pop();
                }
            }
        }

        Ok(())
    }

    /// Removes every node not reachable (through reverse edges) from a
    /// graph output, then rebuilds node storage compactly.
    ///
    /// All previously issued [`NodeRef`]s are invalidated; the returned
    /// table maps old references to their replacements. Calling this
    /// twice in a row removes nothing the second time.
    pub fn compact(&mut self) -> AHashMap<NodeRef, NodeRef> {
        let mut live: AHashSet<NodeRef> = AHashSet::with_capacity(self.nodes.len());
        let mut pending: Vec<NodeRef> = self
            .nodes()
            .filter(|entry| matches!(entry.kind, NodeKind::GraphOutput(_)))
            .map(|entry| entry.id)
            .collect();

        while let Some(node) = pending.pop() {
            if !live.insert(node) {
                continue;
            }
            for &from in self.nodes[node.0].incoming.iter() {
                pending.push(from);
            }
        }

        let mut remap: AHashMap<NodeRef, NodeRef> = AHashMap::with_capacity(live.len());
        let mut rebuilt: Arena<NodeEntry> = Arena::with_capacity(live.len());

        // Insert surviving nodes in slot order so relabeling is stable,
        // then translate the edge lists.
        let mut survivors: Vec<NodeRef> = live.iter().copied().collect();
        survivors.sort_by_key(|node| node.0.slot());

        for &old in survivors.iter() {
            let new = NodeRef(rebuilt.insert(NodeEntry::new(self.nodes[old.0].kind.clone())));
            rebuilt[new.0].id = new;
            remap.insert(old, new);
        }

        for &old in survivors.iter() {
            let new = remap[&old];
            rebuilt[new.0].incoming = self.nodes[old.0]
                .incoming
                .iter()
                .filter_map(|from| remap.get(from).copied())
                .collect();
            rebuilt[new.0].outgoing = self.nodes[old.0]
                .outgoing
                .iter()
                .filter_map(|to| remap.get(to).copied())
                .collect();
        }

        self.nodes = rebuilt;
        remap
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::builtin;

    fn registry() -> NativeModuleRegistry {
        builtin::native_module_registry()
    }

    // result = multiply(input, constant)
    fn small_graph(registry: &NativeModuleRegistry) -> (ExecutionGraph, NodeRef) {
        let mut graph = ExecutionGraph::new();

        let input = graph.add_graph_input_node(0);
        let constant = graph.add_constant_node(ConstantValue::Real(0.5));
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

        (graph, call)
    }

    #[test]
    fn module_call_creates_indexed_children() {
        let registry = registry();
        let mut graph = ExecutionGraph::new();

        let call = graph
            .add_module_call_node(&registry, builtin::modules::ADD)
            .unwrap();

        // Two inputs, one output, plus the call itself.
        assert_eq!(graph.node_count(), 4);
        assert!(matches!(
            graph
                .node(graph.call_indexed_input(call, 1).unwrap())
                .unwrap()
                .kind,
            NodeKind::IndexedInput(1)
        ));
        assert!(matches!(
            graph
                .node(graph.call_indexed_output(call, 0).unwrap())
                .unwrap()
                .kind,
            NodeKind::IndexedOutput(0)
        ));
    }

    #[test]
    fn valid_graph_passes_validation() {
        let registry = registry();
        let (graph, _) = small_graph(&registry);

        graph.validate(&registry).unwrap();
    }

    #[test]
    fn duplicate_and_self_edges_are_rejected() {
        let registry = registry();
        let mut graph = ExecutionGraph::new();

        let a = graph.add_graph_input_node(0);
        let call = graph
            .add_module_call_node(&registry, builtin::modules::SIN)
            .unwrap();
        let input = graph.call_indexed_input(call, 0).unwrap();

        graph.add_edge(a, input).unwrap();
        assert!(matches!(
            graph.add_edge(a, input),
            Err(GraphError::InvalidEdge(_))
        ));
        assert!(matches!(
            graph.add_edge(a, a),
            Err(GraphError::InvalidEdge(_))
        ));
    }

    #[test]
    fn cycle_is_detected() {
        let registry = registry();
        let mut graph = ExecutionGraph::new();

        let call_a = graph
            .add_module_call_node(&registry, builtin::modules::SIN)
            .unwrap();
        let call_b = graph
            .add_module_call_node(&registry, builtin::modules::SIN)
            .unwrap();

        // a -> b and b -> a through the indexed children.
        graph
            .add_edge(
                graph.call_indexed_output(call_a, 0).unwrap(),
                graph.call_indexed_input(call_b, 0).unwrap(),
            )
            .unwrap();
        graph
            .add_edge(
                graph.call_indexed_output(call_b, 0).unwrap(),
                graph.call_indexed_input(call_a, 0).unwrap(),
            )
            .unwrap();

        assert!(matches!(
            graph.validate(&registry),
            Err(GraphError::CyclicModuleCall)
        ));
    }

    #[test]
    fn acyclic_graph_stays_valid_after_edits() {
        let registry = registry();
        let mut graph = ExecutionGraph::new();

        let input = graph.add_graph_input_node(0);
        let call_a = graph
            .add_module_call_node(&registry, builtin::modules::SIN)
            .unwrap();
        let call_b = graph
            .add_module_call_node(&registry, builtin::modules::SIN)
            .unwrap();
        let output = graph.add_graph_output_node(0);

        graph
            .add_edge(input, graph.call_indexed_input(call_a, 0).unwrap())
            .unwrap();
        graph
            .add_edge(
                graph.call_indexed_output(call_a, 0).unwrap(),
                graph.call_indexed_input(call_b, 0).unwrap(),
            )
            .unwrap();
        graph
            .add_edge(graph.call_indexed_output(call_b, 0).unwrap(), output)
            .unwrap();

        graph.validate(&registry).unwrap();
    }

    #[test]
    fn removed_node_invalidates_reference() {
        let mut graph = ExecutionGraph::new();

        let constant = graph.add_constant_node(ConstantValue::Real(1.0));
        graph.remove_node(constant, |_| {}).unwrap();

        assert!(!graph.contains(constant));
        assert!(matches!(
            graph.remove_node(constant, |_| {}),
            Err(GraphError::InvalidNode)
        ));

        // A new node may reuse the slot; the stale reference must not
        // resolve to it.
        let replacement = graph.add_constant_node(ConstantValue::Real(2.0));
        assert!(graph.node(constant).is_none());
        assert!(graph.contains(replacement));
    }

    #[test]
    fn remove_node_reports_detached_neighbors() {
        let registry = registry();
        let (mut graph, call) = small_graph(&registry);

        let input_child = graph.call_indexed_input(call, 0).unwrap();
        let producer = graph.call_input_producer(call, 0).unwrap();

        let mut detached = Vec::new();
        graph
            .remove_node(input_child, |neighbor| detached.push(neighbor))
            .unwrap();

        assert!(detached.contains(&producer));
        assert!(detached.contains(&call));
        assert!(graph.node(producer).unwrap().outgoing().is_empty());
    }

    #[test]
    fn compact_removes_unreachable_nodes_and_is_idempotent() {
        let registry = registry();
        let (mut graph, _) = small_graph(&registry);

        // A dangling subtree: sin call with a constant operand, feeding
        // nothing.
        let orphan_const = graph.add_constant_node(ConstantValue::Real(2.0));
        let orphan_call = graph
            .add_module_call_node(&registry, builtin::modules::SIN)
            .unwrap();
        graph
            .add_edge(orphan_const, graph.call_indexed_input(orphan_call, 0).unwrap())
            .unwrap();

        let before = graph.node_count();
        let remap = graph.compact();
        let after_first = graph.node_count();

        assert!(after_first < before);
        assert!(!remap.contains_key(&orphan_const));

        graph.validate(&registry).unwrap();

        let remap2 = graph.compact();
        assert_eq!(graph.node_count(), after_first);
        assert_eq!(remap2.len(), after_first);
    }

    #[test]
    fn compact_remap_preserves_topology() {
        let registry = registry();
        let (mut graph, call) = small_graph(&registry);

        let producer = graph.call_input_producer(call, 0).unwrap();
        let remap = graph.compact();

        let new_call = remap[&call];
        let new_producer = remap[&producer];
        assert_eq!(graph.call_input_producer(new_call, 0), Some(new_producer));
    }
}
