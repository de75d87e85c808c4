//! The lowered program: a DAG of concrete, schedulable buffer
//! operations.
//!
//! A task graph is built once when a program is compiled and never
//! mutated afterwards — the engine shares it behind an `Arc` and keeps
//! all per-block mutable state (predecessor counters, buffer handles)
//! outside it. That read-only split is what makes concurrent execution
//! safe.

use cadenza_core::buffer::BufferKind;
use cadenza_core::task_function::{TaskFunctionUid, TaskValue};
use cadenza_core::GraphGlobals;

/// One schedulable buffer operation.
#[derive(Debug)]
pub struct TaskNode {
    pub function: TaskFunctionUid,
    /// Resolved arguments, in the task function's argument order.
    pub args: Vec<TaskValue>,
    /// Indices of tasks that can only run after this one.
    pub successors: Vec<u32>,
    /// Number of distinct producer tasks this task waits on.
    pub predecessor_count: u32,
}

/// Binds a stream input channel to the virtual buffer the executor fills
/// at the start of each block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputBinding {
    pub input_index: u32,
    pub buffer: u32,
}

/// Where a stream output channel reads its samples from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum OutputBinding {
    Buffer(u32),
    /// The channel collapsed to a compile-time constant.
    Constant(f32),
}

#[derive(Debug)]
pub struct TaskGraph {
    tasks: Vec<TaskNode>,
    /// Tasks with no predecessors, ready at the start of every block.
    initial_tasks: Vec<u32>,
    inputs: Vec<InputBinding>,
    /// Output bindings ordered by output channel index.
    outputs: Vec<OutputBinding>,
    buffer_kinds: Vec<BufferKind>,
    /// Per virtual buffer: how many tasks plus output copies touch it.
    /// The executor frees the physical buffer when this many uses have
    /// completed.
    buffer_usages: Vec<u32>,
    globals: GraphGlobals,
}

impl TaskGraph {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        tasks: Vec<TaskNode>,
        initial_tasks: Vec<u32>,
        inputs: Vec<InputBinding>,
        outputs: Vec<OutputBinding>,
        buffer_kinds: Vec<BufferKind>,
        buffer_usages: Vec<u32>,
        globals: GraphGlobals,
    ) -> Self {
        debug_assert_eq!(buffer_kinds.len(), buffer_usages.len());

        Self {
            tasks,
            initial_tasks,
            inputs,
            outputs,
            buffer_kinds,
            buffer_usages,
            globals,
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    pub fn task(&self, index: u32) -> &TaskNode {
        &self.tasks[index as usize]
    }

    pub fn tasks(&self) -> &[TaskNode] {
        &self.tasks
    }

    pub fn initial_tasks(&self) -> &[u32] {
        &self.initial_tasks
    }

    pub fn inputs(&self) -> &[InputBinding] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputBinding] {
        &self.outputs
    }

    /// Number of virtual buffers the program uses.
    pub fn buffer_count(&self) -> usize {
        self.buffer_kinds.len()
    }

    pub fn buffer_kind(&self, buffer: u32) -> BufferKind {
        self.buffer_kinds[buffer as usize]
    }

    pub fn buffer_usage(&self, buffer: u32) -> u32 {
        self.buffer_usages[buffer as usize]
    }

    pub fn globals(&self) -> &GraphGlobals {
        &self.globals
    }
}
