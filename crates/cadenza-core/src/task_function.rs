//! Task function descriptors and the runtime execution context.
//!
//! A task function is the concrete, buffer-level implementation selected
//! to realize a native module call, chosen by which of the call's inputs
//! are compile-time constants and which are single-use ("branchless").

use std::fmt;
use std::sync::Arc;

use crate::buffer::{BoolBufferMut, BoolBufferRef, RealBufferMut, RealBufferRef};
use crate::native_module::{NativeModuleUid, ValueKind};

/// 64-bit task function identifier: `{library_id, task_id}`, big-endian
/// on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskFunctionUid(u64);

impl TaskFunctionUid {
    pub const fn new(library_id: u32, task_id: u32) -> Self {
        Self(((library_id as u64) << 32) | task_id as u64)
    }

    pub const fn library_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    pub const fn task_id(self) -> u32 {
        self.0 as u32
    }
}

impl fmt::Debug for TaskFunctionUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task {}:{}", self.library_id(), self.task_id())
    }
}

/// Direction and mutability of a task function argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskQualifier {
    /// Read-only buffer input.
    In,
    /// Write-only buffer output.
    Out,
    /// A buffer read and overwritten in place.
    InOut,
    /// A compile-time constant scalar.
    Constant,
}

/// One argument of a task function's signature.
///
/// `unshared` marks an `InOut` argument whose input buffer the task may
/// overwrite in place. A task honoring it must never read an element
/// after writing a *different* element's position — element `i` may only
/// be read before or at the write of element `i`. Lowering wires a buffer
/// to an unshared argument only when the producer has exactly one
/// consumer, so no other task observes the overwrite.
#[derive(Debug, Clone, Copy)]
pub struct TaskArg {
    pub name: &'static str,
    pub kind: ValueKind,
    pub qualifier: TaskQualifier,
    pub unshared: bool,
}

/// A task argument resolved at lowering time: a virtual buffer index or
/// an inline constant.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskValue {
    RealBuffer(u32),
    BoolBuffer(u32),
    RealConstant(f32),
    BoolConstant(bool),
    StringConstant(Arc<str>),
}

impl TaskValue {
    pub fn buffer_index(&self) -> Option<u32> {
        match self {
            Self::RealBuffer(index) | Self::BoolBuffer(index) => Some(*index),
            _ => None,
        }
    }
}

/// A task argument materialized for one block: concrete buffer views or
/// constants.
pub enum TaskArgRef<'a> {
    RealIn(RealBufferRef<'a>),
    RealOut(RealBufferMut<'a>),
    RealConst(f32),
    BoolIn(BoolBufferRef<'a>),
    BoolOut(BoolBufferMut<'a>),
    BoolConst(bool),
    StrConst(&'a str),
}

/// Execution context handed to a task function, once per block.
///
/// Buffer views are padded to the SIMD width; task functions process the
/// whole view, not just `frames` elements.
pub struct TaskContext<'a, 'b> {
    /// Logical frame count for this block.
    pub frames: usize,
    pub sample_rate: u32,
    args: &'b mut [TaskArgRef<'a>],
    scratch: &'b mut [u8],
}

impl<'a, 'b> TaskContext<'a, 'b> {
    pub fn new(
        frames: usize,
        sample_rate: u32,
        args: &'b mut [TaskArgRef<'a>],
        scratch: &'b mut [u8],
    ) -> Self {
        Self {
            frames,
            sample_rate,
            args,
            scratch,
        }
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// Per-task scratch memory, sized by the descriptor's memory query.
    pub fn scratch(&mut self) -> &mut [u8] {
        self.scratch
    }

    #[inline]
    pub fn real_buffer_in(&self, index: usize) -> RealBufferRef<'a> {
        match &self.args[index] {
            TaskArgRef::RealIn(view) => *view,
            _ => panic!("argument {index} is not a real input buffer"),
        }
    }

    #[inline]
    pub fn real_buffer_out(&mut self, index: usize) -> &mut RealBufferMut<'a> {
        match &mut self.args[index] {
            TaskArgRef::RealOut(view) => view,
            _ => panic!("argument {index} is not a real output buffer"),
        }
    }

    #[inline]
    pub fn real_constant_in(&self, index: usize) -> f32 {
        match &self.args[index] {
            TaskArgRef::RealConst(value) => *value,
            _ => panic!("argument {index} is not a real constant"),
        }
    }

    #[inline]
    pub fn bool_buffer_in(&self, index: usize) -> BoolBufferRef<'a> {
        match &self.args[index] {
            TaskArgRef::BoolIn(view) => *view,
            _ => panic!("argument {index} is not a bool input buffer"),
        }
    }

    #[inline]
    pub fn bool_buffer_out(&mut self, index: usize) -> &mut BoolBufferMut<'a> {
        match &mut self.args[index] {
            TaskArgRef::BoolOut(view) => view,
            _ => panic!("argument {index} is not a bool output buffer"),
        }
    }

    #[inline]
    pub fn bool_constant_in(&self, index: usize) -> bool {
        match &self.args[index] {
            TaskArgRef::BoolConst(value) => *value,
            _ => panic!("argument {index} is not a bool constant"),
        }
    }

    #[inline]
    pub fn string_constant_in(&self, index: usize) -> &'a str {
        match &self.args[index] {
            TaskArgRef::StrConst(value) => *value,
            _ => panic!("argument {index} is not a string constant"),
        }
    }
}

/// Build-time context for the memory-query and initializer callbacks.
pub struct TaskPlanContext<'a> {
    /// Upper bound on the per-block frame count.
    pub max_frames: usize,
    pub sample_rate: u32,
    /// The task's resolved argument bindings.
    pub args: &'a [TaskValue],
}

pub type TaskExecute = Box<dyn Fn(&mut TaskContext<'_, '_>) + Send + Sync>;
pub type TaskMemoryQuery = Box<dyn Fn(&TaskPlanContext<'_>) -> usize + Send + Sync>;
pub type TaskInit = Box<dyn Fn(&TaskPlanContext<'_>, &mut [u8]) + Send + Sync>;

/// Descriptor for one task function.
pub struct TaskFunction {
    pub uid: TaskFunctionUid,
    pub name: &'static str,
    pub args: Vec<TaskArg>,
    /// Bytes of per-task scratch memory needed, queried at program build.
    pub memory_query: Option<TaskMemoryQuery>,
    /// Runs once when a program is installed.
    pub init: Option<TaskInit>,
    /// Runs whenever a voice starts over.
    pub voice_init: Option<TaskInit>,
    pub execute: TaskExecute,
}

impl fmt::Debug for TaskFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFunction")
            .field("uid", &self.uid)
            .field("name", &self.name)
            .field("args", &self.args)
            .finish()
    }
}

/// Lowering-time classification of a module call's input argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputShape {
    /// Connected to a constant node.
    Constant,
    /// Connected to a non-constant producer shared by several consumers.
    Variable,
    /// Connected to a non-constant producer used by exactly this one
    /// consumer — its buffer may be overwritten in place.
    BranchlessVariable,
}

/// One element of a mapping rule's input pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingInput {
    Constant,
    Variable,
    BranchlessVariable,
}

impl MappingInput {
    /// Whether a classified input satisfies this pattern element. A
    /// branchless input also satisfies `Variable`; the reverse does not
    /// hold.
    pub fn matches(self, shape: InputShape) -> bool {
        match self {
            Self::Constant => shape == InputShape::Constant,
            Self::Variable => shape != InputShape::Constant,
            Self::BranchlessVariable => shape == InputShape::BranchlessVariable,
        }
    }
}

/// Associates a native module input shape with a task function.
///
/// Rules are tried in registration order and the first match wins, so
/// branchless (in-place) rules are registered ahead of general ones.
#[derive(Debug, Clone)]
pub struct TaskMapping {
    pub module: NativeModuleUid,
    /// Pattern over the module's input arguments, in input order.
    pub input_pattern: Vec<MappingInput>,
    pub task: TaskFunctionUid,
    /// For each native module argument (inputs and outputs, in the
    /// module's argument order), the task argument index it binds to. An
    /// `InOut` task argument appears here twice: once for the input it
    /// consumes and once for the output it produces.
    pub arg_to_task_arg: Vec<u32>,
}
