mod compiler;
mod error;
mod graph;
mod lower;
mod optimizer;
mod serialize;
mod task_graph;

pub use compiler::{compile, CompilerOptions};
pub use error::{CompileError, GraphError, LoadError};
pub use graph::{ExecutionGraph, NodeEntry, NodeKind, NodeRef};
pub use optimizer::{builtin_rules, OptimizationRule, PatternSymbol};
pub use serialize::{FORMAT_VERSION, MAGIC};
pub use task_graph::{InputBinding, OutputBinding, TaskGraph, TaskNode};
