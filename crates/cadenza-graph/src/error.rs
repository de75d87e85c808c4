use cadenza_core::native_module::NativeModuleUid;
use cadenza_core::task_function::{InputShape, TaskFunctionUid};
use thiserror::Error;

/// An error produced while mutating or validating an execution graph.
#[derive(Debug, Clone, Error)]
pub enum GraphError {
    /// A node reference is stale or refers to a removed node.
    #[error("invalid node reference")]
    InvalidNode,

    /// An edge operation was illegal (self-loop, duplicate, or a missing
    /// edge on removal).
    #[error("invalid edge: {0}")]
    InvalidEdge(&'static str),

    /// A cycle of module calls was detected.
    #[error("cyclic module call detected")]
    CyclicModuleCall,

    /// The graph failed a structural validation rule.
    #[error("invalid graph: {0}")]
    InvalidGraph(String),

    /// A module call refers to a module missing from the registry.
    #[error("native module {0:?} is not registered")]
    UnregisteredModule(NativeModuleUid),
}

/// An error produced while loading a serialized program.
///
/// No partial state is installed on failure.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("invalid header magic")]
    InvalidHeader,

    #[error("format version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    /// Truncated or unreadable input.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("malformed record: {0}")]
    MalformedRecord(&'static str),

    /// The loaded graph failed validation.
    #[error(transparent)]
    InvalidGraph(#[from] GraphError),
}

/// An error produced while compiling an execution graph into a task
/// graph. The previously installed program, if any, keeps running.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// No task mapping rule matches the call's classified input shapes.
    #[error("no task mapping for module {module:?} with input shapes {shapes:?}")]
    NoTaskMapping {
        module: NativeModuleUid,
        shapes: Vec<InputShape>,
    },

    #[error("module {module:?} expects {expected} arguments, found {found}")]
    IncorrectArgumentCount {
        module: NativeModuleUid,
        expected: usize,
        found: usize,
    },

    #[error("task function {0:?} is not registered")]
    UnregisteredTaskFunction(TaskFunctionUid),

    #[error("native module {0:?} is not registered")]
    UnregisteredModule(NativeModuleUid),

    /// The optimizer kept finding rewrites past its pass budget.
    #[error("optimizer failed to converge after {0} passes")]
    OptimizerDivergence(u32),

    #[error("compile-time evaluation of {module:?} failed: {message}")]
    ConstantFoldFailed {
        module: NativeModuleUid,
        message: String,
    },
}
