//! The compile pipeline: validate, fold, optimize, compact, lower.

use cadenza_core::registry::{NativeModuleRegistry, TaskFunctionRegistry};

use crate::error::CompileError;
use crate::graph::ExecutionGraph;
use crate::optimizer;
use crate::task_graph::TaskGraph;

#[derive(Debug, Clone, Copy)]
pub struct CompilerOptions {
    /// Apply the algebraic rewrite rules. Constant folding always runs;
    /// several task function families require at least one non-constant
    /// input, so folding is a correctness step, not a tuning knob.
    pub optimize: bool,
    /// Pass budget before the optimizer is declared divergent.
    pub max_optimizer_passes: u32,
}

impl Default for CompilerOptions {
    fn default() -> Self {
        Self {
            optimize: true,
            max_optimizer_passes: 64,
        }
    }
}

/// Compiles an execution graph into a task graph.
///
/// The input graph is left untouched; all rewriting happens on an
/// internal copy. On error the caller's previously compiled program, if
/// any, remains in effect.
pub fn compile(
    graph: &ExecutionGraph,
    modules: &NativeModuleRegistry,
    tasks: &TaskFunctionRegistry,
    options: &CompilerOptions,
) -> Result<TaskGraph, CompileError> {
    let mut working = graph.clone();
    working.validate(modules)?;

    if options.optimize {
        let passes = optimizer::run(
            &mut working,
            modules,
            &optimizer::builtin_rules(),
            options.max_optimizer_passes,
        )?;
        log::debug!("optimizer reached fixed point after {passes} passes");
    } else {
        optimizer::fold_constants(&mut working, modules)?;
    }

    working.compact();
    working.validate(modules)?;

    let task_graph = crate::lower::lower(&working, modules, tasks)?;

    log::debug!(
        "compiled program: {} tasks, {} buffers, {} outputs",
        task_graph.task_count(),
        task_graph.buffer_count(),
        task_graph.outputs().len()
    );

    Ok(task_graph)
}
