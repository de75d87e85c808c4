//! The control-thread half of the runtime.
//!
//! The engine owns the registries and compiles execution graphs into
//! runnable programs; the executor receives them over a wait-free SPSC
//! ring and sends replaced programs back, so the audio thread never
//! frees memory. A failed compile leaves the previously installed
//! program running.

use std::sync::Arc;

use thiserror::Error;

use cadenza_core::registry::{NativeModuleRegistry, TaskFunctionRegistry};
use cadenza_graph::{compile, CompileError, CompilerOptions, ExecutionGraph};

use crate::executor::{
    EngineToExecutorMsg, Executor, ExecutorConfig, ExecutorToEngineMsg, ProgramRuntime,
};

const CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Compile(#[from] CompileError),

    /// The program was compiled for stream parameters this executor
    /// does not provide.
    #[error("program is incompatible with the stream: {0}")]
    IncompatibleProgram(String),

    /// The executor has not picked up earlier messages yet.
    #[error("program channel is full")]
    ChannelFull,
}

pub struct Engine {
    modules: Arc<NativeModuleRegistry>,
    tasks: Arc<TaskFunctionRegistry>,
    options: CompilerOptions,
    config: ExecutorConfig,

    to_executor: rtrb::Producer<EngineToExecutorMsg>,
    from_executor: rtrb::Consumer<ExecutorToEngineMsg>,
}

impl Engine {
    /// Creates an engine/executor pair. The executor half moves to the
    /// audio thread; the engine stays on the control thread.
    pub fn new(
        modules: Arc<NativeModuleRegistry>,
        tasks: Arc<TaskFunctionRegistry>,
        config: ExecutorConfig,
    ) -> (Engine, Executor) {
        let (to_executor, from_engine) =
            rtrb::RingBuffer::<EngineToExecutorMsg>::new(CHANNEL_CAPACITY);
        let (to_engine, from_executor) =
            rtrb::RingBuffer::<ExecutorToEngineMsg>::new(CHANNEL_CAPACITY);

        let executor = Executor::new(&config, from_engine, to_engine);

        (
            Engine {
                modules,
                tasks,
                options: CompilerOptions::default(),
                config,
                to_executor,
                from_executor,
            },
            executor,
        )
    }

    pub fn modules(&self) -> &NativeModuleRegistry {
        &self.modules
    }

    pub fn tasks(&self) -> &TaskFunctionRegistry {
        &self.tasks
    }

    pub fn set_compiler_options(&mut self, options: CompilerOptions) {
        self.options = options;
    }

    /// Compiles `graph` and hands the resulting program to the executor,
    /// which swaps it in at its next block boundary.
    pub fn load_program(&mut self, graph: &ExecutionGraph) -> Result<(), EngineError> {
        let task_graph = compile(graph, &self.modules, &self.tasks, &self.options)?;

        let globals = task_graph.globals();
        if globals.sample_rate != 0 && globals.sample_rate != self.config.sample_rate {
            return Err(EngineError::IncompatibleProgram(format!(
                "program wants sample rate {}, stream runs at {}",
                globals.sample_rate, self.config.sample_rate
            )));
        }
        if globals.chunk_size != 0 && globals.chunk_size as usize != self.config.max_block_frames {
            return Err(EngineError::IncompatibleProgram(format!(
                "program wants chunk size {}, stream uses {}",
                globals.chunk_size, self.config.max_block_frames
            )));
        }

        let runtime = ProgramRuntime::build(
            task_graph,
            Arc::clone(&self.tasks),
            self.config.max_block_frames,
            self.config.sample_rate,
        )?;

        if self
            .to_executor
            .push(EngineToExecutorMsg::NewProgram(runtime))
            .is_err()
        {
            log::error!("failed to send program: executor message channel is full");
            return Err(EngineError::ChannelFull);
        }

        log::debug!("program queued for installation");
        Ok(())
    }

    /// Polls the return channel, dropping programs the executor has
    /// replaced. Call this regularly from the control thread. Returns
    /// the number of programs reclaimed.
    pub fn update(&mut self) -> usize {
        let mut reclaimed = 0;
        while let Ok(message) = self.from_executor.pop() {
            match message {
                ExecutorToEngineMsg::ReturnProgram(old) => {
                    drop(old);
                    reclaimed += 1;
                }
            }
        }
        reclaimed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::builtin;
    use cadenza_core::GraphGlobals;

    fn engine_pair(config: ExecutorConfig) -> (Engine, Executor) {
        Engine::new(
            Arc::new(builtin::native_module_registry()),
            Arc::new(builtin::task_function_registry()),
            config,
        )
    }

    fn passthrough_graph() -> ExecutionGraph {
        let mut graph = ExecutionGraph::new();
        let x = graph.add_graph_input_node(0);
        let out = graph.add_graph_output_node(0);
        graph.add_edge(x, out).unwrap();
        graph
    }

    #[test]
    fn incompatible_sample_rate_is_rejected() {
        let (mut engine, _executor) = engine_pair(ExecutorConfig {
            sample_rate: 48_000,
            ..Default::default()
        });

        let mut graph = passthrough_graph();
        graph.set_globals(GraphGlobals {
            max_voices: 1,
            sample_rate: 44_100,
            chunk_size: 0,
        });

        assert!(matches!(
            engine.load_program(&graph),
            Err(EngineError::IncompatibleProgram(_))
        ));
    }

    #[test]
    fn compile_failure_does_not_disturb_running_program() {
        let (mut engine, mut executor) = engine_pair(ExecutorConfig::default());

        let good = passthrough_graph();
        engine.load_program(&good).unwrap();

        // A graph output with no producer fails validation.
        let mut bad = ExecutionGraph::new();
        bad.add_graph_output_node(0);
        assert!(engine.load_program(&bad).is_err());

        let input = [0.25f32; 4];
        let mut out = [0.0f32; 4];
        let mut channels = [out.as_mut_slice()];
        executor.process_block(
            4,
            &[&input],
            &mut channels,
            cadenza_core::StreamStatus::empty(),
        );

        assert_eq!(out, input);
    }
}
