//! The real-time block executor.
//!
//! Once per audio block the executor resets every task's
//! predecessors-remaining counter to its static in-degree, seeds the
//! worker pool with the zero-in-degree tasks, and lets readiness ripple
//! through the graph: each completing task atomically decrements its
//! successors' counters and pushes any that hit zero. A tasks-remaining
//! counter signals the block-complete latch the audio thread waits on.
//!
//! The task graph itself is immutable while it is installed; the only
//! cross-thread mutable state on the hot path is the atomic counters and
//! the buffer pool free lists.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

use arrayvec::ArrayVec;
use atomic_float::AtomicF64;
use crossbeam_utils::CachePadded;

use cadenza_core::registry::TaskFunctionRegistry;
use cadenza_core::task_function::{
    TaskArgRef, TaskContext, TaskPlanContext, TaskQualifier, TaskValue,
};
use cadenza_core::{StreamStatus, MAX_TASK_ARGS};
use cadenza_graph::{CompileError, OutputBinding, TaskGraph};

use crate::buffer_manager::BufferManager;
use crate::thread_pool::{PoolTask, QueueFull, TaskSender, ThreadPool, ThreadPoolConfig};

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    /// Worker thread count; `0` executes blocks synchronously on the
    /// audio thread.
    pub threads: usize,
    pub max_queued_tasks: usize,
    /// Upper bound on the per-block frame count.
    pub max_block_frames: usize,
    pub sample_rate: u32,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            max_queued_tasks: 1024,
            max_block_frames: crate::DEFAULT_MAX_BLOCK_FRAMES,
            sample_rate: 48_000,
        }
    }
}

/// Block-complete latch. The audio thread parks here while workers
/// finish the tail of the graph.
struct DoneLatch {
    done: Mutex<bool>,
    cond: Condvar,
}

impl DoneLatch {
    fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn reset(&self) {
        *self.done.lock().unwrap() = false;
    }

    fn notify(&self) {
        *self.done.lock().unwrap() = true;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cond.wait(done).unwrap();
        }
    }
}

/// Everything a worker needs to execute one program: the immutable task
/// graph plus the per-block mutable state beside it.
pub(crate) struct ProgramRuntime {
    graph: Arc<TaskGraph>,
    registry: Arc<TaskFunctionRegistry>,
    predecessors: Vec<CachePadded<AtomicI32>>,
    tasks_remaining: CachePadded<AtomicI32>,
    buffers: BufferManager,
    /// Per-task scratch memory sized by the descriptors' memory
    /// queries. Slot `i` is touched only by task `i`, which runs at most
    /// once per block.
    scratch: Vec<UnsafeCell<Box<[u8]>>>,
    done: DoneLatch,
    sample_rate: u32,
}

// SAFETY: the scratch slots are the only non-Sync field; each is
// accessed exclusively by its own task, and a task runs on exactly one
// worker per block.
unsafe impl Sync for ProgramRuntime {}
unsafe impl Send for ProgramRuntime {}

impl ProgramRuntime {
    pub fn build(
        graph: TaskGraph,
        registry: Arc<TaskFunctionRegistry>,
        max_block_frames: usize,
        stream_sample_rate: u32,
    ) -> Result<Arc<Self>, CompileError> {
        let sample_rate = match graph.globals().sample_rate {
            0 => stream_sample_rate,
            rate => rate,
        };

        let buffers = BufferManager::new(&graph, max_block_frames);
        let graph = Arc::new(graph);

        let mut scratch = Vec::with_capacity(graph.task_count());
        for task in graph.tasks() {
            let function = registry
                .get(task.function)
                .ok_or(CompileError::UnregisteredTaskFunction(task.function))?;

            let plan = TaskPlanContext {
                max_frames: max_block_frames,
                sample_rate,
                args: &task.args,
            };

            let bytes = function
                .memory_query
                .as_ref()
                .map(|query| query(&plan))
                .unwrap_or(0);
            let mut memory = vec![0u8; bytes].into_boxed_slice();

            if let Some(init) = function.init.as_ref() {
                init(&plan, &mut memory);
            }
            if let Some(voice_init) = function.voice_init.as_ref() {
                voice_init(&plan, &mut memory);
            }

            scratch.push(UnsafeCell::new(memory));
        }

        Ok(Arc::new(Self {
            predecessors: (0..graph.task_count())
                .map(|_| CachePadded::new(AtomicI32::new(0)))
                .collect(),
            tasks_remaining: CachePadded::new(AtomicI32::new(0)),
            buffers,
            scratch,
            done: DoneLatch::new(),
            sample_rate,
            registry,
            graph,
        }))
    }

    fn begin_block(&self) {
        for (state, task) in self.predecessors.iter().zip(self.graph.tasks()) {
            state.store(task.predecessor_count as i32, Ordering::Relaxed);
        }
        self.tasks_remaining
            .store(self.graph.task_count() as i32, Ordering::Relaxed);
        self.buffers.begin_block();
        self.done.reset();
    }

    /// Executes one task and releases its dependents. Runs on a worker
    /// thread, or inline on the audio thread under queue backpressure.
    fn run_task(self: &Arc<Self>, sender: &TaskSender<BlockTask>, task_index: u32, frames: usize) {
        let task = self.graph.task(task_index);
        let function = self
            .registry
            .get(task.function)
            .expect("function checked at program build");

        {
            let mut args: ArrayVec<TaskArgRef<'_>, MAX_TASK_ARGS> = ArrayVec::new();
            for (slot, value) in task.args.iter().enumerate() {
                args.push(self.materialize_arg(slot, value, &function.args[slot].qualifier, frames));
            }

            // SAFETY: slot `task_index` belongs to this task alone and
            // the task runs once per block.
            let scratch = unsafe { &mut *self.scratch[task_index as usize].get() };

            let mut ctx = TaskContext::new(frames, self.sample_rate, &mut args, scratch);
            (function.execute)(&mut ctx);
        }

        // Release buffer uses, freeing buffers whose last consumer this
        // was.
        let mut released: ArrayVec<u32, MAX_TASK_ARGS> = ArrayVec::new();
        for value in task.args.iter() {
            if let Some(buffer) = value.buffer_index() {
                if !released.contains(&buffer) {
                    released.push(buffer);
                    self.buffers.release_use(buffer);
                }
            }
        }

        // The decrement-and-test must be a single atomic operation so
        // two completing predecessors cannot both observe "I made it
        // zero".
        for &successor in task.successors.iter() {
            let remaining = self.predecessors[successor as usize].fetch_sub(1, Ordering::AcqRel);
            debug_assert!(remaining > 0);
            if remaining == 1 {
                let ready = BlockTask {
                    runtime: Arc::clone(self),
                    sender: sender.clone(),
                    task_index: successor,
                    frames: frames as u32,
                };
                if let Err(QueueFull(task)) = sender.add_task(ready) {
                    // Bounded-latency backpressure: run it here instead
                    // of blocking on queue space.
                    task.run();
                }
            }
        }

        let remaining = self.tasks_remaining.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(remaining > 0);
        if remaining == 1 {
            self.done.notify();
        }
    }

    fn materialize_arg<'a>(
        self: &'a Arc<Self>,
        slot: usize,
        value: &'a TaskValue,
        qualifier: &TaskQualifier,
        frames: usize,
    ) -> TaskArgRef<'a> {
        let allocator = self.buffers.allocator();

        match value {
            TaskValue::RealConstant(value) => TaskArgRef::RealConst(*value),
            TaskValue::BoolConstant(value) => TaskArgRef::BoolConst(*value),
            TaskValue::StringConstant(value) => TaskArgRef::StrConst(value.as_ref()),
            TaskValue::RealBuffer(buffer) => match qualifier {
                TaskQualifier::In => {
                    let handle = self.buffers.handle(*buffer);
                    // SAFETY: the writer task finished before this task
                    // became ready, and readers only take shared views.
                    TaskArgRef::RealIn(unsafe { allocator.buffer(handle) }.real_ref(frames))
                }
                TaskQualifier::Out => {
                    let handle = self.buffers.acquire_for_write(*buffer);
                    // SAFETY: the handle was just allocated; no other
                    // task can hold a reference to it.
                    TaskArgRef::RealOut(unsafe { allocator.buffer_mut(handle) }.real_mut(frames))
                }
                TaskQualifier::InOut => {
                    let handle = self.buffers.handle(*buffer);
                    // SAFETY: an in-place buffer has this task as its
                    // only remaining user (the branchless contract).
                    TaskArgRef::RealOut(unsafe { allocator.buffer_mut(handle) }.real_mut(frames))
                }
                TaskQualifier::Constant => {
                    unreachable!("buffer bound to constant slot {slot}")
                }
            },
            TaskValue::BoolBuffer(buffer) => match qualifier {
                TaskQualifier::In => {
                    let handle = self.buffers.handle(*buffer);
                    // SAFETY: as the real-buffer case above.
                    TaskArgRef::BoolIn(unsafe { allocator.buffer(handle) }.bool_ref(frames))
                }
                TaskQualifier::Out => {
                    let handle = self.buffers.acquire_for_write(*buffer);
                    // SAFETY: as the real-buffer case above.
                    TaskArgRef::BoolOut(unsafe { allocator.buffer_mut(handle) }.bool_mut(frames))
                }
                TaskQualifier::InOut => {
                    let handle = self.buffers.handle(*buffer);
                    // SAFETY: as the real-buffer case above.
                    TaskArgRef::BoolOut(unsafe { allocator.buffer_mut(handle) }.bool_mut(frames))
                }
                TaskQualifier::Constant => {
                    unreachable!("buffer bound to constant slot {slot}")
                }
            },
        }
    }
}

/// One scheduled task execution, stored inline in the pool queue.
pub(crate) struct BlockTask {
    runtime: Arc<ProgramRuntime>,
    sender: TaskSender<BlockTask>,
    task_index: u32,
    frames: u32,
}

impl PoolTask for BlockTask {
    fn run(self) {
        let BlockTask {
            runtime,
            sender,
            task_index,
            frames,
        } = self;
        runtime.run_task(&sender, task_index, frames as usize);
    }
}

pub(crate) enum EngineToExecutorMsg {
    NewProgram(Arc<ProgramRuntime>),
}

pub(crate) enum ExecutorToEngineMsg {
    ReturnProgram(Arc<ProgramRuntime>),
}

/// The audio-thread half of the engine. Owns the worker pool and the
/// currently installed program; driven once per block by the audio
/// driver callback.
pub struct Executor {
    program: Option<Arc<ProgramRuntime>>,
    pool: ThreadPool<BlockTask>,
    sender: TaskSender<BlockTask>,

    from_engine: rtrb::Consumer<EngineToExecutorMsg>,
    to_engine: rtrb::Producer<ExecutorToEngineMsg>,

    max_block_frames: usize,
    sample_rate: u32,
    load: AtomicF64,
    underruns: AtomicU64,
}

impl Executor {
    pub(crate) fn new(
        config: &ExecutorConfig,
        from_engine: rtrb::Consumer<EngineToExecutorMsg>,
        to_engine: rtrb::Producer<ExecutorToEngineMsg>,
    ) -> Self {
        let pool = ThreadPool::start(&ThreadPoolConfig {
            threads: config.threads,
            max_queued_tasks: config.max_queued_tasks,
            start_paused: false,
        });
        let sender = pool.sender();

        Self {
            program: None,
            pool,
            sender,
            from_engine,
            to_engine,
            max_block_frames: config.max_block_frames,
            sample_rate: config.sample_rate,
            load: AtomicF64::new(0.0),
            underruns: AtomicU64::new(0),
        }
    }

    /// Fraction of the block period the last block took to compute.
    pub fn load(&self) -> f64 {
        self.load.load(Ordering::Relaxed)
    }

    /// Number of blocks the driver reported as underruns.
    pub fn underrun_count(&self) -> u64 {
        self.underruns.load(Ordering::Relaxed)
    }

    pub fn pause(&self) {
        self.pool.pause();
    }

    pub fn resume(&self) {
        self.pool.resume();
    }

    fn poll_messages(&mut self) {
        while let Ok(message) = self.from_engine.pop() {
            match message {
                EngineToExecutorMsg::NewProgram(program) => {
                    if let Some(old) = self.program.replace(program) {
                        // The channel is sized so returns can never pile
                        // up faster than the engine polls them.
                        self.to_engine
                            .push(ExecutorToEngineMsg::ReturnProgram(old))
                            .ok()
                            .expect("return channel full");
                    }
                }
            }
        }
    }

    /// Processes one audio block: fills the graph input buffers from
    /// `inputs`, executes the task graph, and writes every output
    /// channel. Output channels are always fully written — zeroed when
    /// no program is installed.
    pub fn process_block(
        &mut self,
        frames: usize,
        inputs: &[&[f32]],
        outputs: &mut [&mut [f32]],
        status: StreamStatus,
    ) {
        assert!(frames <= self.max_block_frames);

        if status.contains(StreamStatus::OUTPUT_UNDERFLOW) {
            self.underruns.fetch_add(1, Ordering::Relaxed);
        }

        self.poll_messages();

        let Some(runtime) = self.program.as_ref() else {
            for channel in outputs.iter_mut() {
                channel.fill(0.0);
            }
            return;
        };
        let runtime = Arc::clone(runtime);

        let started = Instant::now();
        runtime.begin_block();
        self.fill_inputs(&runtime, frames, inputs);

        let task_count = runtime.graph.task_count();
        if task_count > 0 {
            for &initial in runtime.graph.initial_tasks().iter() {
                let task = BlockTask {
                    runtime: Arc::clone(&runtime),
                    sender: self.sender.clone(),
                    task_index: initial,
                    frames: frames as u32,
                };
                if let Err(QueueFull(task)) = self.sender.add_task(task) {
                    task.run();
                }
            }

            runtime.done.wait();
        }

        self.write_outputs(&runtime, frames, outputs);

        if self.sample_rate > 0 {
            let budget = frames as f64 / self.sample_rate as f64;
            self.load
                .store(started.elapsed().as_secs_f64() / budget, Ordering::Relaxed);
        }
    }

    fn fill_inputs(&self, runtime: &ProgramRuntime, frames: usize, inputs: &[&[f32]]) {
        for binding in runtime.graph.inputs().iter() {
            let handle = runtime.buffers.acquire_for_write(binding.buffer);
            // SAFETY: the handle was just allocated for this block; no
            // task has started yet.
            let buffer = unsafe { runtime.buffers.allocator().buffer_mut(handle) };
            let mut view = buffer.real_mut(frames);
            view.set_varying();

            let copied = inputs
                .get(binding.input_index as usize)
                .map(|channel| {
                    let count = frames.min(channel.len());
                    view.samples[..count].copy_from_slice(&channel[..count]);
                    count
                })
                .unwrap_or(0);
            view.samples[copied..].fill(0.0);
        }
    }

    fn write_outputs(&self, runtime: &ProgramRuntime, frames: usize, outputs: &mut [&mut [f32]]) {
        let bindings = runtime.graph.outputs();

        for (channel, samples) in outputs.iter_mut().enumerate() {
            let count = frames.min(samples.len());
            match bindings.get(channel) {
                Some(OutputBinding::Buffer(buffer)) => {
                    let handle = runtime.buffers.handle(*buffer);
                    // SAFETY: every task is complete; reading the
                    // finished buffer is the output's counted use.
                    let view = unsafe { runtime.buffers.allocator().buffer(handle) }
                        .real_ref(frames);
                    if let Some(value) = view.constant_value() {
                        samples[..count].fill(value);
                    } else {
                        samples[..count].copy_from_slice(&view.samples[..count]);
                    }
                }
                Some(OutputBinding::Constant(value)) => samples[..count].fill(*value),
                None => samples[..count].fill(0.0),
            }
            samples[count..].fill(0.0);
        }

        for binding in bindings.iter() {
            if let OutputBinding::Buffer(buffer) = binding {
                runtime.buffers.release_use(*buffer);
            }
        }
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        // The pool joins its workers in its own drop; dropping the
        // program here is fine because the executor is torn down from a
        // control thread, never from the driver callback.
        self.program = None;
    }
}
