mod buffer_manager;
mod engine;
mod executor;
mod sample_library;
mod thread_pool;

pub use engine::{Engine, EngineError};
pub use executor::{Executor, ExecutorConfig};
pub use sample_library::{LoopMode, Sample, SampleHandle, SampleLibrary, SampleLoader};
pub use thread_pool::{PoolTask, QueueFull, TaskSender, ThreadPool, ThreadPoolConfig};

/// The default upper bound on frames per processing block.
///
/// A balance between scheduling overhead (lower values dispatch the task
/// graph more often) and cache efficiency (higher values spill the
/// per-buffer working set).
pub const DEFAULT_MAX_BLOCK_FRAMES: usize = 256;
