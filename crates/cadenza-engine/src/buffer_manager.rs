//! Maps the task graph's virtual buffers onto physical pool buffers for
//! the duration of one block.
//!
//! A virtual buffer gets its physical handle when its writer first
//! touches it, and releases the handle back to the pool once every
//! consuming task (and output copy) has finished with it. Both sides are
//! lock-free; the pools themselves are pre-sized at program build, so no
//! allocation ever happens during a block.

use std::sync::atomic::{AtomicI32, AtomicU32, Ordering};

use crossbeam_utils::CachePadded;

use cadenza_core::buffer::BufferKind;
use cadenza_core::buffer_allocator::{BufferAllocator, BufferPoolDescription};
use cadenza_core::lock_free::INVALID_HANDLE;
use cadenza_graph::TaskGraph;

pub(crate) struct BufferManager {
    allocator: BufferAllocator,
    real_pool: usize,
    bool_pool: usize,

    kinds: Vec<BufferKind>,
    initial_usages: Vec<i32>,
    handles: Vec<CachePadded<AtomicU32>>,
    usages: Vec<CachePadded<AtomicI32>>,
}

impl BufferManager {
    pub fn new(task_graph: &TaskGraph, max_block_frames: usize) -> Self {
        let buffer_count = task_graph.buffer_count();

        let kinds: Vec<BufferKind> = (0..buffer_count)
            .map(|buffer| task_graph.buffer_kind(buffer as u32))
            .collect();
        let initial_usages: Vec<i32> = (0..buffer_count)
            .map(|buffer| task_graph.buffer_usage(buffer as u32) as i32)
            .collect();

        // One pool per kind, each sized to the full virtual-buffer count
        // of that kind: a safe upper bound on concurrent liveness, so
        // exhaustion is statically impossible for a correctly built
        // graph.
        let real_count = kinds.iter().filter(|&&k| k == BufferKind::Real).count();
        let bool_count = kinds.iter().filter(|&&k| k == BufferKind::Bool).count();

        let allocator = BufferAllocator::new(&[
            BufferPoolDescription {
                kind: BufferKind::Real,
                capacity: max_block_frames,
                buffer_count: real_count,
            },
            BufferPoolDescription {
                kind: BufferKind::Bool,
                capacity: max_block_frames,
                buffer_count: bool_count,
            },
        ]);

        Self {
            allocator,
            real_pool: 0,
            bool_pool: 1,
            kinds,
            initial_usages,
            handles: (0..buffer_count)
                .map(|_| CachePadded::new(AtomicU32::new(INVALID_HANDLE)))
                .collect(),
            usages: (0..buffer_count)
                .map(|_| CachePadded::new(AtomicI32::new(0)))
                .collect(),
        }
    }

    pub fn allocator(&self) -> &BufferAllocator {
        &self.allocator
    }

    /// Resets per-buffer state for a new block. Runs single-threaded,
    /// before any task is pushed.
    pub fn begin_block(&self) {
        for (usage, &initial) in self.usages.iter().zip(self.initial_usages.iter()) {
            usage.store(initial, Ordering::Relaxed);
        }
        for handle in self.handles.iter() {
            handle.store(INVALID_HANDLE, Ordering::Relaxed);
        }
    }

    /// Allocates the physical buffer for a virtual buffer's writer.
    pub fn acquire_for_write(&self, buffer: u32) -> u32 {
        let pool = match self.kinds[buffer as usize] {
            BufferKind::Real => self.real_pool,
            BufferKind::Bool => self.bool_pool,
        };

        let handle = self.allocator.allocate(pool);
        debug_assert_ne!(
            handle, INVALID_HANDLE,
            "buffer pool exhausted: task graph sizing bug"
        );

        self.handles[buffer as usize].store(handle, Ordering::Release);
        handle
    }

    /// The physical handle previously bound by the writer. Callers are
    /// ordered after the writer by the task graph's dependency edges.
    pub fn handle(&self, buffer: u32) -> u32 {
        let handle = self.handles[buffer as usize].load(Ordering::Acquire);
        debug_assert_ne!(handle, INVALID_HANDLE, "buffer read before its writer ran");
        handle
    }

    /// Records that one consumer of `buffer` has finished; frees the
    /// physical buffer when the last one does.
    pub fn release_use(&self, buffer: u32) {
        let remaining = self.usages[buffer as usize].fetch_sub(1, Ordering::AcqRel);
        debug_assert!(remaining > 0, "buffer released more times than it is used");

        if remaining == 1 {
            let handle = self.handles[buffer as usize].load(Ordering::Acquire);
            if handle != INVALID_HANDLE {
                self.allocator.free(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadenza_core::builtin;
    use cadenza_core::native_module::ConstantValue;
    use cadenza_graph::{compile, CompilerOptions, ExecutionGraph};

    fn sine_task_graph() -> TaskGraph {
        let modules = builtin::native_module_registry();
        let tasks = builtin::task_function_registry();

        let mut graph = ExecutionGraph::new();
        let t = graph.add_graph_input_node(0);
        let freq = graph.add_constant_node(ConstantValue::Real(440.0));
        let mul = graph
            .add_module_call_node(&modules, builtin::modules::MULTIPLY)
            .unwrap();
        let out = graph.add_graph_output_node(0);

        graph
            .add_edge(t, graph.call_indexed_input(mul, 0).unwrap())
            .unwrap();
        graph
            .add_edge(freq, graph.call_indexed_input(mul, 1).unwrap())
            .unwrap();
        graph
            .add_edge(graph.call_indexed_output(mul, 0).unwrap(), out)
            .unwrap();

        compile(&graph, &modules, &tasks, &CompilerOptions::default()).unwrap()
    }

    #[test]
    fn buffers_cycle_through_the_pool_each_block() {
        let task_graph = sine_task_graph();
        let manager = BufferManager::new(&task_graph, 128);

        for _ in 0..3 {
            manager.begin_block();

            let handle = manager.acquire_for_write(0);
            assert_ne!(handle, INVALID_HANDLE);
            assert_eq!(manager.handle(0), handle);

            // One task use plus the output copy.
            manager.release_use(0);
            manager.release_use(0);
        }
    }

    #[test]
    fn release_only_frees_on_last_use() {
        let task_graph = sine_task_graph();
        let manager = BufferManager::new(&task_graph, 128);
        manager.begin_block();

        let first = manager.acquire_for_write(0);
        manager.release_use(0);
        // Still one use outstanding: the handle must not be reusable
        // yet. The real pool holds exactly one buffer here, so a free
        // would be observable as a successful allocate.
        assert_eq!(manager.allocator().allocate(0), INVALID_HANDLE);

        manager.release_use(0);
        let second = manager.allocator().allocate(0);
        assert_eq!(second, first);
    }
}
