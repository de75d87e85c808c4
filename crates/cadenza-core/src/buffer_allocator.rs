//! Pre-allocated buffer pools with lock-free allocate/free.
//!
//! Pools are partitioned by buffer kind and size so unrelated sizes never
//! contend on the same free list. Every buffer is allocated once up
//! front; nothing is allocated during block processing.

use std::cell::UnsafeCell;

use crate::buffer::{Buffer, BufferKind};
use crate::lock_free::{LockFreeList, INVALID_HANDLE};

/// Describes one pool of identically-sized buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolDescription {
    pub kind: BufferKind,
    /// Logical element capacity of each buffer in the pool.
    pub capacity: usize,
    /// Number of buffers pre-allocated in the pool.
    pub buffer_count: usize,
}

struct Pool {
    description: BufferPoolDescription,
    /// Pools own disjoint ranges of the global handle space; allocations
    /// return `first_handle + local` so a handle identifies its pool.
    first_handle: u32,
    free: LockFreeList,
}

/// Lock-free allocator over pre-sized buffer pools.
///
/// Exhausting a pool returns [`INVALID_HANDLE`]. In the real-time path
/// that is a task-graph sizing bug, not a recoverable condition — callers
/// assert on it rather than propagating an error.
pub struct BufferAllocator {
    pools: Vec<Pool>,
    buffers: Box<[UnsafeCell<Buffer>]>,
}

// SAFETY: concurrent access to individual buffers is governed by handle
// ownership — a buffer is touched only by the task currently holding its
// handle (see `buffer`/`buffer_mut`), and the free lists are lock-free.
unsafe impl Sync for BufferAllocator {}
unsafe impl Send for BufferAllocator {}

impl BufferAllocator {
    pub fn new(descriptions: &[BufferPoolDescription]) -> Self {
        let mut pools = Vec::with_capacity(descriptions.len());
        let mut buffers = Vec::new();
        let mut first_handle = 0u32;

        for description in descriptions {
            pools.push(Pool {
                description: *description,
                first_handle,
                free: LockFreeList::with_all_handles(description.buffer_count),
            });

            for _ in 0..description.buffer_count {
                buffers.push(UnsafeCell::new(Buffer::new(
                    description.kind,
                    description.capacity,
                )));
            }

            first_handle += description.buffer_count as u32;
        }

        Self {
            pools,
            buffers: buffers.into_boxed_slice(),
        }
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    pub fn pool_description(&self, pool_index: usize) -> &BufferPoolDescription {
        &self.pools[pool_index].description
    }

    /// Total number of buffers across all pools.
    pub fn buffer_count(&self) -> usize {
        self.buffers.len()
    }

    /// Allocates a buffer from the given pool, returning its global
    /// handle, or [`INVALID_HANDLE`] if the pool is exhausted.
    pub fn allocate(&self, pool_index: usize) -> u32 {
        let pool = &self.pools[pool_index];

        let local = pool.free.pop();
        if local == INVALID_HANDLE {
            return INVALID_HANDLE;
        }

        pool.first_handle + local
    }

    /// Returns a buffer to its pool's free list.
    pub fn free(&self, handle: u32) {
        debug_assert!((handle as usize) < self.buffers.len());

        let pool = self
            .pools
            .iter()
            .rev()
            .find(|pool| handle >= pool.first_handle)
            .expect("handle outside any pool range");

        pool.free.push(handle - pool.first_handle);
    }

    /// Shared access to the buffer behind `handle`.
    ///
    /// # Safety
    ///
    /// The caller must hold `handle` (obtained from [`allocate`] and not
    /// yet freed), and no thread may hold a mutable reference to the same
    /// buffer concurrently. In the task graph this is guaranteed by the
    /// producer-before-consumer dependency edges.
    ///
    /// [`allocate`]: BufferAllocator::allocate
    #[inline]
    pub unsafe fn buffer(&self, handle: u32) -> &Buffer {
        debug_assert!((handle as usize) < self.buffers.len());
        &*self.buffers[handle as usize].get()
    }

    /// Exclusive access to the buffer behind `handle`.
    ///
    /// # Safety
    ///
    /// As [`buffer`](BufferAllocator::buffer), and additionally no other
    /// reference to the same buffer may exist at all — the task graph
    /// guarantees this because a buffer has exactly one writer task and
    /// writers run strictly before their readers.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub unsafe fn buffer_mut(&self, handle: u32) -> &mut Buffer {
        debug_assert!((handle as usize) < self.buffers.len());
        &mut *self.buffers[handle as usize].get()
    }
}
