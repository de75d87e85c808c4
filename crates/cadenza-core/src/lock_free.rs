//! Lock-free handle free list.
//!
//! Handles are 32-bit node indices. The list head and every per-node
//! "next" link pack a handle together with a 32-bit tag in one atomic
//! 64-bit word; the tag is bumped on every successful head update, which
//! prevents the ABA problem across pop/push reorderings. All mutation
//! happens through compare-exchange retry loops — no blocking locks, so
//! worst-case latency on the real-time path stays bounded.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

/// Sentinel handle distinct from any valid node index.
pub const INVALID_HANDLE: u32 = u32::MAX;

#[inline]
fn pack(handle: u32, tag: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(handle)
}

#[inline]
fn unpack(word: u64) -> (u32, u32) {
    (word as u32, (word >> 32) as u32)
}

/// An intrusive lock-free free list over handles `0..capacity`.
pub struct LockFreeList {
    head: CachePadded<AtomicU64>,
    next: Box<[CachePadded<AtomicU64>]>,
}

impl LockFreeList {
    /// Creates an empty list able to hold handles `0..capacity`.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity < INVALID_HANDLE as usize);

        Self {
            head: CachePadded::new(AtomicU64::new(pack(INVALID_HANDLE, 0))),
            next: (0..capacity)
                .map(|_| CachePadded::new(AtomicU64::new(pack(INVALID_HANDLE, 0))))
                .collect(),
        }
    }

    /// Creates a list pre-populated with every handle `0..capacity`, in
    /// ascending pop order.
    pub fn with_all_handles(capacity: usize) -> Self {
        let list = Self::new(capacity);

        for handle in (0..capacity as u32).rev() {
            list.push(handle);
        }

        list
    }

    /// Pushes `handle` onto the head of the list.
    ///
    /// The handle must be owned by the calling thread (previously popped
    /// or never yet pushed).
    pub fn push(&self, handle: u32) {
        debug_assert!((handle as usize) < self.next.len());

        let next = &self.next[handle as usize];
        let mut next_tag = unpack(next.load(Ordering::Relaxed)).1;

        let mut head_word = self.head.load(Ordering::Acquire);
        loop {
            let (head_handle, head_tag) = unpack(head_word);

            // This node is still owned by us, so its next link can be
            // rewritten freely until the head CAS succeeds.
            next_tag = next_tag.wrapping_add(1);
            next.store(pack(head_handle, next_tag), Ordering::Relaxed);

            match self.head.compare_exchange_weak(
                head_word,
                pack(handle, head_tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => head_word = observed,
            }
        }
    }

    /// Pops the head handle, or returns [`INVALID_HANDLE`] if the list is
    /// empty.
    pub fn pop(&self) -> u32 {
        let mut head_word = self.head.load(Ordering::Acquire);
        loop {
            let (head_handle, head_tag) = unpack(head_word);
            if head_handle == INVALID_HANDLE {
                return INVALID_HANDLE;
            }

            let (next_handle, _) = unpack(self.next[head_handle as usize].load(Ordering::Acquire));

            match self.head.compare_exchange_weak(
                head_word,
                pack(next_handle, head_tag.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return head_handle,
                Err(observed) => head_word = observed,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn push_then_pop_returns_same_handle() {
        let list = LockFreeList::new(8);

        list.push(3);
        assert_eq!(list.pop(), 3);
        assert_eq!(list.pop(), INVALID_HANDLE);
    }

    #[test]
    fn prepopulated_list_pops_ascending() {
        let list = LockFreeList::with_all_handles(4);

        assert_eq!(list.pop(), 0);
        assert_eq!(list.pop(), 1);
        assert_eq!(list.pop(), 2);
        assert_eq!(list.pop(), 3);
        assert_eq!(list.pop(), INVALID_HANDLE);
    }

    #[test]
    fn lifo_order() {
        let list = LockFreeList::new(8);

        list.push(5);
        list.push(1);
        assert_eq!(list.pop(), 1);
        assert_eq!(list.pop(), 5);
    }

    // Stress test: several threads repeatedly pop a handle and push it
    // back. Every handle must remain unique while held (no double
    // allocation) and none may be lost.
    #[test]
    fn concurrent_push_pop_stress() {
        const CAPACITY: usize = 64;
        const THREADS: usize = 8;
        const ITERATIONS: usize = 10_000;

        let list = LockFreeList::with_all_handles(CAPACITY);
        let in_use: Vec<AtomicU32> = (0..CAPACITY).map(|_| AtomicU32::new(0)).collect();

        std::thread::scope(|scope| {
            for _ in 0..THREADS {
                scope.spawn(|| {
                    for _ in 0..ITERATIONS {
                        let handle = list.pop();
                        if handle == INVALID_HANDLE {
                            continue;
                        }

                        let claims = in_use[handle as usize].fetch_add(1, Ordering::AcqRel);
                        assert_eq!(claims, 0, "handle {handle} double-allocated");

                        in_use[handle as usize].fetch_sub(1, Ordering::AcqRel);
                        list.push(handle);
                    }
                });
            }
        });

        // All handles must still be present exactly once.
        let mut seen = vec![false; CAPACITY];
        loop {
            let handle = list.pop();
            if handle == INVALID_HANDLE {
                break;
            }
            assert!(!seen[handle as usize]);
            seen[handle as usize] = true;
        }
        assert!(seen.iter().all(|&s| s));
    }
}
