use std::sync::{
    atomic::{AtomicU32, Ordering},
    Mutex,
};

use crate::class::{SizeClass, CLASS_COUNT};

/// One heap: an array of size classes, each behind its own lock. The
/// allocator owns `N` of these, one per CPU plus the global heap at the last
/// index, see [`crate::allocator`]. A heap's identity is its index in that
/// array; superblocks record it in their `owning_heap` field.
///
/// Locking per class per heap means two threads contend only when they
/// operate on the same class of the same heap, and lets a free on one heap
/// proceed while another thread allocates from a different one.
pub(crate) struct Heap {
    classes: [Mutex<SizeClass>; CLASS_COUNT],
}

impl Heap {
    /// Builds an empty heap. This is `const` so that a whole allocator can
    /// be constructed in a `static` initializer.
    pub const fn new() -> Self {
        const CLASS: Mutex<SizeClass> = Mutex::new(SizeClass::new());
        Self {
            classes: [CLASS; CLASS_COUNT],
        }
    }

    /// The lock guarding the given size class.
    #[inline]
    pub fn class(&self, index: usize) -> &Mutex<SizeClass> {
        &self.classes[index]
    }
}

/// Identity of the calling thread, used solely to pick a CPU heap. Ids are
/// handed out by a process-wide counter the first time a thread allocates
/// and stay fixed for the thread's lifetime, so the heap choice is
/// deterministic per thread. Callers re-read this on every operation rather
/// than caching a heap, nothing here depends on thread affinity.
pub(crate) fn current_thread_id() -> u32 {
    thread_local! {
        static ID: u32 = {
            static COUNTER: AtomicU32 = AtomicU32::new(0);
            COUNTER.fetch_add(1, Ordering::Relaxed)
        };
    }
    ID.with(|&id| id)
}
