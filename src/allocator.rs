use std::{
    alloc::{GlobalAlloc, Layout},
    ptr::{self, NonNull},
    sync::atomic::Ordering,
};

use crate::{
    block::{Block, BLOCK_HEADER_SIZE},
    class::{class_index_for, migrate, CLASS_COUNT},
    heap::{current_thread_id, Heap},
    platform,
    superblock::{Superblock, SUPERBLOCK_HEADER_SIZE, SUPERBLOCK_SIZE},
};

/// Requests strictly larger than this go straight to the page source, both
/// ways: the allocation path maps a dedicated region and the free path
/// recognizes such blocks by their header size alone. Half a superblock is
/// the natural cutoff, anything bigger would waste at least half of every
/// superblock carved for it.
pub(crate) const LARGE_THRESHOLD: usize = SUPERBLOCK_SIZE / 2;

/// Largest alignment the [`GlobalAlloc`] implementation honors. Both header
/// sizes are multiples of this, so serving a class at least as big as the
/// requested alignment puts every payload on a multiple of it. The size
/// based API below promises pointer alignment only.
const MAX_SUPPORTED_ALIGN: usize = 32;

const _: () = assert!(BLOCK_HEADER_SIZE % MAX_SUPPORTED_ALIGN == 0);
const _: () = assert!(SUPERBLOCK_HEADER_SIZE % MAX_SUPPORTED_ALIGN == 0);

/// Thread-aware general purpose allocator. `N` heaps live inside the
/// allocator itself: `N - 1` CPU heaps plus the global heap at the last
/// index. Once you've read [`crate::block`], [`crate::freelist`],
/// [`crate::superblock`] and [`crate::class`], this is where the circle gets
/// completed:
///
/// ```text
///            +--------------------------------------------------------+
/// heaps[0]   | class 3 | class 4 |   ...   | class c |  ...           |
///            +--------------------------------|-----------------------+
///                                             v
///                                  +--------+   +--------+
///                                  | used 7 |-->| used 2 |   fullness-sorted
///                                  +--------+   +--------+   superblocks
///
/// heaps[1]     ... same shape, picked by hash of the thread id ...
///
///            +--------------------------------------------------------+
/// heaps[N-1] | global heap: same shape, receives under-used           |
///            |  superblocks, lends them to whichever CPU heap asks    |
///            +--------------------------------------------------------+
/// ```
///
/// An allocation hashes the calling thread onto a CPU heap, takes that
/// heap's class lock and grabs a block from the fullest superblock that has
/// one. If the class is empty handed it consults the global heap, adopting
/// (migrating) a superblock from it when possible, and only then carves a
/// brand new superblock out of fresh pages. Frees walk the block header back
/// to its superblock and hand the block to whichever heap owns that
/// superblock right now; when this leaves a CPU heap's class holding too
/// much free memory, its emptiest superblock is pushed off to the global
/// heap. That bound on hoarded memory is what keeps blowup in check while
/// different threads allocate and free each other's memory.
///
/// Locks are taken in one global order: a CPU class lock first, the same
/// class's global heap lock second, never the other way around.
///
/// # Examples
///
/// The allocator is built in a `static`, so the heaps exist before `main`
/// and no initialization race is possible:
///
/// ```rust
/// use shalloc::Shalloc;
///
/// static ALLOCATOR: Shalloc = Shalloc::new();
///
/// let address = ALLOCATOR.allocate(512);
/// assert!(!address.is_null());
/// assert_eq!(address as usize % std::mem::align_of::<usize>(), 0);
///
/// unsafe {
///     address.write_bytes(7, 512);
///     ALLOCATOR.deallocate(address);
/// }
/// ```
///
/// More CPU heaps reduce contention; the global heap is always included in
/// the count:
///
/// ```rust
/// use shalloc::Shalloc;
///
/// // 4 CPU heaps plus the global heap.
/// static ALLOCATOR: Shalloc<5> = Shalloc::new();
/// ```
///
/// It can also serve as the global allocator, within its documented
/// alignment limit:
///
/// ```no_run
/// use shalloc::Shalloc;
///
/// #[global_allocator]
/// static ALLOCATOR: Shalloc = Shalloc::new();
///
/// fn main() {
///     let nums = vec![1, 2, 3];
///     assert_eq!(nums.len(), 3);
/// }
/// ```
pub struct Shalloc<const N: usize = 3> {
    /// CPU heaps at `0..N - 1`, the global heap at `N - 1`.
    heaps: [Heap; N],
}

unsafe impl<const N: usize> Sync for Shalloc<N> {}

impl<const N: usize> Shalloc<N> {
    /// Builds an allocator with `N - 1` CPU heaps and one global heap, all
    /// empty. `const`, so the usual home for it is a `static`.
    pub const fn new() -> Self {
        assert!(N >= 2, "need at least one CPU heap plus the global heap");

        const HEAP: Heap = Heap::new();
        Self { heaps: [HEAP; N] }
    }

    /// CPU heap serving the calling thread. Re-computed on every call so
    /// nothing ever depends on a thread staying put.
    #[inline]
    fn cpu_heap_index(&self) -> usize {
        current_thread_id() as usize % (N - 1)
    }

    /// Allocates `size` bytes and returns the payload address, or null if
    /// the kernel is out of memory. The payload is at least pointer aligned
    /// and stays exclusively the caller's until [`Shalloc::deallocate`].
    /// Zero sized requests succeed with a smallest-class block.
    pub fn allocate(&self, size: usize) -> *mut u8 {
        if size > LARGE_THRESHOLD {
            Self::allocate_large(size)
        } else {
            self.allocate_small(size)
        }
    }

    /// Allocates `count * size` bytes, zeroed, or null on failure. An
    /// overflowing product is reported as out of memory rather than as a
    /// smaller allocation than the caller asked for.
    pub fn allocate_zeroed(&self, count: usize, size: usize) -> *mut u8 {
        let Some(total) = count.checked_mul(size) else {
            return ptr::null_mut();
        };

        let address = self.allocate(total);
        if !address.is_null() {
            // Fresh pages are already zero but recycled blocks are not, and
            // we don't track which is which.
            unsafe { ptr::write_bytes(address, 0, total) };
        }

        address
    }

    /// Returns `address` to the allocator. Null is a no-op.
    ///
    /// # Safety
    ///
    /// `address` must be null or a pointer obtained from this allocator and
    /// not deallocated since. The caller must not touch the memory
    /// afterwards.
    pub unsafe fn deallocate(&self, address: *mut u8) {
        let Some(address) = NonNull::new(address) else {
            return;
        };

        let block = Block::from_payload_address(address);

        if block.as_ref().size > LARGE_THRESHOLD {
            // Large blocks were mapped on their own, with the header at the
            // base of the mapping. Hand the whole thing back.
            platform::return_memory(block.cast(), block.as_ref().size + BLOCK_HEADER_SIZE);
        } else {
            self.deallocate_small(block);
        }
    }

    /// Out-of-place reallocation: allocates `size` bytes, copies over what
    /// fits and frees the old block. Null behaves like [`Shalloc::allocate`]
    /// and `size == 0` behaves like [`Shalloc::deallocate`], returning null.
    /// On allocation failure the old block is left untouched and null is
    /// returned.
    ///
    /// # Safety
    ///
    /// Same contract as [`Shalloc::deallocate`]: `address` must be null or a
    /// live pointer obtained from this allocator. On success the old pointer
    /// must not be used anymore.
    pub unsafe fn reallocate(&self, address: *mut u8, size: usize) -> *mut u8 {
        if address.is_null() {
            return self.allocate(size);
        }

        if size == 0 {
            self.deallocate(address);
            return ptr::null_mut();
        }

        let old_size = Block::from_payload_address(NonNull::new_unchecked(address))
            .as_ref()
            .size;

        let new_address = self.allocate(size);
        if !new_address.is_null() {
            // The old block may be bigger or smaller than the new one, copy
            // only what fits in both.
            ptr::copy_nonoverlapping(address, new_address, old_size.min(size));
            self.deallocate(address);
        }

        new_address
    }

    /// Small allocation: CPU heap first, then the global heap, then fresh
    /// pages.
    fn allocate_small(&self, size: usize) -> *mut u8 {
        let class = class_index_for(size);
        let heap = self.cpu_heap_index();

        let Ok(mut cpu) = self.heaps[heap].class(class).lock() else {
            return ptr::null_mut();
        };

        unsafe {
            // Fullest superblock with a free block in this heap's class.
            if let Some(mut superblock) = cpu.find_superblock_with_space() {
                let Some(block) = superblock.as_mut().take_free_block() else {
                    return ptr::null_mut();
                };
                cpu.used_blocks += 1;
                cpu.bubble_toward_head(superblock);
                return Block::payload_address_of(block).as_ptr();
            }

            // Empty handed: consult the global heap. The CPU class lock is
            // already held, the global class lock always comes second.
            let Ok(mut global) = self.heaps[N - 1].class(class).lock() else {
                return ptr::null_mut();
            };

            if let Some(mut superblock) = global.superblocks.head {
                // Superblocks only reach the global heap under-utilized and
                // leave it as soon as a block is taken, so the head always
                // has space.
                let Some(block) = superblock.as_mut().take_free_block() else {
                    return ptr::null_mut();
                };
                global.used_blocks += 1;
                migrate(&mut global, &mut cpu, superblock, heap);
                return Block::payload_address_of(block).as_ptr();
            }

            // Nothing anywhere: carve fresh pages into a superblock for this
            // class and install it here.
            let Some(region) = platform::request_memory(SUPERBLOCK_SIZE) else {
                return ptr::null_mut();
            };

            let mut superblock = Superblock::carve(region, class, heap);
            cpu.install(superblock);
            let Some(block) = superblock.as_mut().take_free_block() else {
                return ptr::null_mut();
            };
            cpu.used_blocks += 1;
            cpu.bubble_toward_head(superblock);
            Block::payload_address_of(block).as_ptr()
        }
    }

    /// Large allocation: a dedicated mapping with the same header shape in
    /// front of the payload but no owning superblock.
    fn allocate_large(size: usize) -> *mut u8 {
        let Some(length) = size.checked_add(BLOCK_HEADER_SIZE) else {
            return ptr::null_mut();
        };

        unsafe {
            let Some(region) = platform::request_memory(length) else {
                return ptr::null_mut();
            };

            let block = region.cast::<Block>();
            block.as_ptr().write(Block {
                size,
                is_free: false,
                next_free: None,
                superblock: None,
            });

            Block::payload_address_of(block).as_ptr()
        }
    }

    /// Small free: resolve the owning heap, give the block back and keep the
    /// occupancy invariant by pushing the emptiest superblock to the global
    /// heap when the CPU heap holds too much free memory.
    unsafe fn deallocate_small(&self, block: NonNull<Block>) {
        let Some(mut superblock) = block.as_ref().superblock else {
            debug_assert!(false, "small block without owning superblock");
            return;
        };
        let class = block.as_ref().class_index();

        // The superblock can migrate to another heap at any moment before
        // we hold its current class lock: load the owner, lock that class,
        // re-check and restart on mismatch. Migration in or out of a heap
        // only happens under that heap's class lock, so the re-read under
        // the lock is decisive.
        let (heap, mut owner) = loop {
            let heap = superblock.as_ref().data.owning_heap.load(Ordering::Acquire);
            let Ok(guard) = self.heaps[heap].class(class).lock() else {
                return;
            };
            if superblock.as_ref().data.owning_heap.load(Ordering::Acquire) == heap {
                break (heap, guard);
            }
        };

        superblock.as_mut().put_free_block(block);
        owner.used_blocks -= 1;
        owner.bubble_toward_tail(superblock);

        // CPU heaps aren't allowed to hoard free memory; the global heap is
        // exempt. The tail is the emptiest superblock, which is exactly the
        // one keeping the class in violation.
        if heap != N - 1
            && owner.violates_occupancy_invariant(superblock.as_ref().data.total_count)
        {
            let Ok(mut global) = self.heaps[N - 1].class(class).lock() else {
                return;
            };
            let Some(tail) = owner.superblocks.tail else {
                return;
            };
            migrate(&mut owner, &mut global, tail, N - 1);
        }
    }
}

impl Default for Shalloc {
    fn default() -> Self {
        Shalloc::new()
    }
}

unsafe impl<const N: usize> GlobalAlloc for Shalloc<N> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return ptr::null_mut();
        }

        // Serving at least `align` bytes lands the payload on a multiple of
        // the requested alignment, see MAX_SUPPORTED_ALIGN.
        self.allocate(layout.size().max(layout.align()))
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The block header knows everything the layout would tell us.
        self.deallocate(ptr);
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return ptr::null_mut();
        }

        self.allocate_zeroed(1, layout.size().max(layout.align()))
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > MAX_SUPPORTED_ALIGN {
            return ptr::null_mut();
        }

        self.reallocate(ptr, new_size.max(layout.align()))
    }
}

#[cfg(test)]
impl<const N: usize> Shalloc<N> {
    /// `(used_blocks, total_blocks)` of one class, for test assertions.
    fn class_stats(&self, heap: usize, class: usize) -> (usize, usize) {
        let class = self.heaps[heap].class(class).lock().unwrap();
        (class.used_blocks, class.total_blocks)
    }

    /// Walks every heap and class and checks all the structural promises at
    /// once: counters match the lists, lists are sorted by fullness, free
    /// lists are complete and consistent with the block flags, and
    /// superblocks agree about who owns them. The occupancy bound is
    /// asserted separately in the tests that know what state to expect,
    /// because a freshly carved superblock legitimately sits below it until
    /// the next free.
    fn verify_consistency(&self) {
        for heap in 0..N {
            for class_index in 0..CLASS_COUNT {
                let class = self.heaps[heap].class(class_index).lock().unwrap();

                let mut used = 0;
                let mut total = 0;
                let mut superblocks = 0;
                let mut previous_count = usize::MAX;
                let mut current = class.superblocks.head;

                unsafe {
                    while let Some(superblock) = current {
                        let data = &superblock.as_ref().data;

                        assert!(previous_count >= data.used_count, "list sorted by fullness");
                        previous_count = data.used_count;

                        assert_eq!(data.class, class_index);
                        assert_eq!(data.owning_heap.load(Ordering::Relaxed), heap);
                        assert!(data.used_count <= data.total_count);
                        assert_eq!(
                            data.free_blocks.len(),
                            data.total_count - data.used_count,
                            "free list length matches the counters"
                        );

                        let mut free_block = data.free_blocks.head;
                        while let Some(block) = free_block {
                            assert!(block.as_ref().is_free);
                            assert_eq!(block.as_ref().superblock, Some(superblock));
                            free_block = block.as_ref().next_free;
                        }

                        used += data.used_count;
                        total += data.total_count;
                        superblocks += 1;
                        current = superblock.as_ref().next;
                    }
                }

                assert_eq!(class.used_blocks, used);
                assert_eq!(class.total_blocks, total);
                assert_eq!(class.superblocks.len, superblocks);
            }
        }
    }

    /// Total blocks in use across all heaps for one class.
    fn used_blocks_everywhere(&self, class: usize) -> usize {
        (0..N).map(|heap| self.class_stats(heap, class).0).sum()
    }
}
