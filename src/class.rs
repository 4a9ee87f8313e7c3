use std::{ptr::NonNull, sync::atomic::Ordering};

use crate::{
    header::Header,
    list::LinkedList,
    superblock::{block_capacity, Superblock, SUPERBLOCK_SIZE},
    Pointer,
};

/// Number of size classes per heap. Class `c` holds blocks of `2^c` bytes,
/// so the largest class is exactly half a superblock and everything above it
/// bypasses the heaps, see [`crate::allocator`].
pub(crate) const CLASS_COUNT: usize = 16;

/// Smallest class actually served. Tiny and zero sized requests are clamped
/// up to this class, a block has to be able to hold at least something and
/// `ceil(log2(size))` is meaningless for sizes below 2 anyway.
pub(crate) const MIN_CLASS_INDEX: usize = 3;

/// Fraction of a class's blocks allowed to sit free on CPU heaps before the
/// emptiest superblock is given back to the global heap.
pub(crate) const EMPTY_FRACTION: f64 = 0.4;

/// Slack, in whole superblocks, granted on top of [`EMPTY_FRACTION`] before
/// reclamation kicks in.
pub(crate) const SLACK_SUPERBLOCKS: usize = 0;

const _: () = assert!(class_block_size(CLASS_COUNT - 1) == SUPERBLOCK_SIZE / 2);
const _: () = assert!(block_capacity(CLASS_COUNT - 1) >= 1);
const _: () = assert!(MIN_CLASS_INDEX < CLASS_COUNT);

/// Block size served by the given class.
#[inline]
pub(crate) const fn class_block_size(class: usize) -> usize {
    1 << class
}

/// Maps a requested size to the class that serves it, the smallest power of
/// two holding `size` bytes, clamped to [`MIN_CLASS_INDEX`]. Callers must
/// have routed larger-than-class-max requests to the page source already.
#[inline]
pub(crate) fn class_index_for(size: usize) -> usize {
    debug_assert!(size <= class_block_size(CLASS_COUNT - 1));

    let clamped = size.max(class_block_size(MIN_CLASS_INDEX));
    clamped.next_power_of_two().trailing_zeros() as usize
}

/// One size class bucket of one heap: the superblocks whose blocks are
/// `2^class` bytes, plus running totals over them.
///
/// The superblock list is kept sorted by `used_count`, fullest first, at all
/// times. Allocations are served from the fullest superblock that still has
/// space, which starves the emptiest ones so they can eventually drain and
/// be handed to the global heap. Since any single operation changes one
/// superblock's `used_count` by exactly one, sortedness is restored by
/// bubbling that superblock one swap at a time. Equal counts never swap, so
/// ties keep their order.
///
/// ```text
///  head                                      tail
///   |                                          |
///   v                                          v
/// +--------+    +--------+    +--------+    +--------+
/// | used 8 | -> | used 5 | -> | used 5 | -> | used 1 |
/// +--------+    +--------+    +--------+    +--------+
///   fullest                                  emptiest,
///                                            next to be reclaimed
/// ```
///
/// Every `SizeClass` lives inside a [`std::sync::Mutex`] owned by its heap;
/// whoever holds that lock owns this struct, the listed superblock headers
/// and their free lists, all at once.
pub(crate) struct SizeClass {
    /// Sum of `used_count` over the listed superblocks.
    pub used_blocks: usize,
    /// Sum of `total_count` over the listed superblocks.
    pub total_blocks: usize,
    /// Fullness-sorted list of superblocks.
    pub superblocks: LinkedList<Superblock>,
}

impl SizeClass {
    /// Creates an empty size class.
    pub const fn new() -> Self {
        Self {
            used_blocks: 0,
            total_blocks: 0,
            superblocks: LinkedList::new(),
        }
    }

    /// Returns the fullest superblock that still has a free block, or `None`
    /// if every block in this class is handed out. Thanks to the sort order
    /// that's the first superblock that isn't full, the walk only skips the
    /// completely full prefix.
    pub unsafe fn find_superblock_with_space(&self) -> Pointer<Header<Superblock>> {
        // Cheap short-circuit for the common empty-handed case.
        if self.used_blocks == self.total_blocks {
            return None;
        }

        let mut current = self.superblocks.head;
        while let Some(superblock) = current {
            if !superblock.as_ref().is_full() {
                return Some(superblock);
            }
            current = superblock.as_ref().next;
        }

        // Unreachable while the counters are in sync, the short-circuit
        // above already said there's a free block somewhere.
        debug_assert!(false, "counters out of sync with superblock list");
        None
    }

    /// Links a freshly carved superblock at the tail of the list and counts
    /// its blocks. The caller takes blocks and bubbles afterwards.
    pub unsafe fn install(&mut self, superblock: NonNull<Header<Superblock>>) {
        self.total_blocks += superblock.as_ref().data.total_count;
        self.superblocks.push_tail(superblock);
    }

    /// Restores the sort after `superblock`'s `used_count` went up by one:
    /// move it toward the head while its predecessor is strictly emptier.
    pub unsafe fn bubble_toward_head(&mut self, superblock: NonNull<Header<Superblock>>) {
        while let Some(prev) = superblock.as_ref().prev {
            if prev.as_ref().data.used_count >= superblock.as_ref().data.used_count {
                break;
            }
            self.superblocks.swap_with_successor(prev);
        }
    }

    /// Restores the sort after `superblock`'s `used_count` went down by one:
    /// move it toward the tail while its successor is strictly fuller.
    pub unsafe fn bubble_toward_tail(&mut self, superblock: NonNull<Header<Superblock>>) {
        while let Some(next) = superblock.as_ref().next {
            if next.as_ref().data.used_count <= superblock.as_ref().data.used_count {
                break;
            }
            self.superblocks.swap_with_successor(superblock);
        }
    }

    /// Whether this class holds on to too much empty memory and must give
    /// its emptiest superblock to the global heap. With `u` blocks in use
    /// out of `a`, the class is in violation when `u < a - K*S` and
    /// `u < (1 - F) * a`, where `S` is the block capacity of one superblock
    /// of this class. Both conjuncts stay spelled out so that the slack `K`
    /// remains tunable even while it is zero.
    pub fn violates_occupancy_invariant(&self, superblock_capacity: usize) -> bool {
        let used = self.used_blocks;
        let total = self.total_blocks;

        used < total.saturating_sub(SLACK_SUPERBLOCKS * superblock_capacity)
            && (used as f64) < (1.0 - EMPTY_FRACTION) * total as f64
    }

    /// Used counts in list order, for asserting sortedness in tests.
    #[cfg(test)]
    pub unsafe fn used_counts(&self) -> Vec<usize> {
        let mut counts = Vec::new();
        let mut current = self.superblocks.head;
        while let Some(superblock) = current {
            counts.push(superblock.as_ref().data.used_count);
            current = superblock.as_ref().next;
        }
        counts
    }
}

/// Moves `superblock` from `src` to `dst`, which belong to different heaps
/// but the same class index. The superblock enters at the head of `dst` and
/// bubbles toward the tail into sorted position; both classes' totals and
/// the superblock's owner are updated. Caller must hold both class locks.
pub(crate) unsafe fn migrate(
    src: &mut SizeClass,
    dst: &mut SizeClass,
    superblock: NonNull<Header<Superblock>>,
    dst_heap: usize,
) {
    src.superblocks.remove(superblock);
    dst.superblocks.push_head(superblock);
    dst.bubble_toward_tail(superblock);

    let used = superblock.as_ref().data.used_count;
    let total = superblock.as_ref().data.total_count;
    src.used_blocks -= used;
    src.total_blocks -= total;
    dst.used_blocks += used;
    dst.total_blocks += total;

    superblock
        .as_ref()
        .data
        .owning_heap
        .store(dst_heap, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use std::ptr::NonNull;

    use super::*;
    use crate::platform;

    #[test]
    fn class_index_boundaries() {
        assert_eq!(class_index_for(0), MIN_CLASS_INDEX);
        assert_eq!(class_index_for(1), MIN_CLASS_INDEX);
        assert_eq!(class_index_for(8), MIN_CLASS_INDEX);
        assert_eq!(class_index_for(9), 4);
        assert_eq!(class_index_for(24), 5);
        assert_eq!(class_index_for(32), 5);
        assert_eq!(class_index_for(33), 6);
        assert_eq!(class_index_for(SUPERBLOCK_SIZE / 2), CLASS_COUNT - 1);
    }

    #[test]
    fn occupancy_invariant_arithmetic() {
        let mut class = SizeClass::new();
        let capacity = block_capacity(5);

        // Empty class is trivially compliant, `0 < 0` fails both conjuncts.
        assert!(!class.violates_occupancy_invariant(capacity));

        // One block in use out of a whole superblock violates.
        class.used_blocks = 1;
        class.total_blocks = capacity;
        assert!(class.violates_occupancy_invariant(capacity));

        // A mostly full class complies.
        class.used_blocks = capacity - 1;
        assert!(!class.violates_occupancy_invariant(capacity));

        // Exactly at the empty fraction boundary: `u < 0.6 * a` is false.
        class.used_blocks = 6;
        class.total_blocks = 10;
        assert!(!class.violates_occupancy_invariant(capacity));
        class.used_blocks = 5;
        assert!(class.violates_occupancy_invariant(capacity));

        // Full classes never violate regardless of the fraction, the first
        // conjunct `u < a` guards it.
        class.used_blocks = 0;
        class.total_blocks = 0;
        assert!(!class.violates_occupancy_invariant(capacity));
    }

    /// Builds a class holding `count` freshly carved superblocks. Returns
    /// the regions too so that tests can give them back.
    unsafe fn class_with_superblocks(
        count: usize,
    ) -> (
        SizeClass,
        Vec<NonNull<Header<Superblock>>>,
        Vec<NonNull<u8>>,
    ) {
        const CLASS: usize = 5;

        let mut class = SizeClass::new();
        let mut regions = Vec::new();
        let mut superblocks = Vec::new();

        for _ in 0..count {
            let region = platform::request_memory(SUPERBLOCK_SIZE).unwrap();
            let superblock = Superblock::carve(region, CLASS, 0);
            class.install(superblock);
            regions.push(region);
            superblocks.push(superblock);
        }

        (class, superblocks, regions)
    }

    unsafe fn release_regions(regions: Vec<NonNull<u8>>) {
        for region in regions {
            platform::return_memory(region, SUPERBLOCK_SIZE);
        }
    }

    /// Takes `count` blocks out of `superblock`, with the class counters in
    /// sync and the sort restored, like the allocation path does.
    unsafe fn drain(
        class: &mut SizeClass,
        mut superblock: NonNull<Header<Superblock>>,
        count: usize,
    ) {
        for _ in 0..count {
            superblock.as_mut().take_free_block().unwrap();
            class.used_blocks += 1;
            class.bubble_toward_head(superblock);
        }
    }

    #[test]
    fn search_picks_fullest_with_space() {
        unsafe {
            let (mut class, superblocks, regions) = class_with_superblocks(3);

            drain(&mut class, superblocks[0], 4);
            drain(&mut class, superblocks[1], 2);
            assert_eq!(class.used_counts(), [4, 2, 0]);

            // Fullest with space is the head while it has free blocks.
            assert_eq!(class.find_superblock_with_space(), Some(superblocks[0]));

            // Fill the head completely, the search moves past it.
            let capacity = superblocks[0].as_ref().data.total_count;
            drain(&mut class, superblocks[0], capacity - 4);
            assert_eq!(class.find_superblock_with_space(), Some(superblocks[1]));

            release_regions(regions);
        }
    }

    #[test]
    fn search_short_circuits_when_full() {
        unsafe {
            let (mut class, superblocks, regions) = class_with_superblocks(1);

            let capacity = superblocks[0].as_ref().data.total_count;
            drain(&mut class, superblocks[0], capacity);
            assert_eq!(class.used_blocks, class.total_blocks);
            assert!(class.find_superblock_with_space().is_none());

            release_regions(regions);
        }
    }

    #[test]
    fn bubbling_restores_sort_both_ways() {
        unsafe {
            let (mut class, superblocks, regions) = class_with_superblocks(3);

            drain(&mut class, superblocks[0], 1);
            drain(&mut class, superblocks[1], 2);

            // Take three blocks one by one, keeping the handles, and watch
            // the superblock bubble up to the head.
            let mut demoted = superblocks[2];
            let mut blocks = Vec::new();
            for _ in 0..3 {
                blocks.push(demoted.as_mut().take_free_block().unwrap());
                class.used_blocks += 1;
                class.bubble_toward_head(demoted);
            }
            assert_eq!(class.used_counts(), [3, 2, 1]);
            assert_eq!(class.superblocks.head, Some(demoted));

            // Two frees bubble it back toward the tail.
            for block in blocks.into_iter().take(2) {
                demoted.as_mut().put_free_block(block);
                class.used_blocks -= 1;
                class.bubble_toward_tail(demoted);
            }
            assert_eq!(class.used_counts(), [2, 1, 1]);

            // Ties don't swap: the demoted superblock stopped in front of
            // the equally used one, which keeps the tail.
            assert_eq!(demoted.as_ref().next, Some(superblocks[0]));
            assert_eq!(class.superblocks.tail, Some(superblocks[0]));

            release_regions(regions);
        }
    }

    #[test]
    fn migrate_transfers_statistics_and_owner() {
        unsafe {
            let (mut src, superblocks, regions) = class_with_superblocks(2);
            let mut dst = SizeClass::new();

            drain(&mut src, superblocks[0], 5);
            drain(&mut src, superblocks[1], 1);
            let total = superblocks[1].as_ref().data.total_count;

            migrate(&mut src, &mut dst, superblocks[1], 7);

            assert_eq!(src.used_blocks, 5);
            assert_eq!(src.total_blocks, total);
            assert_eq!(src.superblocks.len, 1);
            assert_eq!(dst.used_blocks, 1);
            assert_eq!(dst.total_blocks, total);
            assert_eq!(dst.superblocks.len, 1);
            assert_eq!(
                superblocks[1]
                    .as_ref()
                    .data
                    .owning_heap
                    .load(Ordering::Relaxed),
                7
            );

            release_regions(regions);
        }
    }
}
