use std::{mem, ptr::NonNull, sync::atomic::AtomicUsize};

use crate::{
    block::{Block, BLOCK_HEADER_SIZE},
    class::class_block_size,
    freelist::FreeList,
    header::Header,
    Pointer,
};

/// Superblock size in bytes, including its header. Every superblock is
/// exactly this big, which keeps the page source interface trivial and makes
/// block counts per class a compile time fact.
pub(crate) const SUPERBLOCK_SIZE: usize = 65536;

/// Superblock header size in bytes. The block area starts right after.
pub(crate) const SUPERBLOCK_HEADER_SIZE: usize = mem::size_of::<Header<Superblock>>();

const _: () = assert!(SUPERBLOCK_SIZE.is_power_of_two());
const _: () = assert!(SUPERBLOCK_HEADER_SIZE < SUPERBLOCK_SIZE / 2);

/// Superblock specific data. The complete header is [`Header<Superblock>`],
/// a linked list node like in [`crate::list`], because superblocks spend
/// their whole life on the fullness-sorted list of exactly one size class.
/// The header sits at the base of the mapped region and the rest is carved
/// into equally sized blocks at init:
///
/// ```text
/// +-----------------------------+ <- base (page aligned)
/// | next / prev superblock      |
/// | used_count   total_count    |
/// | free list head              |
/// | owning heap    class        |
/// +-----------------------------+ <- base + SUPERBLOCK_HEADER_SIZE
/// | block header | block payload|
/// +-----------------------------+
/// | block header | block payload|
/// +-----------------------------+
/// |             ...             |
/// +-----------------------------+ <- at most base + SUPERBLOCK_SIZE
/// ```
///
/// Block headers steal space from the superblock rather than from the
/// payloads, so a class `c` block can really hold `2^c` bytes. The leftover
/// tail that doesn't fit a whole `header + payload` slot is wasted; for the
/// largest class that means a superblock holds a single block.
///
/// `used_count`, `total_count` and `free_blocks` are guarded by the lock of
/// the size class that currently lists this superblock. `owning_heap` names
/// that class's heap and is atomic because the free path has to read it
/// *before* it can take the class lock: it loads the index, locks the class,
/// then re-reads to make sure the superblock didn't migrate in between. See
/// [`crate::allocator`].
pub(crate) struct Superblock {
    /// Blocks currently handed out.
    pub used_count: usize,
    /// Blocks this superblock was carved into.
    pub total_count: usize,
    /// The `total_count - used_count` free blocks.
    pub free_blocks: FreeList,
    /// Index of the heap whose class list currently holds this superblock.
    pub owning_heap: AtomicUsize,
    /// Size class index, same in every heap.
    pub class: usize,
    /// Keeps the header size a multiple of every alignment the front end
    /// honors, see `MAX_SUPPORTED_ALIGN` in [`crate::allocator`].
    _pad: Padding,
}

#[repr(align(64))]
struct Padding;

/// Number of blocks a superblock of the given class is carved into.
pub(crate) const fn block_capacity(class: usize) -> usize {
    (SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE) / (BLOCK_HEADER_SIZE + class_block_size(class))
}

impl Superblock {
    /// Writes a fresh superblock header at the base of `region` and carves
    /// the remainder into blocks of the given class, all free, linked in
    /// address order. The caller links the returned header into a class list
    /// and owns all further bookkeeping.
    ///
    /// # Safety
    ///
    /// `region` must point to the base of a writable region of at least
    /// [`SUPERBLOCK_SIZE`] bytes obtained from [`crate::platform`], not used
    /// for anything else.
    pub unsafe fn carve(
        region: NonNull<u8>,
        class: usize,
        owning_heap: usize,
    ) -> NonNull<Header<Superblock>> {
        let superblock = region.cast::<Header<Superblock>>();
        let capacity = block_capacity(class);
        let block_size = class_block_size(class);

        superblock.as_ptr().write(Header {
            next: None,
            prev: None,
            data: Superblock {
                used_count: 0,
                total_count: capacity,
                free_blocks: FreeList::new(),
                owning_heap: AtomicUsize::new(owning_heap),
                class,
                _pad: Padding,
            },
        });

        // Stamp the block headers back to front so that each one can link to
        // its successor and the free list ends up in address order.
        let blocks_base = Header::content_address_of(superblock).as_ptr();
        let stride = BLOCK_HEADER_SIZE + block_size;
        let mut next: Pointer<Block> = None;

        for index in (0..capacity).rev() {
            let block = blocks_base.add(index * stride).cast::<Block>();
            block.write(Block {
                size: block_size,
                is_free: true,
                next_free: next,
                superblock: Some(superblock),
            });
            next = Some(NonNull::new_unchecked(block));
        }

        (*superblock.as_ptr()).data.free_blocks.head = next;

        superblock
    }
}

impl Header<Superblock> {
    /// Hands out a free block, or `None` if the superblock is full. Caller
    /// must hold the owning class lock and keep the class counters in sync.
    pub unsafe fn take_free_block(&mut self) -> Pointer<Block> {
        let block = self.data.free_blocks.pop()?;
        self.data.used_count += 1;
        Some(block)
    }

    /// Returns `block` to the free list. Caller must hold the owning class
    /// lock, keep the class counters in sync and guarantee that `block` was
    /// carved from this superblock.
    pub unsafe fn put_free_block(&mut self, block: NonNull<Block>) {
        debug_assert!(block.as_ref().superblock == Some(NonNull::from(&*self)));
        debug_assert!(self.data.used_count > 0);

        self.data.free_blocks.push(block);
        self.data.used_count -= 1;
    }

    /// Whether every block is handed out.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.data.used_count == self.data.total_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{class::MIN_CLASS_INDEX, platform};

    unsafe fn carved_superblock(class: usize) -> (NonNull<u8>, NonNull<Header<Superblock>>) {
        let region = platform::request_memory(SUPERBLOCK_SIZE).unwrap();
        (region, Superblock::carve(region, class, 0))
    }

    #[test]
    fn carving_layout() {
        unsafe {
            let (region, superblock) = carved_superblock(5);
            let expected_capacity =
                (SUPERBLOCK_SIZE - SUPERBLOCK_HEADER_SIZE) / (BLOCK_HEADER_SIZE + 32);

            let superblock = &mut *superblock.as_ptr();
            assert_eq!(superblock.data.total_count, expected_capacity);
            assert_eq!(superblock.data.used_count, 0);
            assert_eq!(superblock.data.free_blocks.len(), expected_capacity);

            // The free list holds every block in address order, each one
            // stamped with its class size and back-pointer.
            let mut expected_address =
                Header::content_address_of(NonNull::from(&*superblock)).as_ptr();
            let mut current = superblock.data.free_blocks.head;
            while let Some(block) = current {
                assert_eq!(block.as_ptr().cast::<u8>(), expected_address);
                assert_eq!(block.as_ref().size, 32);
                assert!(block.as_ref().is_free);
                assert_eq!(
                    block.as_ref().superblock.unwrap().as_ptr(),
                    superblock as *mut _
                );
                expected_address = expected_address.add(BLOCK_HEADER_SIZE + 32);
                current = block.as_ref().next_free;
            }

            // The carved area never runs past the superblock.
            let base = superblock as *mut Header<Superblock> as usize;
            assert!(expected_address as usize <= base + SUPERBLOCK_SIZE);

            platform::return_memory(region, SUPERBLOCK_SIZE);
        }
    }

    #[test]
    fn largest_class_holds_one_block() {
        unsafe {
            let (region, superblock) = carved_superblock(15);
            assert_eq!(superblock.as_ref().data.total_count, 1);

            let superblock = &mut *superblock.as_ptr();
            let block = superblock.take_free_block().unwrap();
            assert_eq!(block.as_ref().size, 32768);
            assert!(superblock.is_full());
            assert!(superblock.take_free_block().is_none());

            platform::return_memory(region, SUPERBLOCK_SIZE);
        }
    }

    #[test]
    fn take_and_put_roundtrip() {
        unsafe {
            let (region, superblock) = carved_superblock(MIN_CLASS_INDEX);
            let superblock = &mut *superblock.as_ptr();
            let total = superblock.data.total_count;

            let block = superblock.take_free_block().unwrap();
            assert_eq!(superblock.data.used_count, 1);
            assert!(!block.as_ref().is_free);
            assert_eq!(superblock.data.free_blocks.len(), total - 1);

            superblock.put_free_block(block);
            assert_eq!(superblock.data.used_count, 0);
            assert!(block.as_ref().is_free);
            assert_eq!(superblock.data.free_blocks.len(), total);

            platform::return_memory(region, SUPERBLOCK_SIZE);
        }
    }
}
