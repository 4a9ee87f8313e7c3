use std::{mem, ptr::NonNull};

use crate::{header::Header, superblock::Superblock, Pointer};

/// Block header size in bytes. The payload handed to the user starts exactly
/// this many bytes after the header address.
pub(crate) const BLOCK_HEADER_SIZE: usize = mem::size_of::<Block>();

/// In-line metadata stamped in front of every block. Here's a graphical
/// representation of how it looks like in memory:
///
/// ```text
/// +----------------------------+
/// | block size                 |   <------+
/// +----------------------------+          |
/// | is free flag               |          |
/// +----------------------------+          | Block
/// | next block in free list    |          |
/// +----------------------------+          |
/// | owning superblock          |   <------+
/// +----------------------------+
/// |       Block payload        |   <------+
/// |            ...             |          | This is where the user writes
/// |            ...             |          | stuff, up to `size` bytes.
/// |            ...             |   <------+
/// +----------------------------+
/// ```
///
/// For small blocks, `size` is the exact power of two of the owning size
/// class and `superblock` points back at the superblock the block was carved
/// from, for its entire lifetime. Large blocks obtained straight from the
/// page source reuse the same header shape with the requested size and no
/// owning superblock; the free path tells them apart by comparing `size`
/// against the large threshold, see [`crate::allocator`].
///
/// `next_free` threads the block through its superblock's free list while
/// the block is not in use. The payload belongs to the caller between
/// allocation and free, so the link has to live in the header rather than in
/// the payload.
pub(crate) struct Block {
    /// Usable payload size in bytes.
    pub size: usize,
    /// Whether this block is on a free list or handed out.
    pub is_free: bool,
    /// Next block in the owning superblock's free list.
    pub next_free: Pointer<Block>,
    /// Superblock this block was carved from. `None` for large blocks.
    pub superblock: Pointer<Header<Superblock>>,
}

impl Block {
    /// Returns a pointer to a [`Block`] given an address that points right
    /// after a valid [`Block`] header.
    ///
    /// # Safety
    ///
    /// Caller must guarantee that the given address points exactly to the
    /// first memory cell after a [`Block`] header. This function will mostly
    /// be used for deallocating memory, so the allocator user should give us
    /// an address that we previously allocated. As long as that's true, this
    /// is safe, otherwise it's undefined behaviour.
    #[inline]
    pub unsafe fn from_payload_address(address: NonNull<u8>) -> NonNull<Self> {
        NonNull::new_unchecked(address.as_ptr().cast::<Self>().offset(-1))
    }

    /// Returns the payload address of `block`, the one the user receives.
    #[inline]
    pub unsafe fn payload_address_of(block: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(block.as_ptr().offset(1)).cast()
    }

    /// Index of the size class this block belongs to. Small blocks only,
    /// their size is the exact power of two of their class.
    #[inline]
    pub fn class_index(&self) -> usize {
        debug_assert!(self.size.is_power_of_two());
        self.size.trailing_zeros() as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_address_roundtrip() {
        unsafe {
            // usize backing keeps the buffer aligned for a Block header.
            let mut backing = [0usize; BLOCK_HEADER_SIZE / mem::size_of::<usize>() * 2];
            let block = NonNull::from(&mut backing).cast::<Block>();

            block.as_ptr().write(Block {
                size: 32,
                is_free: false,
                next_free: None,
                superblock: None,
            });

            let payload = Block::payload_address_of(block);
            assert_eq!(
                payload.as_ptr() as usize - block.as_ptr() as usize,
                BLOCK_HEADER_SIZE
            );
            assert_eq!(Block::from_payload_address(payload), block);
        }
    }

    #[test]
    fn class_index_from_size() {
        let block = Block {
            size: 4096,
            is_free: true,
            next_free: None,
            superblock: None,
        };
        assert_eq!(block.class_index(), 12);
    }
}
