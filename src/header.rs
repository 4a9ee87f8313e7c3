use std::ptr::NonNull;

use crate::list::Node;

/// Superblock headers point to their previous and next superblock, so we
/// might as well consider them linked list nodes. This is just a type alias
/// that we use when we want to refer to a superblock header without thinking
/// about linked list nodes.
pub(crate) type Header<T> = Node<T>;

impl<T> Header<T> {
    /// Returns the address after the header.
    ///
    /// ```text
    /// +-------------+
    /// |  Header<T>  | <- Header<T> struct.
    /// +-------------+
    /// |   Content   | <- Returned address points to the first cell after header.
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// |     ...     |
    /// +-------------+
    /// ```
    ///
    /// # Safety
    ///
    /// If `header` is a valid [`NonNull<Header<T>>`], the offset will return
    /// an address that points right after the header. That address is safe to
    /// use as long as the region the header sits in extends far enough past
    /// it, which for superblocks is the rest of the mapped area. See
    /// [`crate::superblock`].
    ///
    /// # Notes
    ///
    /// - We are using this function as `Header::content_address_of(header)`
    /// instead of `header.content_address()` because we want to avoid creating
    /// intermediary references to `self` to keep Miri happy. See
    /// [Stacked Borrows](https://github.com/rust-lang/unsafe-code-guidelines/blob/master/wip/stacked-borrows.md).
    #[inline]
    pub unsafe fn content_address_of(header: NonNull<Self>) -> NonNull<u8> {
        NonNull::new_unchecked(header.as_ptr().offset(1)).cast()
    }
}
