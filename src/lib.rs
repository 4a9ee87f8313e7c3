//! Thread-aware general purpose allocator in the Hoard design. Allocation
//! state is partitioned across per-CPU heaps, each sharded by power-of-two
//! size class. Every class owns a list of fixed-size superblocks sorted by
//! fullness, and under-utilized superblocks are reclaimed into a shared
//! global heap so that memory freed on one CPU heap can satisfy another
//! heap's allocations. Requests larger than half a superblock skip the heaps
//! entirely and go straight to the OS.
//!
//! Reading order: [`platform`], [`list`], [`header`], [`block`],
//! [`freelist`], [`superblock`], [`class`], [`heap`] and finally
//! [`allocator`], which ties everything together.

use std::ptr::NonNull;

mod allocator;
mod block;
mod class;
mod freelist;
mod header;
mod heap;
mod list;
mod platform;
mod superblock;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the `None`
/// case. I think variance doesn't have much implications here except for
/// [`list::LinkedList<T>`], but that should probably be covariant anyway.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::Shalloc;
