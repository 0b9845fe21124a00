//! A boundary-tag heap allocator over a growable arena.
//!
//! The heap carves an [`Arena`](arena::Arena) into variable-sized blocks. Each
//! block carries its size and allocated flag in a header and a mirrored footer,
//! so both physical neighbours of a block can be found in constant time. Free
//! blocks are threaded onto a circular doubly-linked list whose links live in
//! the free blocks' own payloads.
//!
//! # Policies
//!
//! - **First fit**: [`Heap::allocate`] takes the first free block in list order
//!   that is large enough, and hands it out whole. Blocks are never split.
//! - **Eager coalescing**: [`Heap::free`] merges a block with any free physical
//!   neighbour immediately, so two free blocks are never adjacent.
//! - **Exact growth**: on a miss the arena grows by exactly the size of the
//!   new block.
//! - **Copying reallocation**: [`Heap::reallocate`] always allocates a new
//!   block, copies, and frees the old one.
//!
//! [`Heap::check`] walks the whole heap and the whole free list and reports the
//! first broken invariant it finds. With the `debug-check` feature enabled the
//! check runs after every mutating operation and panics on failure.
//!
//! # Usage Example
//!
//! ```rust
//! use arena::{ArenaConfig, MemArena};
//! use tagheap::Heap;
//!
//! let arena = MemArena::new(ArenaConfig::default()).unwrap();
//! let mut heap = Heap::with_arena(arena).unwrap();
//!
//! let handle = heap.allocate(100).unwrap();
//! heap.payload_mut(handle)[..5].copy_from_slice(b"hello");
//!
//! let handle = heap.reallocate(Some(handle), 200).unwrap();
//! assert_eq!(&heap.payload(handle)[..5], b"hello");
//!
//! heap.free(Some(handle));
//! heap.check().unwrap();
//! ```

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub use self::{
    block::{Block, BlockHandle, Tag},
    check::ConsistencyError,
    heap::{AllocError, Heap, InitError},
};

pub mod block;
pub mod check;
pub mod free_list;
pub mod heap;
