//! Circular doubly-linked list of free blocks.
//!
//! The list is intrusive: its `next`/`prev` links are stored inside the free
//! blocks themselves (see [`Block::next_link`]), so the list owns nothing but
//! a head and a length. Order is insertion order around the ring, not size or
//! address order.
//!
//! ```text
//!          head
//!           │
//!           ▼
//!   ┌──▶ ┌─────┐ next ┌─────┐ next ┌─────┐ ──┐
//!   │    │  A  │ ───▶ │  B  │ ───▶ │  C  │   │
//!   │    └─────┘ ◀─── └─────┘ ◀─── └─────┘   │
//!   │       ▲    prev         prev           │
//!   └───────┼────────────────────────────────┘
//!           └── a new block is spliced in between C and A
//! ```

use log::trace;

use crate::block::{Block, Tag};

/// Head and length of the free ring.
///
/// `head` is `None` exactly when `len` is zero. `len` tracks membership
/// exactly: [`insert`](Self::insert) and [`remove`](Self::remove) are the only
/// places it changes.
#[derive(Debug, Default)]
pub struct FreeList {
    head: Option<Block>,
    len: usize,
}

impl FreeList {
    #[must_use]
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    #[must_use]
    pub const fn head(&self) -> Option<Block> {
        self.head
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Forgets every member without touching arena memory.
    pub fn clear(&mut self) {
        *self = Self::new();
    }

    /// Marks `block` free and splices it in just before `head`.
    ///
    /// `block` must carry a valid header and must not already be a member.
    pub fn insert(&mut self, mem: &mut [u8], block: Block) {
        let size = block.size(mem);
        block.set_tag(mem, Tag::free(size));

        match self.head {
            None => {
                block.set_next_link(mem, block);
                block.set_prev_link(mem, block);
                self.head = Some(block);
            }
            Some(head) => {
                let last = head.prev_link(mem);
                block.set_next_link(mem, head);
                block.set_prev_link(mem, last);
                last.set_next_link(mem, block);
                head.set_prev_link(mem, block);
            }
        }
        self.len += 1;

        trace!(
            "free list insert {:#x} size {size}, length {}",
            block.offset(),
            self.len
        );
    }

    /// Unsplices `block` from the ring.
    ///
    /// `block` must currently be a member; nothing checks this.
    pub fn remove(&mut self, mem: &mut [u8], block: Block) {
        let next = block.next_link(mem);
        let prev = block.prev_link(mem);

        if next == block {
            debug_assert_eq!(self.head, Some(block));
            self.head = None;
        } else {
            prev.set_next_link(mem, next);
            next.set_prev_link(mem, prev);
            if self.head == Some(block) {
                self.head = Some(next);
            }
        }
        self.len -= 1;

        trace!(
            "free list remove {:#x}, length {}",
            block.offset(),
            self.len
        );
    }

    /// Walks the ring once, starting at `head`.
    #[must_use]
    pub fn iter<'a>(&self, mem: &'a [u8]) -> Iter<'a> {
        Iter {
            mem,
            next: self.head,
            remaining: self.len,
        }
    }
}

/// Iterator over free blocks in list order.
pub struct Iter<'a> {
    mem: &'a [u8],
    next: Option<Block>,
    remaining: usize,
}

impl Iterator for Iter<'_> {
    type Item = Block;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let current = self.next?;
        self.next = Some(current.next_link(self.mem));
        self.remaining -= 1;
        Some(current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining))
    }
}
