//! Boundary-tag block layout.
//!
//! Every block starts with a header word and ends with a footer word holding
//! the same tag: the block size with the allocated flag packed into bit 0.
//! Sizes are multiples of [`ALIGN`], so the low bits of a size are always
//! zero and free to carry the flag.
//!
//! ```text
//! Allocated block:
//! ┌────────────┬──────────────────────────────────────┬────────────┐
//! │ size | 1   │ payload (caller data)                │ size | 1   │
//! └────────────┴──────────────────────────────────────┴────────────┘
//!  ▲            ▲
//!  block        BlockHandle
//!
//! Free block:
//! ┌────────────┬────────────┬────────────┬────────────┬────────────┐
//! │ size | 0   │ next link  │ prev link  │ (unused)   │ size | 0   │
//! └────────────┴────────────┴────────────┴────────────┴────────────┘
//! ```
//!
//! The footer is what makes [`Block::prev_physical`] O(1): the word right
//! before a header is the previous block's footer, which holds its size.
//!
//! Blocks are addressed by the arena offset of their header. All accessors
//! take the arena bytes explicitly; nothing here owns memory.

use core::fmt;

/// Payload alignment and the granule every block size is a multiple of.
pub const ALIGN: usize = 8;

/// Size of one boundary tag or free-list link.
pub const WORD: usize = 8;

/// Header plus footer.
pub const OVERHEAD: usize = 2 * WORD;

/// Smallest block: header, two links and footer.
pub const MIN_SIZE: usize = 4 * ALIGN;

const _: () = assert!(MIN_SIZE >= OVERHEAD + 2 * WORD);
const _: () = assert!(WORD.is_multiple_of(ALIGN));

const ALLOCATED_BIT: u64 = 0x1;
const FLAG_MASK: u64 = (ALIGN as u64) - 1;

/// Rounds `size` up to a multiple of [`ALIGN`].
#[must_use]
pub const fn align(size: usize) -> Option<usize> {
    size.checked_next_multiple_of(ALIGN)
}

/// Block size needed to hold a `request`-byte payload.
///
/// Returns `None` if the computation overflows.
#[must_use]
pub const fn needed_size(request: usize) -> Option<usize> {
    let Some(payload) = align(request) else {
        return None;
    };
    let Some(size) = payload.checked_add(OVERHEAD) else {
        return None;
    };
    if size < MIN_SIZE {
        Some(MIN_SIZE)
    } else {
        Some(size)
    }
}

/// Decoded contents of a header or footer word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub size: usize,
    pub allocated: bool,
}

impl Tag {
    #[must_use]
    pub const fn free(size: usize) -> Self {
        Self {
            size,
            allocated: false,
        }
    }

    #[must_use]
    pub const fn allocated(size: usize) -> Self {
        Self {
            size,
            allocated: true,
        }
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub const fn decode(word: u64) -> Self {
        Self {
            size: (word & !FLAG_MASK) as usize,
            allocated: word & ALLOCATED_BIT != 0,
        }
    }

    #[must_use]
    pub const fn encode(self) -> u64 {
        debug_assert!(self.size.is_multiple_of(ALIGN));
        let flag = if self.allocated { ALLOCATED_BIT } else { 0 };
        self.size as u64 | flag
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}|{}]", self.size, u8::from(self.allocated))
    }
}

/// Caller-facing handle to an allocated payload.
///
/// The wrapped value is the arena offset of the first payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, derive_more::Display)]
#[display("{_0:#x}")]
pub struct BlockHandle(usize);

impl BlockHandle {
    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }
}

/// A block, named by the arena offset of its header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Block(usize);

fn read_word(mem: &[u8], offset: usize) -> u64 {
    let mut word = [0; WORD];
    word.copy_from_slice(&mem[offset..offset + WORD]);
    u64::from_ne_bytes(word)
}

fn write_word(mem: &mut [u8], offset: usize, value: u64) {
    mem[offset..offset + WORD].copy_from_slice(&value.to_ne_bytes());
}

impl Block {
    #[must_use]
    pub const fn at(offset: usize) -> Self {
        Self(offset)
    }

    #[must_use]
    pub const fn offset(self) -> usize {
        self.0
    }

    /// The block whose payload starts at `handle`.
    #[must_use]
    pub const fn from_payload(handle: BlockHandle) -> Self {
        Self(handle.0 - WORD)
    }

    #[must_use]
    pub const fn payload(self) -> BlockHandle {
        BlockHandle(self.0 + WORD)
    }

    #[must_use]
    pub fn tag(self, mem: &[u8]) -> Tag {
        Tag::decode(read_word(mem, self.0))
    }

    #[must_use]
    pub fn size(self, mem: &[u8]) -> usize {
        self.tag(mem).size
    }

    #[must_use]
    pub fn is_allocated(self, mem: &[u8]) -> bool {
        self.tag(mem).allocated
    }

    /// Offset of the footer word, derived from the size in the header.
    #[must_use]
    pub fn footer(self, mem: &[u8]) -> usize {
        self.0 + self.size(mem) - WORD
    }

    #[must_use]
    pub fn footer_tag(self, mem: &[u8]) -> Tag {
        Tag::decode(read_word(mem, self.footer(mem)))
    }

    /// Writes `tag` to both the header and the footer `tag.size` bytes on.
    pub fn set_tag(self, mem: &mut [u8], tag: Tag) {
        let word = tag.encode();
        write_word(mem, self.0, word);
        write_word(mem, self.0 + tag.size - WORD, word);
    }

    pub fn set_size_and_flag(self, mem: &mut [u8], size: usize, allocated: bool) {
        self.set_tag(mem, Tag { size, allocated });
    }

    /// The block physically after this one, if it starts before `hi`.
    #[must_use]
    pub fn next_physical(self, mem: &[u8], hi: usize) -> Option<Self> {
        let next = self.0 + self.size(mem);
        (next < hi).then_some(Self(next))
    }

    /// The block physically before this one, found through its footer.
    ///
    /// `None` when this block is the first one in the arena.
    #[must_use]
    pub fn prev_physical(self, mem: &[u8], lo: usize) -> Option<Self> {
        let footer = self.0.checked_sub(WORD).filter(|&footer| footer >= lo)?;
        let prev_size = Tag::decode(read_word(mem, footer)).size;
        self.0
            .checked_sub(prev_size)
            .filter(|&prev| prev >= lo)
            .map(Self)
    }

    // Free-list links live in the first two payload words of a free block.
    // These four accessors are the only code that reads payload bytes as
    // links.

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn next_link(self, mem: &[u8]) -> Self {
        Self(read_word(mem, self.0 + WORD) as usize)
    }

    #[must_use]
    #[expect(clippy::cast_possible_truncation)]
    pub fn prev_link(self, mem: &[u8]) -> Self {
        Self(read_word(mem, self.0 + 2 * WORD) as usize)
    }

    pub fn set_next_link(self, mem: &mut [u8], next: Self) {
        write_word(mem, self.0 + WORD, next.0 as u64);
    }

    pub fn set_prev_link(self, mem: &mut [u8], prev: Self) {
        write_word(mem, self.0 + 2 * WORD, prev.0 as u64);
    }
}
