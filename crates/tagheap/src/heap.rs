//! The allocator proper.
//!
//! [`Heap`] owns an [`Arena`] and the [`FreeList`] threaded through it.
//! Allocation is first-fit over the free list and falls back to growing the
//! arena. Freeing coalesces eagerly with both physical neighbours, so two free
//! blocks are never adjacent.
//!
//! A matched free block is handed out whole even when it is larger than the
//! request; blocks are never split.

use arena::Arena;
use log::{debug, trace, warn};
use snafu::{ResultExt as _, Snafu};
use snafu_utils::{Located, Location};

use crate::{
    block::{self, Block, BlockHandle, MIN_SIZE, OVERHEAD, Tag},
    check::{self, ConsistencyError, HeapView},
    free_list::FreeList,
};

#[derive(Debug, Snafu)]
pub enum AllocError {
    #[snafu(display("request of {requested} bytes overflows the block size computation"))]
    SizeOverflow {
        requested: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("arena cannot grow by {needed} bytes"))]
    Exhausted {
        needed: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Located for AllocError {
    fn location(&self) -> Location {
        match self {
            Self::SizeOverflow { location, .. } | Self::Exhausted { location, .. } => *location,
        }
    }
}

#[derive(Debug, Snafu)]
pub enum InitError {
    #[snafu(display("failed to seed the free list"))]
    Bootstrap {
        #[snafu(implicit)]
        location: Location,
        source: AllocError,
    },
}

impl Located for InitError {
    fn location(&self) -> Location {
        match self {
            Self::Bootstrap { location, .. } => *location,
        }
    }
}

/// A boundary-tag heap over a growable arena.
///
/// # Concurrency
///
/// There is no internal locking. Every mutating operation takes `&mut self`,
/// and callers that share a heap between threads must serialize access
/// themselves.
pub struct Heap<A> {
    arena: A,
    free_list: FreeList,
}

impl<A> Heap<A>
where
    A: Arena,
{
    /// Wraps `arena` without touching it. Call [`init`](Self::init) before
    /// use to start from a clean arena.
    #[must_use]
    pub const fn new(arena: A) -> Self {
        Self {
            arena,
            free_list: FreeList::new(),
        }
    }

    /// Wraps `arena` and runs [`init`](Self::init).
    pub fn with_arena(arena: A) -> Result<Self, InitError> {
        let mut heap = Self::new(arena);
        heap.init()?;
        Ok(heap)
    }

    /// Resets the arena and seeds the free list with one block.
    ///
    /// Every handle obtained before the call becomes invalid.
    pub fn init(&mut self) -> Result<(), InitError> {
        self.arena.reset();
        self.free_list.clear();

        let seed = self.try_allocate(MIN_SIZE).context(BootstrapSnafu)?;
        self.free(Some(seed));

        debug!(
            "heap initialized: {} bytes, {} free block(s)",
            self.arena.total_size(),
            self.free_list.len()
        );
        Ok(())
    }

    /// Allocates a block with room for at least `size` payload bytes.
    ///
    /// Returns `None` when the arena is exhausted or `size` is too large to
    /// represent.
    pub fn allocate(&mut self, size: usize) -> Option<BlockHandle> {
        self.try_allocate(size).ok()
    }

    /// Like [`allocate`](Self::allocate), reporting why it failed.
    pub fn try_allocate(&mut self, size: usize) -> Result<BlockHandle, AllocError> {
        let Some(needed) = block::needed_size(size) else {
            warn!("allocate: request of {size} bytes is too large");
            return SizeOverflowSnafu { requested: size }.fail();
        };

        let mem = self.arena.bytes();
        let fit = self
            .free_list
            .iter(mem)
            .find(|block| block.size(mem) >= needed);

        let block = match fit {
            Some(block) => {
                let mem = self.arena.bytes_mut();
                self.free_list.remove(mem, block);
                let size = block.size(mem);
                block.set_tag(mem, Tag::allocated(size));
                trace!(
                    "allocate: reuse block {:#x} size {size} for {needed}, free length {}",
                    block.offset(),
                    self.free_list.len()
                );
                block
            }
            None => self.extend(needed)?,
        };

        #[cfg(feature = "debug-check")]
        self.post_check();
        Ok(block.payload())
    }

    /// Grows the arena by exactly `needed` bytes and formats them as one
    /// allocated block.
    fn extend(&mut self, needed: usize) -> Result<Block, AllocError> {
        let Some(start) = self.arena.grow(needed) else {
            warn!(
                "arena exhausted: cannot grow {:#x}-byte heap by {needed} bytes",
                self.arena.total_size()
            );
            return ExhaustedSnafu { needed }.fail();
        };
        let block = Block::at(start);
        block.set_tag(self.arena.bytes_mut(), Tag::allocated(needed));
        debug!(
            "allocate: grew heap by {needed} bytes at {start:#x}, heap size {:#x}",
            self.arena.total_size()
        );
        Ok(block)
    }

    /// Returns a block to the free list, merging it with free neighbours.
    ///
    /// `None` is a no-op. `handle` must come from this heap and must not have
    /// been freed since it was allocated.
    pub fn free(&mut self, handle: Option<BlockHandle>) {
        let Some(handle) = handle else {
            return;
        };
        let lo = self.arena.lower_bound();
        let hi = self.arena.upper_bound();
        let mem = self.arena.bytes_mut();
        let list = &mut self.free_list;

        let block = Block::from_payload(handle);
        let size = block.size(mem);
        let prev = block
            .prev_physical(mem, lo)
            .filter(|prev| !prev.is_allocated(mem));
        let next = block
            .next_physical(mem, hi)
            .filter(|next| !next.is_allocated(mem));

        match (prev, next) {
            (Some(prev), Some(next)) => {
                list.remove(mem, prev);
                list.remove(mem, next);
                let merged = prev.size(mem) + size + next.size(mem);
                prev.set_tag(mem, Tag::free(merged));
                list.insert(mem, prev);
                trace!(
                    "free: {:#x} merged with both neighbours into {:#x} size {merged}",
                    block.offset(),
                    prev.offset()
                );
            }
            (Some(prev), None) => {
                list.remove(mem, prev);
                let merged = prev.size(mem) + size;
                prev.set_tag(mem, Tag::free(merged));
                list.insert(mem, prev);
                trace!(
                    "free: {:#x} merged with previous into {:#x} size {merged}",
                    block.offset(),
                    prev.offset()
                );
            }
            (None, Some(next)) => {
                list.remove(mem, next);
                let merged = size + next.size(mem);
                block.set_tag(mem, Tag::free(merged));
                list.insert(mem, block);
                trace!(
                    "free: {:#x} merged with next into size {merged}",
                    block.offset()
                );
            }
            (None, None) => {
                list.insert(mem, block);
                trace!("free: {:#x} size {size}", block.offset());
            }
        }

        #[cfg(feature = "debug-check")]
        self.post_check();
    }

    /// Moves the contents of `handle` into a fresh `size`-byte block.
    ///
    /// Copies `min(size, old payload)` bytes and frees the old block. A `None`
    /// handle is a plain allocation. On failure the old block is left alone.
    pub fn reallocate(&mut self, handle: Option<BlockHandle>, size: usize) -> Option<BlockHandle> {
        self.try_reallocate(handle, size).ok()
    }

    /// Like [`reallocate`](Self::reallocate), reporting why it failed.
    pub fn try_reallocate(
        &mut self,
        handle: Option<BlockHandle>,
        size: usize,
    ) -> Result<BlockHandle, AllocError> {
        let Some(old) = handle else {
            return self.try_allocate(size);
        };
        let new = self.try_allocate(size)?;

        let len = usize::min(size, self.payload(old).len());
        let src = old.offset();
        self.arena
            .bytes_mut()
            .copy_within(src..src + len, new.offset());
        trace!("reallocate: {old} -> {new}, copied {len} bytes");

        self.free(Some(old));
        Ok(new)
    }

    /// Runs the full consistency check over the heap and the free list.
    pub fn check(&self) -> Result<(), ConsistencyError> {
        let view = HeapView {
            mem: self.arena.bytes(),
            lo: self.arena.lower_bound(),
            hi: self.arena.upper_bound(),
            total: self.arena.total_size(),
        };
        check::check(&view, &self.free_list)
    }

    #[cfg(feature = "debug-check")]
    fn post_check(&self) {
        if let Err(err) = self.check() {
            log::error!("heap check failed: {err}");
            snafu_utils::report(err);
        }
    }

    /// The usable payload of an allocated block.
    ///
    /// Spans the whole block minus its header and footer, which may be more
    /// than was requested.
    #[must_use]
    pub fn payload(&self, handle: BlockHandle) -> &[u8] {
        let mem = self.arena.bytes();
        let len = Block::from_payload(handle).size(mem) - OVERHEAD;
        &mem[handle.offset()..handle.offset() + len]
    }

    #[must_use]
    pub fn payload_mut(&mut self, handle: BlockHandle) -> &mut [u8] {
        let mem = self.arena.bytes_mut();
        let len = Block::from_payload(handle).size(mem) - OVERHEAD;
        &mut mem[handle.offset()..handle.offset() + len]
    }

    /// Total size of the block behind `handle`, header and footer included.
    #[must_use]
    pub fn block_size(&self, handle: BlockHandle) -> usize {
        Block::from_payload(handle).size(self.arena.bytes())
    }

    #[must_use]
    pub fn free_len(&self) -> usize {
        self.free_list.len()
    }

    /// Free blocks in list order.
    pub fn free_blocks(&self) -> impl Iterator<Item = (Block, Tag)> + '_ {
        let mem = self.arena.bytes();
        self.free_list
            .iter(mem)
            .map(move |block| (block, block.tag(mem)))
    }

    /// Every block in address order.
    ///
    /// Stops early at a header with a zero size rather than looping.
    pub fn blocks(&self) -> impl Iterator<Item = (Block, Tag)> + '_ {
        let mem = self.arena.bytes();
        let lo = self.arena.lower_bound();
        let hi = self.arena.upper_bound();
        let first = (lo < hi).then_some(Block::at(lo));
        core::iter::successors(first, move |block| {
            if block.size(mem) == 0 {
                return None;
            }
            block.next_physical(mem, hi)
        })
        .map(move |block| (block, block.tag(mem)))
    }

    #[must_use]
    pub fn arena(&self) -> &A {
        &self.arena
    }

    /// Direct access to the arena, e.g. to restrict its growth.
    ///
    /// Moving the arena's bounds behind the heap's back breaks every
    /// invariant; only use this for knobs that leave the extent alone.
    pub fn arena_mut(&mut self) -> &mut A {
        &mut self.arena
    }

    /// Consumes the heap, handing back its arena.
    #[must_use]
    pub fn into_arena(self) -> A {
        self.arena
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::vec::Vec;

    use arena::{ArenaConfig, MemArena};

    use super::*;

    fn test_heap() -> Heap<MemArena> {
        let arena = MemArena::new(ArenaConfig::new(64 * 1024, 4096)).unwrap();
        let heap = Heap::with_arena(arena).unwrap();
        heap.check().unwrap();
        heap
    }

    fn allocate(heap: &mut Heap<MemArena>, size: usize) -> BlockHandle {
        let handle = heap.allocate(size).unwrap();
        heap.payload_mut(handle)[..size].fill(0x33);
        heap.check().unwrap();
        handle
    }

    fn free(heap: &mut Heap<MemArena>, handle: BlockHandle) {
        heap.free(Some(handle));
        heap.check().unwrap();
    }

    fn sizes(blocks: impl Iterator<Item = (Block, Tag)>) -> Vec<Tag> {
        blocks.map(|(_, tag)| tag).collect()
    }

    #[test]
    fn test_init_seeds_one_free_block() {
        let heap = test_heap();
        assert_eq!(heap.free_len(), 1);
        assert_eq!(heap.arena().total_size(), 48);
        assert_eq!(sizes(heap.blocks()), [Tag::free(48)]);
    }

    #[test]
    fn test_init_resets_previous_state() {
        let mut heap = test_heap();
        allocate(&mut heap, 100);
        allocate(&mut heap, 200);
        heap.init().unwrap();
        heap.check().unwrap();
        assert_eq!(heap.free_len(), 1);
        assert_eq!(heap.arena().total_size(), 48);
    }

    #[test]
    fn test_init_fails_without_arena() {
        let mut arena = MemArena::new(ArenaConfig::new(4096, 4096)).unwrap();
        arena.set_growth_enabled(false);
        let Err(err) = Heap::with_arena(arena) else {
            panic!("init must fail when the arena cannot grow");
        };
        assert!(matches!(
            err,
            InitError::Bootstrap {
                source: AllocError::Exhausted { needed: 48, .. },
                ..
            }
        ));
    }

    #[test]
    fn test_first_allocation_reuses_seed() {
        let mut heap = test_heap();
        let handle = allocate(&mut heap, 32);
        assert_eq!(handle.offset(), 8);
        assert_eq!(heap.block_size(handle), 48);
        assert_eq!(heap.free_len(), 0);
        assert_eq!(heap.arena().total_size(), 48);
    }

    #[test]
    fn test_miss_grows_by_exactly_needed() {
        let mut heap = test_heap();
        let handle = allocate(&mut heap, 100);
        assert_eq!(heap.block_size(handle), 120);
        assert_eq!(handle.offset(), 48 + 8);
        assert_eq!(heap.arena().total_size(), 48 + 120);
        assert_eq!(heap.free_len(), 1);
    }

    #[test]
    fn test_zero_sized_allocation_gets_min_block() {
        let mut heap = test_heap();
        let handle = allocate(&mut heap, 0);
        assert_eq!(heap.block_size(handle), 48);
        let handle = heap.allocate(0).unwrap();
        assert_eq!(heap.block_size(handle), MIN_SIZE);
        assert_eq!(heap.payload(handle).len(), MIN_SIZE - OVERHEAD);
    }

    #[test]
    fn test_oversized_request_is_rejected() {
        let mut heap = test_heap();
        assert!(matches!(
            heap.try_allocate(usize::MAX),
            Err(AllocError::SizeOverflow {
                requested: usize::MAX,
                ..
            })
        ));
        assert_eq!(heap.allocate(usize::MAX - 4), None);
        heap.check().unwrap();
        assert_eq!(heap.arena().total_size(), 48);
    }

    #[test]
    fn test_free_none_is_noop() {
        let mut heap = test_heap();
        heap.free(None);
        heap.check().unwrap();
        assert_eq!(heap.free_len(), 1);
    }

    #[test]
    fn test_free_without_free_neighbours() {
        let mut heap = test_heap();
        let a = allocate(&mut heap, 32);
        let b = allocate(&mut heap, 32);
        let _c = allocate(&mut heap, 32);
        free(&mut heap, b);
        assert_eq!(heap.free_len(), 1);
        free(&mut heap, a);
        // a merges forward into b
        assert_eq!(heap.free_len(), 1);
        assert_eq!(sizes(heap.free_blocks()), [Tag::free(96)]);
    }

    #[test]
    fn test_free_merges_with_previous() {
        let mut heap = test_heap();
        let a = allocate(&mut heap, 32);
        let b = allocate(&mut heap, 32);
        let _c = allocate(&mut heap, 32);
        free(&mut heap, a);
        free(&mut heap, b);
        assert_eq!(heap.free_len(), 1);
        assert_eq!(
            sizes(heap.blocks()),
            [Tag::free(96), Tag::allocated(48)]
        );
    }

    #[test]
    fn test_free_merges_with_next() {
        let mut heap = test_heap();
        let _a = allocate(&mut heap, 32);
        let b = allocate(&mut heap, 32);
        let c = allocate(&mut heap, 32);
        let _d = allocate(&mut heap, 32);
        free(&mut heap, c);
        free(&mut heap, b);
        assert_eq!(heap.free_len(), 1);
        assert_eq!(
            sizes(heap.blocks()),
            [
                Tag::allocated(48),
                Tag::free(96),
                Tag::allocated(48)
            ]
        );
    }

    #[test]
    fn test_free_merges_with_both() {
        let mut heap = test_heap();
        let _a = allocate(&mut heap, 32);
        let b = allocate(&mut heap, 32);
        let c = allocate(&mut heap, 32);
        let d = allocate(&mut heap, 32);
        let _e = allocate(&mut heap, 32);
        free(&mut heap, b);
        free(&mut heap, d);
        assert_eq!(heap.free_len(), 2);
        free(&mut heap, c);
        assert_eq!(heap.free_len(), 1);
        assert_eq!(
            sizes(heap.blocks()),
            [
                Tag::allocated(48),
                Tag::free(144),
                Tag::allocated(48)
            ]
        );
    }

    #[test]
    fn test_free_last_block_everything_merges() {
        let mut heap = test_heap();
        let handles = [32, 64, 128, 8]
            .into_iter()
            .map(|size| allocate(&mut heap, size))
            .collect::<Vec<_>>();
        for handle in handles {
            free(&mut heap, handle);
        }
        assert_eq!(heap.free_len(), 1);
        let total = heap.arena().total_size();
        assert_eq!(sizes(heap.blocks()), [Tag::free(total)]);
    }

    #[test]
    fn test_first_fit_picks_first_large_enough() {
        let mut heap = test_heap();
        let a = allocate(&mut heap, 32);
        let _s1 = allocate(&mut heap, 8);
        let b = allocate(&mut heap, 64);
        let _s2 = allocate(&mut heap, 8);
        let c = allocate(&mut heap, 128);
        let _s3 = allocate(&mut heap, 8);
        free(&mut heap, a);
        free(&mut heap, b);
        free(&mut heap, c);
        let payloads = heap
            .free_blocks()
            .map(|(_, tag)| tag.size - OVERHEAD)
            .collect::<Vec<_>>();
        assert_eq!(payloads, [32, 64, 128]);

        let handle = allocate(&mut heap, 50);
        assert_eq!(handle, b);
        assert_eq!(heap.free_len(), 2);
    }

    #[test]
    fn test_no_split_on_oversized_match() {
        let mut heap = test_heap();
        let _seed = allocate(&mut heap, 32);
        let big = allocate(&mut heap, 112);
        let _guard = allocate(&mut heap, 8);
        free(&mut heap, big);
        assert_eq!(sizes(heap.free_blocks()), [Tag::free(128)]);

        let handle = allocate(&mut heap, 8);
        assert_eq!(handle, big);
        assert_eq!(heap.block_size(handle), 128);
        assert_eq!(heap.payload(handle).len(), 112);
        assert_eq!(heap.free_len(), 0);
    }

    #[cfg(feature = "debug-check")]
    #[test]
    #[should_panic(expected = "Critical error occurred")]
    fn test_corruption_is_fatal_after_mutation() {
        let mut heap = test_heap();
        let a = allocate(&mut heap, 32);
        let _b = allocate(&mut heap, 32);
        let c = allocate(&mut heap, 32);
        // Clobber the footer of `a`; freeing `c` never looks at it.
        let footer = Block::from_payload(a).footer(heap.arena().bytes());
        heap.arena_mut().bytes_mut()[footer..footer + 8].fill(0xff);
        heap.free(Some(c));
    }

    #[test]
    fn test_exhaustion_leaves_heap_untouched() {
        let mut heap = test_heap();
        let _seed = allocate(&mut heap, 32);
        heap.arena_mut().set_growth_enabled(false);
        assert!(matches!(
            heap.try_allocate(100),
            Err(AllocError::Exhausted { needed: 120, .. })
        ));
        assert_eq!(heap.allocate(100), None);
        heap.check().unwrap();
        assert_eq!(heap.arena().total_size(), 48);
        assert_eq!(heap.free_len(), 0);
    }

    #[test]
    fn test_reallocate_shrink_keeps_prefix() {
        let mut heap = test_heap();
        let handle = allocate(&mut heap, 100);
        let pattern = (0..100).collect::<Vec<u8>>();
        heap.payload_mut(handle)[..100].copy_from_slice(&pattern);
        let shrunk = heap.reallocate(Some(handle), 40).unwrap();
        heap.check().unwrap();
        assert_ne!(shrunk, handle);
        assert_eq!(heap.payload(shrunk)[..40], pattern[..40]);
    }

    #[test]
    fn test_reallocate_grow_keeps_all_bytes() {
        let mut heap = test_heap();
        let handle = allocate(&mut heap, 40);
        let pattern = (0x80..0x80 + 40).collect::<Vec<u8>>();
        heap.payload_mut(handle)[..40].copy_from_slice(&pattern);
        let grown = heap.reallocate(Some(handle), 100).unwrap();
        heap.check().unwrap();
        assert!(heap.payload(grown).len() >= 100);
        assert_eq!(heap.payload(grown)[..40], pattern[..]);
    }

    #[test]
    fn test_reallocate_none_allocates() {
        let mut heap = test_heap();
        let handle = heap.reallocate(None, 24).unwrap();
        heap.check().unwrap();
        assert_eq!(heap.block_size(handle), 48);
        assert_eq!(heap.free_len(), 0);
    }

    #[test]
    fn test_reallocate_failure_keeps_old_block() {
        let mut heap = test_heap();
        let handle = allocate(&mut heap, 40);
        heap.payload_mut(handle)[..4].copy_from_slice(b"keep");
        heap.arena_mut().set_growth_enabled(false);

        assert_eq!(heap.reallocate(Some(handle), 1000), None);
        heap.check().unwrap();
        assert_eq!(&heap.payload(handle)[..4], b"keep");
        assert!(
            heap.blocks()
                .any(|(block, tag)| block.payload() == handle && tag.allocated)
        );
    }

    #[test]
    fn test_freed_space_is_reused() {
        let mut heap = test_heap();
        let handles = (0..16)
            .map(|_| allocate(&mut heap, 64))
            .collect::<Vec<_>>();
        let size = heap.arena().total_size();
        for &handle in handles.iter().step_by(2) {
            free(&mut heap, handle);
        }
        assert_eq!(heap.free_len(), 8);
        for _ in 0..8 {
            allocate(&mut heap, 64);
        }
        assert_eq!(heap.arena().total_size(), size);
        assert_eq!(heap.free_len(), 0);
    }
}
