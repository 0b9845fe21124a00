//! Heap and free-list consistency checker.
//!
//! The checker never trusts the structures it inspects: every offset read out
//! of the arena is bounds-checked before it is followed, so a corrupted heap
//! produces a [`ConsistencyError`] instead of a panic or an endless walk.

use snafu::{Snafu, ensure};
use snafu_utils::{Located, Location};

use crate::{
    block::{ALIGN, Block, MIN_SIZE, Tag, WORD},
    free_list::FreeList,
};

#[derive(Debug, Snafu)]
pub enum ConsistencyError {
    #[snafu(display("free list head {offset:#x} is malformed: header {header}, footer {footer}"))]
    MalformedHead {
        offset: usize,
        header: Tag,
        footer: Tag,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "free list node #{index} at {offset:#x} is not free: header {header}, footer {footer}"
    ))]
    AllocatedInFreeList {
        index: usize,
        offset: usize,
        header: Tag,
        footer: Tag,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at {offset:#x} has mismatched header {header} and footer {footer}"))]
    TagMismatch {
        offset: usize,
        header: Tag,
        footer: Tag,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "free block at {offset:#x} has invalid links: next {next:#x}, prev {prev:#x}"
    ))]
    InvalidLink {
        offset: usize,
        next: usize,
        prev: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "free block at {offset:#x} links to {next:#x}, which links back to {back:#x}"
    ))]
    BrokenBackLink {
        offset: usize,
        next: usize,
        back: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("block at {offset:#x} has corrupt size {size} (heap ends at {hi:#x})"))]
    CorruptBlock {
        offset: usize,
        size: usize,
        hi: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "free blocks at {first:#x} (size {first_size}) and {second:#x} (size {second_size}) are contiguous"
    ))]
    ContiguousFree {
        first: usize,
        first_size: usize,
        second: usize,
        second_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("blocks account for {counted} bytes, arena holds {expected}"))]
    HeapSizeMismatch {
        counted: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("heap holds {counted} free blocks, free list length is {expected}"))]
    LengthMismatch {
        counted: usize,
        expected: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display("free list reaches {listed} blocks, heap holds {counted} free blocks"))]
    UnlistedFree {
        listed: usize,
        counted: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Located for ConsistencyError {
    fn location(&self) -> Location {
        match self {
            Self::MalformedHead { location, .. }
            | Self::AllocatedInFreeList { location, .. }
            | Self::TagMismatch { location, .. }
            | Self::InvalidLink { location, .. }
            | Self::BrokenBackLink { location, .. }
            | Self::CorruptBlock { location, .. }
            | Self::ContiguousFree { location, .. }
            | Self::HeapSizeMismatch { location, .. }
            | Self::LengthMismatch { location, .. }
            | Self::UnlistedFree { location, .. } => *location,
        }
    }
}

/// Arena state the checker reads.
pub(crate) struct HeapView<'a> {
    pub(crate) mem: &'a [u8],
    pub(crate) lo: usize,
    pub(crate) hi: usize,
    pub(crate) total: usize,
}

pub(crate) fn check(view: &HeapView<'_>, list: &FreeList) -> Result<(), ConsistencyError> {
    let listed = check_free_list(view, list)?;
    let walk = walk_heap(view)?;

    ensure!(
        walk.bytes == view.total,
        HeapSizeMismatchSnafu {
            counted: walk.bytes,
            expected: view.total,
        }
    );
    ensure!(
        walk.free_blocks == list.len(),
        LengthMismatchSnafu {
            counted: walk.free_blocks,
            expected: list.len(),
        }
    );
    ensure!(
        listed == walk.free_blocks,
        UnlistedFreeSnafu {
            listed,
            counted: walk.free_blocks,
        }
    );
    Ok(())
}

impl HeapView<'_> {
    /// Whether a free block could start at `offset`.
    fn holds_free_block(&self, offset: usize) -> bool {
        offset >= self.lo
            && (offset - self.lo).is_multiple_of(ALIGN)
            && offset
                .checked_add(MIN_SIZE)
                .is_some_and(|end| end <= self.hi)
    }

    /// Reads both tags of `block`, making sure the footer lies inside the heap.
    fn framed_tags(&self, block: Block) -> Result<(Tag, Tag), ConsistencyError> {
        let header = block.tag(self.mem);
        let offset = block.offset();
        ensure!(
            header.size >= MIN_SIZE
                && header.size.is_multiple_of(ALIGN)
                && offset
                    .checked_add(header.size)
                    .is_some_and(|end| end <= self.hi),
            CorruptBlockSnafu {
                offset,
                size: header.size,
                hi: self.hi,
            }
        );
        Ok((header, block.footer_tag(self.mem)))
    }

    fn links_valid(&self, block: Block) -> bool {
        self.holds_free_block(block.next_link(self.mem).offset())
            && self.holds_free_block(block.prev_link(self.mem).offset())
    }

    fn invalid_link(&self, block: Block) -> ConsistencyError {
        InvalidLinkSnafu {
            offset: block.offset(),
            next: block.next_link(self.mem).offset(),
            prev: block.prev_link(self.mem).offset(),
        }
        .build()
    }
}

/// Validates every node reachable from the head and returns how many there
/// are.
fn check_free_list(view: &HeapView<'_>, list: &FreeList) -> Result<usize, ConsistencyError> {
    let Some(head) = list.head() else {
        return Ok(0);
    };
    ensure!(
        view.holds_free_block(head.offset()),
        CorruptBlockSnafu {
            offset: head.offset(),
            size: 0_usize,
            hi: view.hi,
        }
    );
    let (header, footer) = view.framed_tags(head)?;
    ensure!(
        !header.allocated && !footer.allocated && view.links_valid(head),
        MalformedHeadSnafu {
            offset: head.offset(),
            header,
            footer,
        }
    );

    // A ring can never hold more nodes than the heap has room for; stop there
    // if the links cycle without coming back to the head.
    let max_nodes = (view.hi - view.lo) / MIN_SIZE;
    let mut listed = 0;
    let mut node = head;
    loop {
        let (header, footer) = view.framed_tags(node)?;
        ensure!(
            !header.allocated && !footer.allocated,
            AllocatedInFreeListSnafu {
                index: listed,
                offset: node.offset(),
                header,
                footer,
            }
        );
        ensure!(
            header == footer,
            TagMismatchSnafu {
                offset: node.offset(),
                header,
                footer,
            }
        );
        if !view.links_valid(node) {
            return Err(view.invalid_link(node));
        }
        let next = node.next_link(view.mem);
        let back = next.prev_link(view.mem);
        ensure!(
            back == node,
            BrokenBackLinkSnafu {
                offset: node.offset(),
                next: next.offset(),
                back: back.offset(),
            }
        );

        listed += 1;
        if next == head || listed >= max_nodes {
            return Ok(listed);
        }
        node = next;
    }
}

struct HeapWalk {
    bytes: usize,
    free_blocks: usize,
}

/// Walks every block in address order.
fn walk_heap(view: &HeapView<'_>) -> Result<HeapWalk, ConsistencyError> {
    let mut walk = HeapWalk {
        bytes: 0,
        free_blocks: 0,
    };
    let mut prev_free: Option<(Block, usize)> = None;
    let mut offset = view.lo;
    while offset < view.hi {
        ensure!(
            offset + WORD <= view.hi,
            CorruptBlockSnafu {
                offset,
                size: 0_usize,
                hi: view.hi,
            }
        );
        let block = Block::at(offset);
        let (header, footer) = view.framed_tags(block)?;
        ensure!(
            header == footer,
            TagMismatchSnafu {
                offset,
                header,
                footer,
            }
        );

        if header.allocated {
            prev_free = None;
        } else {
            if let Some((first, first_size)) = prev_free {
                return ContiguousFreeSnafu {
                    first: first.offset(),
                    first_size,
                    second: offset,
                    second_size: header.size,
                }
                .fail();
            }
            walk.free_blocks += 1;
            prev_free = Some((block, header.size));
        }

        walk.bytes += header.size;
        offset += header.size;
    }
    Ok(walk)
}
