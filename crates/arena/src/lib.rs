//! Growable memory arena backing the heap.
//!
//! An arena is a single contiguous byte range `[lo, hi)` that only ever grows
//! by appending at `hi`, the way `sbrk(2)` moves the program break. Bytes that
//! have been handed out are never moved.
//!
//! ```text
//!   lo                              hi (break)                 reservation end
//!   ├──────────── managed ──────────┼─────── not yet grown ───────────┤
//!   │ block │ block │ ...   │ block │                                 │
//!   └───────┴───────┴───────┴───────┴─────────────────────────────────┘
//!                                   └─ grow(n) returns this offset and
//!                                      moves the break n bytes right
//! ```
//!
//! Positions inside the arena are byte offsets from the start of the
//! reservation, so [`Arena::bytes`] can be indexed directly with any offset in
//! `lower_bound()..upper_bound()`.
//!
//! # Usage Example
//!
//! ```rust
//! use arena::{Arena as _, ArenaConfig, MemArena};
//!
//! let mut arena = MemArena::new(ArenaConfig::new(8192, 4096)).unwrap();
//! let start = arena.grow(48).unwrap();
//! assert_eq!(start, 0);
//! assert_eq!(arena.total_size(), 48);
//! ```

#![no_std]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

extern crate alloc;

use alloc::{boxed::Box, vec};

use log::{debug, trace};
use snafu::{OptionExt as _, Snafu, ensure};
use snafu_utils::{Located, Location};

/// The growth primitive the heap is built on.
///
/// Implementations must keep every byte in `lower_bound()..upper_bound()` at a
/// stable offset for as long as the arena lives.
pub trait Arena {
    /// Extends the managed region by `bytes`.
    ///
    /// Returns the offset of the first new byte (the old upper bound), or
    /// `None` if the arena cannot grow. A failed call leaves the extent
    /// unchanged.
    fn grow(&mut self, bytes: usize) -> Option<usize>;

    fn lower_bound(&self) -> usize;

    fn upper_bound(&self) -> usize;

    fn total_size(&self) -> usize {
        self.upper_bound() - self.lower_bound()
    }

    fn page_size(&self) -> usize;

    /// Drops the upper bound back to the lower bound.
    fn reset(&mut self);

    /// Bytes `0..upper_bound()`.
    fn bytes(&self) -> &[u8];

    /// Bytes `0..upper_bound()`.
    fn bytes_mut(&mut self) -> &mut [u8];
}

#[derive(Debug, Snafu)]
pub enum ArenaError {
    #[snafu(display("page size must be a non-zero power of two, got {page_size}"))]
    InvalidPageSize {
        page_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
    #[snafu(display(
        "reservation of {max_size} bytes overflows when rounded up to {page_size}-byte pages"
    ))]
    ReservationOverflow {
        max_size: usize,
        page_size: usize,
        #[snafu(implicit)]
        location: Location,
    },
}

impl Located for ArenaError {
    fn location(&self) -> Location {
        match self {
            Self::InvalidPageSize { location, .. } | Self::ReservationOverflow { location, .. } => {
                *location
            }
        }
    }
}

/// Sizing of a [`MemArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaConfig {
    /// Upper limit on the managed region, rounded up to whole pages.
    pub max_size: usize,
    pub page_size: usize,
}

impl ArenaConfig {
    pub const DEFAULT_MAX_SIZE: usize = 20 * (1 << 20);
    pub const DEFAULT_PAGE_SIZE: usize = 4096;

    #[must_use]
    pub const fn new(max_size: usize, page_size: usize) -> Self {
        Self {
            max_size,
            page_size,
        }
    }
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self::new(Self::DEFAULT_MAX_SIZE, Self::DEFAULT_PAGE_SIZE)
    }
}

/// A simulated `sbrk` region carved out of one up-front reservation.
///
/// The break moves by exactly the requested number of bytes; only the
/// reservation is page granular. Growth past the reservation fails without
/// moving the break.
pub struct MemArena {
    memory: Box<[u8]>,
    brk: usize,
    page_size: usize,
    growth_enabled: bool,
}

impl MemArena {
    /// Reserves `config.max_size` bytes rounded up to a page multiple.
    pub fn new(config: ArenaConfig) -> Result<Self, ArenaError> {
        let ArenaConfig {
            max_size,
            page_size,
        } = config;
        ensure!(page_size.is_power_of_two(), InvalidPageSizeSnafu { page_size });
        let reserved = max_size
            .checked_next_multiple_of(page_size)
            .context(ReservationOverflowSnafu {
                max_size,
                page_size,
            })?;
        // Larger buffers cannot be allocated at all.
        ensure!(
            reserved <= isize::MAX.unsigned_abs(),
            ReservationOverflowSnafu {
                max_size,
                page_size,
            }
        );
        debug!("arena reserved {reserved:#x} bytes ({page_size}-byte pages)");
        Ok(Self {
            memory: vec![0; reserved].into_boxed_slice(),
            brk: 0,
            page_size,
            growth_enabled: true,
        })
    }

    /// Size of the reservation the break can grow into.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.memory.len()
    }

    /// Makes every later [`grow`](Arena::grow) fail while `false`.
    pub fn set_growth_enabled(&mut self, enabled: bool) {
        self.growth_enabled = enabled;
    }
}

impl Arena for MemArena {
    fn grow(&mut self, bytes: usize) -> Option<usize> {
        if !self.growth_enabled {
            debug!("arena growth by {bytes:#x} bytes refused: growth disabled");
            return None;
        }
        let old_brk = self.brk;
        let Some(new_brk) = old_brk
            .checked_add(bytes)
            .filter(|&brk| brk <= self.memory.len())
        else {
            debug!(
                "arena exhausted: break {old_brk:#x} + {bytes:#x} exceeds reservation {:#x}",
                self.memory.len()
            );
            return None;
        };
        self.brk = new_brk;
        trace!("arena break {old_brk:#x} -> {new_brk:#x}");
        Some(old_brk)
    }

    fn lower_bound(&self) -> usize {
        0
    }

    fn upper_bound(&self) -> usize {
        self.brk
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reset(&mut self) {
        trace!("arena break {:#x} -> 0", self.brk);
        self.brk = 0;
    }

    fn bytes(&self) -> &[u8] {
        &self.memory[..self.brk]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.memory[..self.brk]
    }
}
