//! A binary-buddy memory allocator.
//!
//! A `BuddyAllocator` manages a single mapping of `2^power` bytes. Requests
//! are rounded up, header included, to the next power of two, and served
//! from the free-list of that size class. If the class is empty, free buddy
//! pairs below it are first coalesced upward; only if that fails is a larger
//! free block split down to the requested size.
//!
//! Every allocation is preceded by a small in-band header recording its size
//! class, so deallocation requires only the pointer.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                 |
//! |--------------------------|-----------|----------------------------|
//! | Allocate                 | O(1)      | O(2^(power - p) / 64)      |
//! | Deallocate               | O(1)      | O(1)                       |
//!
//! where `p` is the size class of the request. Coalescing scans the bitmap of
//! every level below `p` from its lowest free block to its end, so the worst
//! case is bounded by the number of words in the smallest level's bitmap.
//!
//! #### Fragmentation
//!
//! Internal fragmentation is bounded by the rounding to a power of two: any
//! allocation wastes less than half of its block. Free blocks are never merged
//! on deallocation, only when an allocation cannot otherwise be satisfied, so
//! adjacent free buddies may coexist in between.

use core::{fmt, mem, ptr::NonNull};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[cfg(feature = "sptr")]
use sptr::Strict;

use crate::{bitmap::Bitmap, region::Region, AllocError, AllocInitError};

/// The largest supported region size, as a power of two.
pub const MAX_POWER: usize = 30;

/// The size in bytes of the largest supported region.
pub const MAX_BLOCK_SIZE: usize = 1 << MAX_POWER;

/// The number of bytes preceding every allocation.
pub const HEADER_SIZE: usize = mem::size_of::<Header>();

/// The smallest size class a nonzero request can resolve to.
pub const MIN_POWER: usize = (HEADER_SIZE + 1).next_power_of_two().trailing_zeros() as usize;

/// Records the size class of an allocated block.
#[repr(C)]
struct Header {
    power: u64,
}

/// The free blocks of a single size class.
struct BuddyLevel {
    power: usize,
    free: Bitmap,
    /// Set when a block was inserted since the last coalescing scan.
    dirty: bool,
}

impl BuddyLevel {
    fn new(power: usize, region_power: usize) -> BuddyLevel {
        let usable = power <= region_power && (power >= MIN_POWER || power == region_power);
        let num_blocks = if usable { 1 << (region_power - power) } else { 0 };

        BuddyLevel {
            power,
            free: Bitmap::new(num_blocks),
            dirty: false,
        }
    }

    #[inline]
    fn block_size(&self) -> usize {
        1 << self.power
    }

    /// Retrieves the index of the block which starts `ofs` bytes from the
    /// base.
    #[inline]
    fn index_of(&self, ofs: usize) -> usize {
        assert_eq!(
            ofs & (self.block_size() - 1),
            0,
            "offset {ofs:#x} is not aligned to level {}",
            self.power
        );

        ofs >> self.power
    }

    #[inline]
    fn len(&self) -> usize {
        self.free.count_ones()
    }

    #[inline]
    fn is_empty(&self) -> bool {
        self.free.count_ones() == 0
    }

    /// Marks the block at `ofs` as free.
    fn insert(&mut self, ofs: usize) {
        let was_free = self.free.set(self.index_of(ofs), true);
        debug_assert!(!was_free, "block {ofs:#x} already free at level {}", self.power);
        self.dirty = true;
    }

    /// Removes the lowest free block and returns its offset.
    fn take_lowest(&mut self) -> Option<usize> {
        self.free.pop_first().map(|idx| idx << self.power)
    }

    fn offsets(&self) -> impl Iterator<Item = usize> + '_ {
        self.free.iter_ones().map(move |idx| idx << self.power)
    }

    fn clear(&mut self) {
        self.free.fill(false);
        self.dirty = false;
    }
}

/// The free-lists of every size class, guarded by the allocator's mutex.
struct Levels {
    /// The power of the whole region.
    power: usize,
    levels: Vec<BuddyLevel>,
}

impl Levels {
    fn new(power: usize) -> Levels {
        let levels = (0..=MAX_POWER)
            .map(|pow| BuddyLevel::new(pow, power))
            .collect();

        let mut levels = Levels { power, levels };
        levels.seed();
        levels
    }

    /// Makes the whole region a single free block.
    fn seed(&mut self) {
        self.levels[self.power].insert(0);
    }

    fn reset(&mut self) {
        for level in self.levels.iter_mut() {
            level.clear();
        }
        self.seed();
    }

    /// Merges free buddy pairs upward through every level below `stop`.
    ///
    /// A pair merged at one level may complete a pair at the next, so levels
    /// are visited in ascending order.
    fn merge_up(&mut self, stop: usize) {
        for pow in 0..stop {
            let (lower, upper) = self.levels.split_at_mut(pow + 1);
            let level = &mut lower[pow];
            let parent = &mut upper[0];

            if !level.dirty {
                continue;
            }
            level.dirty = false;

            if level.len() < 2 {
                continue;
            }

            let merged = level.free.take_pairs(|k| {
                parent.free.set(k, true);
            });

            if merged > 0 {
                parent.dirty = true;
                log::trace!("merged {merged} pairs from level {pow} into level {}", pow + 1);
            }
        }
    }

    /// Splits the lowest free block above `pow` until a block at `pow` exists.
    fn split_from(&mut self, pow: usize) {
        let found = (pow + 1..=self.power).find(|&p| !self.levels[p].is_empty());

        let from = match found {
            Some(p) => p,
            None => return,
        };

        let ofs = match self.levels[from].take_lowest() {
            Some(o) => o,
            None => return,
        };

        // The front half keeps the block's offset; each back half is left
        // free at its level.
        for p in (pow..from).rev() {
            self.levels[p].insert(ofs + (1 << p));
        }
        self.levels[pow].insert(ofs);

        log::trace!("split block {ofs:#x} from level {from} down to level {pow}");
    }

    /// Tries to make a free block available at `pow`.
    ///
    /// Returns `false` if no block of that size can be produced.
    fn need_at(&mut self, pow: usize) -> bool {
        if pow > self.power {
            return false;
        }

        if self.levels[pow].is_empty() {
            self.merge_up(pow);
        }

        if self.levels[pow].is_empty() {
            self.split_from(pow);
        }

        !self.levels[pow].is_empty()
    }

    fn take_at(&mut self, pow: usize) -> Option<usize> {
        self.levels[pow].take_lowest()
    }

    fn free(&mut self, ofs: usize, pow: usize) {
        self.levels[pow].insert(ofs);
    }

    fn free_blocks(&self) -> Vec<(usize, usize)> {
        self.levels
            .iter()
            .flat_map(|level| level.offsets().map(move |ofs| (ofs, level.power)))
            .collect()
    }

    #[cfg(feature = "extra-checks")]
    fn check(&self) {
        let mut blocks = self.free_blocks();
        blocks.sort_unstable();

        for pair in blocks.windows(2) {
            let (a_ofs, a_pow) = pair[0];
            let (b_ofs, _) = pair[1];
            assert!(
                a_ofs + (1 << a_pow) <= b_ofs,
                "free blocks {a_ofs:#x} and {b_ofs:#x} overlap"
            );
        }
    }

    #[cfg(not(feature = "extra-checks"))]
    #[inline(always)]
    fn check(&self) {}
}

/// The number of free blocks at each size class.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuddyStats {
    counts: Vec<usize>,
}

impl BuddyStats {
    /// Returns the number of free blocks of size `2^pow`.
    pub fn free_at(&self, pow: usize) -> usize {
        self.counts.get(pow).copied().unwrap_or(0)
    }

    /// Returns an iterator of `(power, count)` over all levels.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.counts.iter().copied().enumerate()
    }
}

impl fmt::Display for BuddyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "pow count")?;
        for (pow, count) in self.iter() {
            writeln!(f, "{pow} {count}")?;
        }
        Ok(())
    }
}

/// A binary-buddy allocator over a single mapped region.
///
/// The allocator may be shared between threads. Every allocation and
/// deallocation holds one internal lock for its full duration.
///
/// ```
/// use wss_alloc::BuddyAllocator;
///
/// // A 1 MiB region.
/// let buddy = BuddyAllocator::try_new(20).unwrap();
///
/// let block = buddy.allocate(100).unwrap();
/// assert!(block.len() >= 100);
///
/// unsafe { buddy.deallocate(block.cast()) };
/// ```
pub struct BuddyAllocator {
    region: Region,
    levels: Mutex<Levels>,
}

impl BuddyAllocator {
    /// Constructs a `BuddyAllocator` managing a fresh mapping of `2^power`
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `power` is zero or greater than
    /// [`MAX_POWER`], and `MapFailed` if the region could not be mapped.
    pub fn try_new(power: usize) -> Result<BuddyAllocator, AllocInitError> {
        if power < 1 || power > MAX_POWER {
            return Err(AllocInitError::InvalidConfig);
        }

        let region = Region::map(1 << power)?;
        log::debug!("buddy allocator initialized with a 2^{power} byte region");

        Ok(BuddyAllocator {
            region,
            levels: Mutex::new(Levels::new(power)),
        })
    }

    fn levels(&self) -> MutexGuard<'_, Levels> {
        self.levels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the size class, as a power of two, that serves a request of
    /// `len` bytes.
    ///
    /// Returns `None` if `len` is zero or too large for any region.
    pub fn power_for(len: usize) -> Option<usize> {
        if len == 0 || len > MAX_BLOCK_SIZE - HEADER_SIZE {
            return None;
        }

        let total = len + HEADER_SIZE;
        Some(total.next_power_of_two().trailing_zeros() as usize)
    }

    /// Returns the power of two of the managed region.
    #[inline]
    pub fn power(&self) -> usize {
        self.levels().power
    }

    /// Returns the size of the managed region in bytes.
    #[inline]
    pub fn region_len(&self) -> usize {
        self.region.len()
    }

    /// Returns the region managed by this allocator.
    #[inline]
    pub fn region(&self) -> &Region {
        &self.region
    }

    /// Returns the largest request this allocator could ever satisfy.
    #[inline]
    pub fn max_alloc(&self) -> usize {
        self.region.len().saturating_sub(HEADER_SIZE)
    }

    /// Attempts to allocate at least `len` bytes.
    ///
    /// On success, returns a [`NonNull<[u8]>`] covering every usable byte of
    /// the block, which may exceed `len`. The contents are unspecified.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `len` is zero, larger than `MAX_BLOCK_SIZE -
    /// HEADER_SIZE`, or if no sufficiently large block could be produced.
    pub fn allocate(&self, len: usize) -> Result<NonNull<[u8]>, AllocError> {
        let pow = Self::power_for(len).ok_or(AllocError)?;

        let ofs = {
            let mut levels = self.levels();
            if !levels.need_at(pow) {
                return Err(AllocError);
            }
            let ofs = levels.take_at(pow).ok_or(AllocError)?;
            levels.check();
            ofs
        };

        let block = self.region.with_offset(ofs);
        unsafe {
            // SAFETY: the block is at least 2^MIN_POWER bytes, 8-byte aligned,
            // and was just removed from the free-lists.
            block
                .cast::<Header>()
                .as_ptr()
                .write(Header { power: pow as u64 });
        }

        let data = self.region.with_offset(ofs + HEADER_SIZE);
        Ok(NonNull::slice_from_raw_parts(data, (1 << pow) - HEADER_SIZE))
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// The block is returned to the free-list of its size class. It is not
    /// coalesced with its buddy until an allocation requires it.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// allocator, must not have been deallocated since, and the allocator must
    /// not have been [`reset`](Self::reset) in between.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr().addr();
        let ofs = self.region.offset_to(addr) - HEADER_SIZE;

        let header = self.region.with_offset(ofs).cast::<Header>();
        let pow = unsafe { header.as_ptr().read().power } as usize;

        debug_assert!((MIN_POWER..=MAX_POWER).contains(&pow), "corrupt header");

        let mut levels = self.levels();
        levels.free(ofs, pow);
        levels.check();
    }

    /// Deallocates `ptr` if it is `Some`; `None` is ignored.
    ///
    /// # Safety
    ///
    /// See [`deallocate`](Self::deallocate).
    pub unsafe fn deallocate_opt(&self, ptr: Option<NonNull<u8>>) {
        if let Some(p) = ptr {
            unsafe { self.deallocate(p) };
        }
    }

    /// Returns the allocator to its freshly initialized state.
    ///
    /// All outstanding allocations are forgotten. The region is not unmapped.
    pub fn reset(&self) {
        self.levels().reset();
        log::debug!("buddy allocator reset");
    }

    /// Returns the number of free blocks at each level.
    pub fn dump_stats(&self) -> BuddyStats {
        let levels = self.levels();
        BuddyStats {
            counts: levels.levels.iter().map(BuddyLevel::len).collect(),
        }
    }

    /// Returns the `(offset, power)` of every free block, sorted by level and
    /// then by offset.
    pub fn free_blocks(&self) -> Vec<(usize, usize)> {
        self.levels().free_blocks()
    }

    /// Returns the total size of all free blocks.
    pub fn free_bytes(&self) -> usize {
        self.levels()
            .levels
            .iter()
            .map(|level| level.len() * level.block_size())
            .sum()
    }
}

impl fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}
