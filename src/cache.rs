//! Slab caches layered over a buddy allocator.
//!
//! A `CacheAllocator` keeps one cache per element size. Element sizes grow
//! geometrically from the buddy allocator's smallest size class up to its
//! largest allocation. Each cache owns a set of slabs, buddy blocks divided
//! into equally-sized slots, and serves requests from the first slab with a
//! free slot.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case                 |
//! |--------------------------|-----------|----------------------------|
//! | Allocate                 | O(log n)  | buddy allocate + O(slots)  |
//! | Deallocate               | O(log n)  | buddy deallocate + O(log n)|
//!
//! where `n` is the number of slabs.
//!
//! #### Fragmentation
//!
//! Internal fragmentation is the difference between a request and the
//! element size of its cache, bounded by the growth factor. A slab whose
//! slots are all free is returned to the buddy allocator immediately.

use core::{fmt, ptr::NonNull};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

#[cfg(feature = "sptr")]
use sptr::Strict;

use crate::{
    bitmap::Bitmap,
    buddy::{BuddyAllocator, HEADER_SIZE, MIN_POWER},
    AllocError, AllocInitError,
};

/// The default ratio between the element sizes of consecutive caches.
pub const DEFAULT_GROWTH: f64 = 2.0;

/// Slabs are never smaller than `2^MIN_SLAB_POWER` bytes unless the region is.
pub const MIN_SLAB_POWER: usize = 12;

/// The number of powers above the minimum considered when sizing a slab.
pub const SLAB_SPAN: usize = 4;

/// Element sizes are multiples of this, so every slot is word-aligned.
const ELEM_ALIGN: usize = 8;

/// Picks the slab size, as a power of two, that wastes the fewest bytes when
/// divided into `elem_size` slots. Ties go to the smaller slab.
fn min_rem_pow(elem_size: usize, min_pow: usize, max_pow: usize) -> usize {
    (min_pow..=max_pow)
        .min_by_key(|&pow| ((1usize << pow) - HEADER_SIZE) % elem_size)
        .unwrap_or(min_pow)
}

/// A buddy block divided into slots of one size.
struct Slab {
    cache: usize,
    ptr: NonNull<u8>,
    /// One bit per slot; set when the slot is free.
    slots: Bitmap,
}

// SAFETY: a slab's pointer refers to memory owned by the buddy allocator of
// the `CacheAllocator` that holds the slab.
unsafe impl Send for Slab {}

impl Slab {
    fn is_unused(&self) -> bool {
        self.slots.count_ones() == self.slots.len()
    }
}

struct Cache {
    elem_size: usize,
    slab_pow: usize,
    /// Base addresses of this cache's slabs with at least one free slot.
    partial: BTreeSet<usize>,
}

struct Caches {
    caches: Vec<Cache>,
    /// Every live slab, keyed by base address.
    slabs: BTreeMap<usize, Slab>,
}

/// An allocator of small objects that carves slabs out of a
/// [`BuddyAllocator`].
pub struct CacheAllocator {
    buddy: BuddyAllocator,
    inner: Mutex<Caches>,
}

impl CacheAllocator {
    /// Constructs a `CacheAllocator` over a new buddy region of `2^power`
    /// bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `growth` is not greater than 1, plus any
    /// error from [`BuddyAllocator::try_new`].
    pub fn try_new(power: usize, growth: f64) -> Result<CacheAllocator, AllocInitError> {
        Self::with_buddy(BuddyAllocator::try_new(power)?, growth)
    }

    /// Constructs a `CacheAllocator` over an existing buddy allocator.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `growth` is not greater than 1.
    pub fn with_buddy(
        buddy: BuddyAllocator,
        growth: f64,
    ) -> Result<CacheAllocator, AllocInitError> {
        if !(growth > 1.0) || !growth.is_finite() {
            return Err(AllocInitError::InvalidConfig);
        }

        let region_pow = buddy.power();
        let max_alloc = buddy.max_alloc();
        let mut caches = Vec::new();
        let mut size = 1 << MIN_POWER;

        while size < max_alloc {
            let class_pow = BuddyAllocator::power_for(size).ok_or(AllocInitError::InvalidConfig)?;
            let min_pow = class_pow.max(MIN_SLAB_POWER).min(region_pow);
            let max_pow = (min_pow + SLAB_SPAN).min(region_pow);

            caches.push(Cache {
                elem_size: size,
                slab_pow: min_rem_pow(size, min_pow, max_pow),
                partial: BTreeSet::new(),
            });

            let next = (size as f64 * growth).ceil();
            if next >= max_alloc as f64 {
                break;
            }
            let next = (next as usize + ELEM_ALIGN - 1) & !(ELEM_ALIGN - 1);
            size = next.max(size + ELEM_ALIGN);
        }

        log::debug!(
            "cache allocator initialized with {} caches over a 2^{region_pow} byte region",
            caches.len()
        );

        Ok(CacheAllocator {
            buddy,
            inner: Mutex::new(Caches {
                caches,
                slabs: BTreeMap::new(),
            }),
        })
    }

    fn inner(&self) -> MutexGuard<'_, Caches> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the underlying buddy allocator.
    pub fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    /// Returns the element size of every cache, in increasing order.
    pub fn cache_sizes(&self) -> Vec<usize> {
        self.inner().caches.iter().map(|c| c.elem_size).collect()
    }

    /// Returns the number of slabs currently held from the buddy allocator.
    pub fn slab_count(&self) -> usize {
        self.inner().slabs.len()
    }

    /// Attempts to allocate `len` bytes from the smallest fitting cache.
    ///
    /// On success, the returned slice covers the whole slot, which may exceed
    /// `len`.
    ///
    /// # Errors
    ///
    /// Returns `Err` if `len` is zero, larger than every cache, or if a new
    /// slab was needed and the buddy allocator is exhausted.
    pub fn allocate(&self, len: usize) -> Result<NonNull<[u8]>, AllocError> {
        if len == 0 {
            return Err(AllocError);
        }

        let mut guard = self.inner();
        let Caches { caches, slabs } = &mut *guard;

        let ci = caches
            .iter()
            .position(|c| c.elem_size >= len)
            .ok_or(AllocError)?;
        let cache = &mut caches[ci];

        if cache.partial.is_empty() {
            let block = self.buddy.allocate((1 << cache.slab_pow) - HEADER_SIZE)?;
            let num_slots = block.len() / cache.elem_size;

            let mut bits = Bitmap::new(num_slots);
            bits.fill(true);

            let ptr = block.cast::<u8>();
            let base = ptr.as_ptr().addr();
            slabs.insert(
                base,
                Slab {
                    cache: ci,
                    ptr,
                    slots: bits,
                },
            );
            cache.partial.insert(base);

            log::trace!(
                "new slab at {base:#x} for {}-byte elements ({num_slots} slots)",
                cache.elem_size
            );
        }

        let base = *cache.partial.first().ok_or(AllocError)?;
        let slab = slabs.get_mut(&base).ok_or(AllocError)?;
        let slot = slab.slots.pop_first().ok_or(AllocError)?;

        if slab.slots.count_ones() == 0 {
            cache.partial.remove(&base);
        }

        // SAFETY: `slot` is within the slab, which lies inside the region.
        let ptr = unsafe { NonNull::new_unchecked(slab.ptr.as_ptr().add(slot * cache.elem_size)) };

        Ok(NonNull::slice_from_raw_parts(ptr, cache.elem_size))
    }

    /// Deallocates the memory referenced by `ptr`.
    ///
    /// If this empties its slab, the slab is returned to the buddy allocator.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`allocate`](Self::allocate) on this
    /// allocator and must not have been deallocated since.
    pub unsafe fn deallocate(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr().addr();

        let mut guard = self.inner();
        let Caches { caches, slabs } = &mut *guard;

        let (&base, slab) = slabs
            .range_mut(..=addr)
            .next_back()
            .expect("pointer not allocated by this cache allocator");

        let cache = &mut caches[slab.cache];
        let rel = addr - base;
        debug_assert_eq!(rel % cache.elem_size, 0, "pointer not at a slot boundary");

        let was_free = slab.slots.set(rel / cache.elem_size, true);
        debug_assert!(!was_free, "slot {addr:#x} freed twice");

        if slab.is_unused() {
            cache.partial.remove(&base);
            if let Some(slab) = slabs.remove(&base) {
                unsafe { self.buddy.deallocate(slab.ptr) };
                log::trace!("returned empty slab at {base:#x}");
            }
        } else {
            cache.partial.insert(base);
        }
    }
}

impl fmt::Debug for CacheAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheAllocator")
            .field("buddy", &self.buddy)
            .field("slabs", &self.slab_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_bad_growth() {
        for growth in [1.0, 0.5, -2.0, f64::NAN, f64::INFINITY] {
            assert!(matches!(
                CacheAllocator::try_new(16, growth),
                Err(AllocInitError::InvalidConfig)
            ));
        }
    }

    #[test]
    fn huge_growth_yields_one_cache() {
        for growth in [1e30, f64::MAX] {
            let ca = CacheAllocator::try_new(16, growth).unwrap();
            assert_eq!(ca.cache_sizes(), vec![16]);

            let slot = ca.allocate(16).unwrap();
            assert_eq!(slot.len(), 16);
            unsafe { ca.deallocate(slot.cast()) };
        }
    }

    #[test]
    fn cache_sizes_grow_geometrically() {
        let ca = CacheAllocator::try_new(16, DEFAULT_GROWTH).unwrap();
        let sizes = ca.cache_sizes();

        assert_eq!(sizes.first(), Some(&16));
        assert!(sizes.windows(2).all(|w| w[1] == 2 * w[0]));
        assert!(sizes.iter().all(|&s| s < ca.buddy().max_alloc()));
        assert!(sizes.iter().all(|&s| s % ELEM_ALIGN == 0));

        let ca = CacheAllocator::try_new(16, 1.25).unwrap();
        let sizes = ca.cache_sizes();
        assert_eq!(&sizes[..4], &[16, 24, 32, 40]);
    }

    #[test]
    fn slab_power_minimizes_waste() {
        // 4088 % 1000 = 88, 8184 % 1000 = 184, 16376 % 1000 = 376,
        // 32760 % 1000 = 760.
        assert_eq!(min_rem_pow(1000, 12, 15), 12);
        // 4088 % 24 = 8, 8184 % 24 = 0.
        assert_eq!(min_rem_pow(24, 12, 16), 13);
        // 4088 % 2040 = 8, 8184 % 2040 = 24.
        assert_eq!(min_rem_pow(2040, 12, 13), 12);
        // 4088 % 2728 = 1360, 8184 % 2728 = 0.
        assert_eq!(min_rem_pow(2728, 12, 14), 13);
    }

    #[test]
    fn slots_are_reused_and_slabs_returned() {
        let ca = CacheAllocator::try_new(20, DEFAULT_GROWTH).unwrap();
        let whole = ca.buddy().free_bytes();

        let a = ca.allocate(20).unwrap();
        let b = ca.allocate(30).unwrap();
        assert_eq!(a.len(), 32);
        assert_eq!(ca.slab_count(), 1);
        assert_eq!(
            b.cast::<u8>().as_ptr() as usize - a.cast::<u8>().as_ptr() as usize,
            32
        );

        unsafe { ca.deallocate(a.cast()) };
        let c = ca.allocate(32).unwrap();
        assert_eq!(c.cast::<u8>(), a.cast::<u8>());

        unsafe {
            ca.deallocate(b.cast());
            ca.deallocate(c.cast());
        }
        assert_eq!(ca.slab_count(), 0);
        assert_eq!(ca.buddy().free_bytes(), whole);
    }

    #[test]
    fn full_slab_spills_into_new_slab() {
        let ca = CacheAllocator::try_new(20, DEFAULT_GROWTH).unwrap();

        let first = ca.allocate(1000).unwrap();
        let per_slab = {
            let mut n = 1;
            while ca.slab_count() == 1 {
                ca.allocate(1000).unwrap();
                n += 1;
            }
            n - 1
        };

        let slot = ca.cache_sizes().into_iter().find(|&s| s >= 1000).unwrap();
        assert_eq!(per_slab, ((1 << MIN_SLAB_POWER) - HEADER_SIZE) / slot);
        assert_eq!(ca.slab_count(), 2);

        unsafe { ca.deallocate(first.cast()) };
        assert_eq!(ca.slab_count(), 2);
    }

    #[test]
    fn oversized_requests_fail() {
        let ca = CacheAllocator::try_new(14, DEFAULT_GROWTH).unwrap();
        assert_eq!(ca.allocate(0), Err(AllocError));
        assert_eq!(ca.allocate(1 << 14), Err(AllocError));
    }
}
