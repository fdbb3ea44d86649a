//! Anonymous memory mappings obtained directly from the operating system.

use core::{fmt, mem, num::NonZeroUsize, ptr::NonNull, slice};

#[cfg(feature = "sptr")]
use sptr::Strict;

use crate::AllocInitError;

/// The page size assumed when rounding mapping sizes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;
const PAGE_SHIFT: usize = 12;

/// Rounds `len` up to a whole number of pages.
#[inline]
pub const fn page_round_up(len: usize) -> usize {
    let pages = (len >> PAGE_SHIFT) + if len & (PAGE_SIZE - 1) != 0 { 1 } else { 0 };
    pages << PAGE_SHIFT
}

fn os_page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(sz).unwrap_or(PAGE_SIZE)
}

/// A contiguous, page-aligned, zero-initialized mapping.
///
/// The mapping is private to the process and is released when the `Region`
/// is dropped. Memory obtained this way never passes through the global
/// allocator, which keeps allocator bookkeeping out of allocator
/// measurements.
pub struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: `Region` uniquely owns its mapping; the raw pointer is never shared
// except through borrows of `self`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Maps `len` bytes of anonymous, read-write memory.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `len` is zero, and `MapFailed` if the
    /// operating system refuses the mapping.
    pub fn map(len: usize) -> Result<Region, AllocInitError> {
        if len == 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        let raw = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            log::error!(
                "mmap of {len} bytes failed: {}",
                std::io::Error::last_os_error()
            );
            return Err(AllocInitError::MapFailed { len });
        }

        let ptr = NonNull::new(raw.cast::<u8>()).ok_or(AllocInitError::MapFailed { len })?;
        log::debug!("mapped region of {len} bytes at {ptr:p}");

        Ok(Region { ptr, len })
    }

    /// Returns the base pointer of the mapping.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the address of the base of the mapping.
    #[inline]
    pub fn addr(&self) -> NonZeroUsize {
        // SAFETY: `ptr` is non-null.
        unsafe { NonZeroUsize::new_unchecked(self.ptr.as_ptr().addr()) }
    }

    /// Returns the length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns `true` if the mapping has zero length. Never true for a
    /// successfully mapped region.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns the number of bytes the mapping occupies, rounded to pages.
    #[inline]
    pub fn mapped_len(&self) -> usize {
        page_round_up(self.len)
    }

    /// Returns the number of bytes of the mapping currently resident in
    /// memory, in whole pages.
    ///
    /// If residency cannot be queried, the whole mapping is reported as
    /// resident.
    pub fn resident_len(&self) -> usize {
        let page = os_page_size();
        let pages = (self.len + page - 1) / page;
        let mut vec = vec![0u8; pages];

        let ret = unsafe { libc::mincore(self.ptr.as_ptr().cast(), self.len, vec.as_mut_ptr()) };
        if ret != 0 {
            log::warn!("mincore failed: {}", std::io::Error::last_os_error());
            return pages * page;
        }

        vec.iter().filter(|&&v| v & 1 != 0).count() * page
    }

    /// Returns `true` if `addr` lies within the mapping.
    #[inline]
    pub fn contains_addr(&self, addr: usize) -> bool {
        let base = self.addr().get();
        base <= addr && addr - base < self.len
    }

    /// Calculates the offset from the base of the region to `addr`.
    ///
    /// # Panics
    ///
    /// Panics if `addr` lies below the base of the region.
    #[inline]
    pub fn offset_to(&self, addr: usize) -> usize {
        addr.checked_sub(self.addr().get())
            .expect("address precedes region base")
    }

    /// Creates a pointer `offset` bytes past the base.
    ///
    /// The returned pointer has the provenance of the region.
    #[inline]
    pub fn with_offset(&self, offset: usize) -> NonNull<u8> {
        assert!(offset < self.len, "offset {offset:#x} outside region");

        let addr = self.addr().get() + offset;
        // SAFETY: `addr` is inside a mapping that starts at a non-null address.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().with_addr(addr)) }
    }

    /// Views the mapping as a mutable slice of `T`.
    ///
    /// # Safety
    ///
    /// The all-zeroes bit pattern, and every bit pattern written through
    /// previous views of the region, must be valid for `T`.
    #[inline]
    pub unsafe fn as_mut_slice<T: Copy>(&mut self) -> &mut [T] {
        debug_assert_eq!(self.ptr.as_ptr().align_offset(mem::align_of::<T>()), 0);

        let len = self.len / mem::size_of::<T>();
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr().cast::<T>(), len) }
    }

    /// Views the mapping as a shared slice of `T`.
    ///
    /// # Safety
    ///
    /// See [`Region::as_mut_slice`].
    #[inline]
    pub unsafe fn as_slice<T: Copy>(&self) -> &[T] {
        let len = self.len / mem::size_of::<T>();
        unsafe { slice::from_raw_parts(self.ptr.as_ptr().cast::<T>(), len) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };
        debug_assert_eq!(ret, 0, "munmap failed");
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}
