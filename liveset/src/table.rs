//! Fixed-capacity tables mapped directly from the operating system.
//!
//! Tracking state lives outside the allocator under test, so it neither
//! perturbs the allocator nor shows up as allocator usage.

use core::{marker::PhantomData, mem, ptr::NonNull};

use wss_alloc::Region;

use crate::Error;

/// Types for which the all-zeroes bit pattern is a valid value.
///
/// # Safety
///
/// Implementors must be valid when zero-initialized.
pub(crate) unsafe trait Zeroable: Copy {}

unsafe impl Zeroable for u32 {}
// `None` is guaranteed to be represented by the null pointer.
unsafe impl Zeroable for Option<NonNull<u8>> {}

/// A zero-initialized array of `T` backed by an anonymous mapping.
pub(crate) struct Table<T: Zeroable> {
    name: &'static str,
    region: Region,
    capacity: usize,
    _marker: PhantomData<T>,
}

impl<T: Zeroable> Table<T> {
    /// Maps a table of `capacity` zeroed entries.
    pub(crate) fn map(name: &'static str, capacity: usize) -> Result<Table<T>, Error> {
        let bytes = capacity.checked_mul(mem::size_of::<T>()).ok_or_else(|| {
            Error::InvalidConfiguration(format!("{name} table of {capacity} entries is too large"))
        })?;

        let region = Region::map(bytes)?;
        log::debug!("mapped {name} table: {capacity} entries, {bytes} bytes");

        Ok(Table {
            name,
            region,
            capacity,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of bytes the table occupies, rounded to pages.
    #[inline]
    pub(crate) fn mapped_len(&self) -> usize {
        self.region.mapped_len()
    }

    /// Returns the number of bytes of the table resident in memory.
    #[inline]
    pub(crate) fn resident_len(&self) -> usize {
        self.region.resident_len()
    }

    #[inline]
    pub(crate) fn as_slice(&self) -> &[T] {
        // SAFETY: `T: Zeroable`, and only values of `T` are ever written.
        unsafe { self.region.as_slice() }
    }

    #[inline]
    pub(crate) fn get(&self, index: usize) -> T {
        self.as_slice()[index]
    }

    #[inline]
    pub(crate) fn set(&mut self, index: usize, value: T) {
        // SAFETY: as in `as_slice`.
        let entries: &mut [T] = unsafe { self.region.as_mut_slice() };
        entries[index] = value;
    }

    /// Returns an error naming this table as full.
    pub(crate) fn exceeded(&self) -> Error {
        Error::CapacityExceeded {
            table: self.name,
            capacity: self.capacity,
        }
    }
}
