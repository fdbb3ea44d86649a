//! A live-working-set workload generator for evaluating allocators.
//!
//! A [`LiveSet`] holds a bounded population of objects allocated from a
//! [`Subject`]. Injecting new objects evicts random old ones, so the live
//! bytes stay near a fixed budget while the allocator sees continuous churn.
//! Comparing the process footprint against that budget measures how well the
//! allocator reuses memory.
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]

use core::{fmt::Debug, ptr::NonNull};

mod error;
mod live;
pub mod sizes;
pub mod stats;
mod table;
pub mod workload;

#[cfg(test)]
mod tests;

pub use crate::{
    error::Error,
    live::{LiveSet, LiveSetBuilder, DEFAULT_SLOTS},
    stats::{Measure, ProcessMemory, Report},
    workload::{SizeSpec, Workload},
};

/// An allocator under evaluation.
pub trait Subject {
    /// The error returned when an allocation fails.
    type AllocError: Debug;

    /// Allocates a block of at least `len` bytes, aligned to at least 8 bytes.
    fn allocate(&mut self, len: usize) -> Result<NonNull<u8>, Self::AllocError>;

    /// Deallocates the block of `len` bytes pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// subject, and it must have been allocated with `len`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, len: usize);

    /// Returns a short name identifying the allocator.
    fn name(&self) -> &str;
}
