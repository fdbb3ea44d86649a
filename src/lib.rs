//! Power-of-two allocators over memory mapped directly from the operating
//! system.
//!
//! This crate provides two allocators:
//! - [`BuddyAllocator`], a binary-buddy allocator over a single region of
//!   `2^power` bytes, with lazy coalescing of free blocks.
//! - [`CacheAllocator`], a slab allocator whose slabs are carved out of a
//!   `BuddyAllocator`.
//!
//! Both allocators are thread-safe. The regions they manage, along with any
//! other bookkeeping mapped via [`Region`], bypass the global allocator
//! entirely.

#![doc(html_root_url = "https://docs.rs/wss_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
#![cfg_attr(docs_rs, feature(doc_cfg))]
// This is necessary to allow `sptr` to shadow methods provided by newer
// toolchains.
#![allow(unstable_name_collisions)]

mod bitmap;
pub mod buddy;
pub mod cache;
pub mod region;


pub use crate::{
    buddy::{BuddyAllocator, BuddyStats},
    cache::CacheAllocator,
    region::Region,
};

/// The error type for allocator constructors.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocInitError {
    /// The operating system refused to map the managed region.
    ///
    /// The variant contains the length of the mapping that failed.
    #[error("failed to map a region of {len} bytes")]
    MapFailed {
        /// The requested mapping length in bytes.
        len: usize,
    },

    /// The configuration of the allocator is invalid.
    ///
    /// This variant is returned when an allocator's configuration
    /// parameters are impossible to satisfy.
    #[error("invalid allocator configuration")]
    InvalidConfig,
}

/// Indicates an allocation failure due to resource exhaustion or an unsupported
/// request size.
#[derive(Copy, Clone, PartialEq, Eq, Debug, thiserror::Error)]
#[error("memory allocation failed")]
pub struct AllocError;
