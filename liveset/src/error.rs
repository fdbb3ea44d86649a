use wss_alloc::AllocInitError;

/// The error type for live-set operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The subject failed to allocate an object.
    #[error("allocation of {size} bytes failed")]
    AllocationFailure {
        /// The requested object size in bytes.
        size: u32,
    },

    /// A tracking table has no room for another entry.
    #[error("exceeded {table} (capacity {capacity})")]
    CapacityExceeded {
        /// The name of the full table.
        table: &'static str,
        /// The number of entries the table holds.
        capacity: usize,
    },

    /// A parameter was out of range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A tracking table could not be mapped.
    #[error(transparent)]
    Map(#[from] AllocInitError),

    /// Reading sizes or process statistics failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
