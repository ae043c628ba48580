//! Errors surfaced at the heap boundary.
//!
//! Inside the collector allocation failure is a `None`; only the mutator-facing
//! API turns an allocation that still fails after a full collection into
//! [`GcError::OutOfMemory`].

use thiserror::Error;

/// Errors returned by [`GcHeap`](crate::GcHeap) and [`Mutator`](crate::Mutator).
#[derive(Debug, Error)]
pub enum GcError {
    /// An allocation could not be satisfied even after a full collection.
    #[error("out of memory: failed to allocate {requested} bytes")]
    OutOfMemory {
        /// Requested object size in bytes.
        requested: usize,
    },
    /// The settings are inconsistent.
    #[error("invalid settings: {0}")]
    InvalidSettings(&'static str),
    /// Reserving the heap range failed.
    #[error("failed to reserve heap memory")]
    Map(#[from] std::io::Error),
    /// A collector thread could not be started.
    #[error("failed to spawn collector thread")]
    Spawn(#[source] std::io::Error),
}
