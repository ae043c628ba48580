//! Collection machinery.
//!
//! This module holds everything that runs while collecting:
//! - the G1 engine and its cycle driver ([`G1Gc`])
//! - write barriers, the card queue and the SATB buffers
//! - remembered-set digestion on a background thread
//! - collection sets, the marker and the worker pool
//! - the stop-the-world rendezvous and the lock ordering discipline

pub mod barrier;
pub mod collection_set;
pub mod g1;
pub mod mark;
pub mod marker;
pub mod safepoint;
pub mod sync;
pub mod task;
pub mod update_remset;
pub mod workers;

pub use barrier::{BarrierBuffers, G1BarrierSet};
pub use collection_set::CollectionSet;
pub use g1::{G1Gc, GcListener, RootProvider};
pub use marker::Marker;
pub use safepoint::{Rendezvous, SafepointGuard};
pub use task::{GcCollectionType, GcPhase, GcTask, GcTaskCause};
pub use update_remset::{UpdateRemsetPause, UpdateRemsetWorker};
pub use workers::GcWorkers;
