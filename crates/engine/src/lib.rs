//! Resumable chunked upload engine.
//!
//! An upload is initialized with its declared shape, receives its chunks in
//! any order (possibly several at once, possibly more than once), and is
//! merged into a single artifact once every chunk is present. Abandoned
//! uploads are reclaimed by the [`ExpirySweeper`].

pub mod chunk_store;
pub mod engine;
pub mod error;
pub mod gate;
pub mod locks;
pub mod metrics;
pub mod sweeper;
pub mod tracker;

pub use chunk_store::{ArtifactStore, ChunkStore};
pub use engine::{ChunkAccepted, InitOutcome, InitRequest, MergeOutcome, UploadEngine};
pub use error::{UploadError, UploadResult};
pub use gate::{ConcurrencyGate, SlotPermit};
pub use locks::UploadLocks;
pub use sweeper::{ExpirySweeper, SweepStats};
pub use tracker::ChunkTracker;
