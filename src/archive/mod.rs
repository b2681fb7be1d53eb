//! The versioned archive index: strands, roots, per-key version windows,
//! and the per-root read view.

pub mod keys;
mod layer;
mod records;
mod store;

pub use layer::ArchiveLayer;
pub use records::{KeyVersion, RootRecord, StrandRecord, UNBOUNDED};
pub use store::{ArchiveStore, StateUpdate};
