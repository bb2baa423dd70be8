pub mod snapshot;

pub use snapshot::{SnapshotEntry, SnapshotStore};
