//! Call-trace snapshots: the frozen model, its binary codec and files.

pub mod codec;
pub mod file;
pub mod model;

pub use codec::{encode, read_snapshot, write_snapshot};
pub use model::{Snapshot, SnapshotEdge, SnapshotMethod};
