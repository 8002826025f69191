//! Snapshot export
//!
//! Writes a snapshot, its hotspot ranking and call tree as JSON for
//! external analysis.

pub mod json;

pub use json::SnapshotJsonExporter;
