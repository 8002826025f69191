//! Analysis of call-trace snapshots
//!
//! Pure functions over a [`crate::snapshot::Snapshot`], shared by the console
//! commands and the exporters.

pub mod call_tree;
pub mod hotspot_analyzer;

pub use call_tree::{render_tree, CallTreeBuilder, CallTreeNode, CallTreeOptions};
pub use hotspot_analyzer::{analyze_hotspots, exclusive_time_ns, HotspotOrder, MethodHotspot};
