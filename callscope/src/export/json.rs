use crate::analysis::{analyze_hotspots, CallTreeBuilder, CallTreeNode, HotspotOrder, MethodHotspot};
use crate::domain::{ExportError, Nanos, SessionId};
use crate::snapshot::{Snapshot, SnapshotMethod};
use serde::Serialize;
use std::io::Write;

/// Snapshot document written by [`SnapshotJsonExporter`]
#[derive(Debug, Serialize)]
struct SnapshotDocument<'a> {
    /// Tool and version that produced the document
    generator: &'static str,
    session: SessionId,
    #[serde(rename = "timestampMs")]
    timestamp_ms: i64,
    /// Raw method graph, edges as local indices
    methods: &'a [SnapshotMethod],
    /// Methods ranked by exclusive time
    #[serde(skip_serializing_if = "Option::is_none")]
    hotspots: Option<Vec<MethodHotspot>>,
    #[serde(rename = "callTree", skip_serializing_if = "Option::is_none")]
    call_tree: Option<Vec<CallTreeNode>>,
}

/// JSON exporter for external tooling.
///
/// The method graph is always written; the derived views are optional.
pub struct SnapshotJsonExporter<'a> {
    snapshot: &'a Snapshot,
    with_hotspots: bool,
    with_call_tree: bool,
    pretty: bool,
}

impl<'a> SnapshotJsonExporter<'a> {
    #[must_use]
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot, with_hotspots: true, with_call_tree: true, pretty: true }
    }

    #[must_use]
    pub fn hotspots(mut self, enabled: bool) -> Self {
        self.with_hotspots = enabled;
        self
    }

    #[must_use]
    pub fn call_tree(mut self, enabled: bool) -> Self {
        self.with_call_tree = enabled;
        self
    }

    #[must_use]
    pub fn pretty(mut self, enabled: bool) -> Self {
        self.pretty = enabled;
        self
    }

    /// Total net time of the exported methods
    #[must_use]
    pub fn total_net_time_ns(&self) -> Nanos {
        self.snapshot.total_net_time_ns()
    }

    /// Export the snapshot to any writer (file, stdout, buffer).
    ///
    /// # Errors
    /// Serialization or I/O failures.
    pub fn export<W: Write>(&self, mut writer: W) -> Result<(), ExportError> {
        let document = SnapshotDocument {
            generator: callscope_common::AGENT_VERSION,
            session: self.snapshot.session(),
            timestamp_ms: self.snapshot.timestamp_ms(),
            methods: self.snapshot.methods(),
            hotspots: self
                .with_hotspots
                .then(|| analyze_hotspots(self.snapshot, HotspotOrder::ExclusiveTime)),
            call_tree: self.with_call_tree.then(|| CallTreeBuilder::new(self.snapshot).build()),
        };

        if self.pretty {
            serde_json::to_writer_pretty(&mut writer, &document)?;
        } else {
            serde_json::to_writer(&mut writer, &document)?;
        }
        writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::LocalIndex;
    use crate::snapshot::SnapshotEdge;

    fn sample() -> Snapshot {
        Snapshot::new(
            SessionId(3),
            42,
            vec![
                SnapshotMethod {
                    local: LocalIndex(0),
                    name: "app::main()".into(),
                    hits: 1,
                    net_time_ns: 30_000_000,
                    self_time_ns: 0,
                    children: vec![SnapshotEdge { child: LocalIndex(1), time_ns: 10_000_000 }],
                },
                SnapshotMethod {
                    local: LocalIndex(1),
                    name: "app::work()".into(),
                    hits: 2,
                    net_time_ns: 10_000_000,
                    self_time_ns: 0,
                    children: vec![],
                },
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_export_creates_valid_json() {
        let snapshot = sample();
        let mut buffer = Vec::new();
        SnapshotJsonExporter::new(&snapshot).export(&mut buffer).unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert_eq!(parsed["session"], 3);
        assert_eq!(parsed["timestampMs"], 42);
        assert_eq!(parsed["methods"][0]["children"][0]["child"], 1);
        assert_eq!(parsed["hotspots"][0]["name"], "app::main()");
        assert_eq!(parsed["callTree"][0]["children"][0]["name"], "app::work()");
    }

    #[test]
    fn test_optional_sections_can_be_left_out() {
        let snapshot = sample();
        let mut buffer = Vec::new();
        SnapshotJsonExporter::new(&snapshot)
            .hotspots(false)
            .call_tree(false)
            .pretty(false)
            .export(&mut buffer)
            .unwrap();

        let parsed: serde_json::Value = serde_json::from_slice(&buffer).unwrap();
        assert!(parsed.get("hotspots").is_none());
        assert!(parsed.get("callTree").is_none());
        assert_eq!(parsed["methods"].as_array().unwrap().len(), 2);
    }
}
