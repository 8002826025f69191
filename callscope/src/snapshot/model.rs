//! Frozen call-trace snapshot
//!
//! A [`Snapshot`] is built once, from the engine or from a decoded stream,
//! and never mutated afterwards. Child edges are stored as local indices and
//! resolved on demand through the snapshot, which keeps the method graph
//! (cycles included) free of shared ownership.

use crate::domain::{LocalIndex, Nanos, SessionId, SnapshotError};
use serde::Serialize;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SnapshotEdge {
    pub child: LocalIndex,
    pub time_ns: Nanos,
}

/// Statistics of one method at the moment the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotMethod {
    pub local: LocalIndex,
    pub name: String,
    pub hits: u32,
    pub net_time_ns: Nanos,
    pub self_time_ns: Nanos,
    pub children: Vec<SnapshotEdge>,
}

impl SnapshotMethod {
    /// Time attributed to all callees together
    #[must_use]
    pub fn child_time_ns(&self) -> Nanos {
        self.children.iter().fold(0, |acc, e| acc.saturating_add(e.time_ns))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    session: SessionId,
    timestamp_ms: i64,
    methods: Vec<SnapshotMethod>,
    by_local: HashMap<LocalIndex, usize>,
}

impl Snapshot {
    /// Assemble a snapshot, checking that locals are unique and every edge
    /// points at a method of the snapshot.
    ///
    /// # Errors
    /// `DuplicateMethod` or `DanglingEdge` when the graph is inconsistent.
    pub fn new(
        session: SessionId,
        timestamp_ms: i64,
        mut methods: Vec<SnapshotMethod>,
    ) -> Result<Self, SnapshotError> {
        methods.sort_by_key(|m| m.local);

        let mut by_local = HashMap::with_capacity(methods.len());
        for (position, method) in methods.iter().enumerate() {
            if by_local.insert(method.local, position).is_some() {
                return Err(SnapshotError::DuplicateMethod(method.local));
            }
        }
        for method in &methods {
            if let Some(edge) = method.children.iter().find(|e| !by_local.contains_key(&e.child)) {
                return Err(SnapshotError::DanglingEdge { parent: method.local, child: edge.child });
            }
        }

        Ok(Self { session, timestamp_ms, methods, by_local })
    }

    #[must_use]
    pub fn empty(session: SessionId, timestamp_ms: i64) -> Self {
        Self { session, timestamp_ms, methods: Vec::new(), by_local: HashMap::new() }
    }

    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Milliseconds since the Unix epoch
    #[must_use]
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }

    /// Methods ordered by local index
    #[must_use]
    pub fn methods(&self) -> &[SnapshotMethod] {
        &self.methods
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    #[must_use]
    pub fn method(&self, local: LocalIndex) -> Option<&SnapshotMethod> {
        self.by_local.get(&local).map(|&i| &self.methods[i])
    }

    #[must_use]
    pub fn find(&self, name: &str) -> Option<&SnapshotMethod> {
        self.methods.iter().find(|m| m.name == name)
    }

    /// Callees of `method` with the time attributed to each
    pub fn children<'a>(
        &'a self,
        method: &'a SnapshotMethod,
    ) -> impl Iterator<Item = (&'a SnapshotMethod, Nanos)> + 'a {
        method.children.iter().filter_map(|edge| Some((self.method(edge.child)?, edge.time_ns)))
    }

    /// Total net time over every method (inclusive times, so nested calls count more than once)
    #[must_use]
    pub fn total_net_time_ns(&self) -> Nanos {
        self.methods.iter().fold(0, |acc, m| acc.saturating_add(m.net_time_ns))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(local: u16, name: &str, children: &[(u16, Nanos)]) -> SnapshotMethod {
        SnapshotMethod {
            local: LocalIndex(local),
            name: name.to_string(),
            hits: 1,
            net_time_ns: 100,
            self_time_ns: 0,
            children: children
                .iter()
                .map(|&(child, time_ns)| SnapshotEdge { child: LocalIndex(child), time_ns })
                .collect(),
        }
    }

    #[test]
    fn test_children_resolve_to_methods() {
        let snapshot = Snapshot::new(
            SessionId(1),
            0,
            vec![method(4, "b", &[]), method(2, "a", &[(4, 30)])],
        )
        .unwrap();

        assert_eq!(snapshot.methods()[0].name, "a");
        let a = snapshot.find("a").unwrap();
        let children: Vec<_> = snapshot.children(a).map(|(m, t)| (m.name.as_str(), t)).collect();
        assert_eq!(children, vec![("b", 30)]);
        assert_eq!(a.child_time_ns(), 30);
    }

    #[test]
    fn test_cycles_are_allowed() {
        let snapshot =
            Snapshot::new(SessionId(0), 0, vec![method(0, "a", &[(1, 5)]), method(1, "b", &[(0, 2)])]);
        assert!(snapshot.is_ok());
    }

    #[test]
    fn test_dangling_edge_is_rejected() {
        let err = Snapshot::new(SessionId(0), 0, vec![method(0, "a", &[(9, 5)])]).unwrap_err();
        assert!(matches!(
            err,
            SnapshotError::DanglingEdge { parent: LocalIndex(0), child: LocalIndex(9) }
        ));
    }

    #[test]
    fn test_duplicate_local_is_rejected() {
        let err =
            Snapshot::new(SessionId(0), 0, vec![method(3, "a", &[]), method(3, "b", &[])]).unwrap_err();
        assert!(matches!(err, SnapshotError::DuplicateMethod(LocalIndex(3))));
    }
}
