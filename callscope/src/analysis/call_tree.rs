//! Call tree reconstruction from a snapshot's method graph.
//!
//! A snapshot only knows, per method, how much time went to each callee.
//! The tree unfolds that graph from its roots (methods no other method
//! calls) and scales every edge by the share of the root it represents:
//!
//! ```text
//! [  30ms] app::main()                     contribution 1.00
//!   [ 67%;   20ms] app::load()             20ms of main's 30ms
//!     [ 33%;    7ms] app::parse()          10ms of load's 20ms, scaled by 0.67
//! ```
//!
//! Branches whose contribution falls below `min_contribution` are pruned,
//! and a method already on the current path is not expanded again, so
//! recursive graphs stay finite.

// Contribution math runs in f64 and is truncated back to whole nanoseconds
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]

use crate::domain::{LocalIndex, Nanos};
use crate::snapshot::{Snapshot, SnapshotMethod};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt::Write;

// =============================================================================
// OPTIONS
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CallTreeOptions {
    /// Roots kept, largest net time first
    pub max_roots: usize,
    /// Smallest share of the root a branch may represent (0.0 - 1.0)
    pub min_contribution: f64,
    /// Methods with less net time are left out
    pub min_total_time_ns: Nanos,
}

impl Default for CallTreeOptions {
    fn default() -> Self {
        Self { max_roots: 30, min_contribution: 0.05, min_total_time_ns: 1_000_000 }
    }
}

// =============================================================================
// TREE NODES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CallTreeNode {
    pub local: LocalIndex,
    pub name: String,
    /// Net time for a root, otherwise the edge time scaled by the parent's
    /// contribution
    pub time_ns: Nanos,
    /// Share of the root's time this node represents
    pub contribution: f64,
    pub children: Vec<CallTreeNode>,
}

impl CallTreeNode {
    /// Number of nodes in this subtree, itself included
    #[must_use]
    pub fn size(&self) -> usize {
        1 + self.children.iter().map(CallTreeNode::size).sum::<usize>()
    }
}

// =============================================================================
// BUILDER
// =============================================================================

pub struct CallTreeBuilder<'a> {
    snapshot: &'a Snapshot,
    options: CallTreeOptions,
}

impl<'a> CallTreeBuilder<'a> {
    #[must_use]
    pub fn new(snapshot: &'a Snapshot) -> Self {
        Self { snapshot, options: CallTreeOptions::default() }
    }

    #[must_use]
    pub fn with_options(mut self, options: CallTreeOptions) -> Self {
        self.options = options;
        self
    }

    /// Methods that never appear as a child, largest net time first
    #[must_use]
    pub fn root_methods(&self) -> Vec<&'a SnapshotMethod> {
        let called: HashSet<LocalIndex> = self
            .snapshot
            .methods()
            .iter()
            .flat_map(|m| m.children.iter().map(|e| e.child))
            .collect();
        let mut roots: Vec<&SnapshotMethod> =
            self.snapshot.methods().iter().filter(|m| !called.contains(&m.local)).collect();
        roots.sort_by(|a, b| b.net_time_ns.cmp(&a.net_time_ns).then_with(|| a.name.cmp(&b.name)));
        roots
    }

    #[must_use]
    pub fn build(&self) -> Vec<CallTreeNode> {
        let mut path = Vec::new();
        self.root_methods()
            .into_iter()
            .take(self.options.max_roots)
            .filter_map(|root| self.expand(root, root.net_time_ns, 1.0, &mut path))
            .collect()
    }

    fn expand(
        &self,
        method: &SnapshotMethod,
        time_ns: Nanos,
        contribution: f64,
        path: &mut Vec<LocalIndex>,
    ) -> Option<CallTreeNode> {
        if path.contains(&method.local) || method.net_time_ns < self.options.min_total_time_ns {
            return None;
        }

        let mut edges: Vec<(&SnapshotMethod, Nanos)> = self.snapshot.children(method).collect();
        edges.sort_by(|(a, ta), (b, tb)| tb.cmp(ta).then_with(|| a.name.cmp(&b.name)));

        path.push(method.local);
        let mut children = Vec::new();
        for (child, edge_time) in edges {
            if method.net_time_ns == 0 {
                break;
            }
            let share = edge_time as f64 / method.net_time_ns as f64;
            let child_contribution = contribution * share;
            if child_contribution < self.options.min_contribution {
                continue;
            }
            let child_time = (contribution * edge_time as f64) as Nanos;
            if let Some(node) = self.expand(child, child_time, child_contribution, path) {
                children.push(node);
            }
        }
        path.pop();

        Some(CallTreeNode {
            local: method.local,
            name: method.name.clone(),
            time_ns,
            contribution,
            children,
        })
    }
}

/// Indented text rendering, one node per line.
#[must_use]
pub fn render_tree(roots: &[CallTreeNode]) -> String {
    fn render_node(out: &mut String, node: &CallTreeNode, depth: usize) {
        let ms = node.time_ns as f64 / 1_000_000.0;
        let indent = "  ".repeat(depth);
        let _ = if depth == 0 {
            writeln!(out, "{indent}[{ms:8.1}ms] {}", node.name)
        } else {
            writeln!(out, "{indent}[{:3.0}%; {ms:8.1}ms] {}", node.contribution * 100.0, node.name)
        };
        for child in &node.children {
            render_node(out, child, depth + 1);
        }
    }

    let mut out = String::new();
    for root in roots {
        render_node(&mut out, root, 0);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionId;
    use crate::snapshot::SnapshotEdge;

    const MS: Nanos = 1_000_000;

    fn method(local: u16, name: &str, net: Nanos, children: &[(u16, Nanos)]) -> SnapshotMethod {
        SnapshotMethod {
            local: LocalIndex(local),
            name: name.to_string(),
            hits: 1,
            net_time_ns: net,
            self_time_ns: 0,
            children: children
                .iter()
                .map(|&(child, time_ns)| SnapshotEdge { child: LocalIndex(child), time_ns })
                .collect(),
        }
    }

    fn snapshot(methods: Vec<SnapshotMethod>) -> Snapshot {
        Snapshot::new(SessionId(0), 0, methods).unwrap()
    }

    #[test]
    fn test_tree_scales_contributions() {
        let snap = snapshot(vec![
            method(0, "main", 30 * MS, &[(1, 20 * MS)]),
            method(1, "load", 20 * MS, &[(2, 10 * MS)]),
            method(2, "parse", 10 * MS, &[]),
        ]);
        let roots = CallTreeBuilder::new(&snap).build();
        assert_eq!(roots.len(), 1);

        let load = &roots[0].children[0];
        assert_eq!(load.time_ns, 20 * MS);
        assert!((load.contribution - 2.0 / 3.0).abs() < 1e-9);

        let parse = &load.children[0];
        assert!((parse.contribution - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(parse.time_ns, 6_666_666);
    }

    #[test]
    fn test_small_branches_are_pruned() {
        let snap = snapshot(vec![
            method(0, "main", 100 * MS, &[(1, 90 * MS), (2, 4 * MS)]),
            method(1, "hot", 90 * MS, &[]),
            method(2, "cold", 4 * MS, &[]),
        ]);
        let roots = CallTreeBuilder::new(&snap).build();
        let names: Vec<_> = roots[0].children.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["hot"]);
    }

    #[test]
    fn test_recursion_is_cut() {
        let snap = snapshot(vec![
            method(0, "main", 10 * MS, &[(1, 10 * MS)]),
            method(1, "walk", 10 * MS, &[(1, 8 * MS)]),
        ]);
        let roots = CallTreeBuilder::new(&snap).build();
        assert_eq!(roots[0].size(), 2);
    }

    #[test]
    fn test_roots_are_uncalled_methods_limited_by_count() {
        let snap = snapshot(vec![
            method(0, "a", 5 * MS, &[]),
            method(1, "b", 9 * MS, &[(2, MS)]),
            method(2, "c", MS, &[]),
        ]);
        let options = CallTreeOptions { max_roots: 1, ..CallTreeOptions::default() };
        let builder = CallTreeBuilder::new(&snap).with_options(options);
        let root_names: Vec<_> = builder.root_methods().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(root_names, vec!["b", "a"]);

        let roots = builder.build();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].name, "b");
    }

    #[test]
    fn test_methods_below_minimum_time_are_skipped() {
        let snap = snapshot(vec![method(0, "tiny", MS / 2, &[])]);
        assert!(CallTreeBuilder::new(&snap).build().is_empty());
    }

    #[test]
    fn test_render_tree_indents_children() {
        let snap = snapshot(vec![
            method(0, "main", 30 * MS, &[(1, 20 * MS)]),
            method(1, "load", 20 * MS, &[]),
        ]);
        let text = render_tree(&CallTreeBuilder::new(&snap).build());
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "[    30.0ms] main");
        assert_eq!(lines[1], "  [ 67%;     20.0ms] load");
    }
}
