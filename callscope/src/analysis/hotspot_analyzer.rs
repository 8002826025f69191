//! Hotspot analysis of call-trace snapshots.
//!
//! Ranks the methods of a [`Snapshot`] by one of their statistics so the
//! console can show where the time went.
//!
//! # Exclusive Time
//!
//! Snapshots carry net time (inclusive of callees) and the time each edge
//! attributes to a child. The time spent in a method's own body is derived:
//!
//! ```text
//! exclusive = net - Σ child edge times
//!
//! A [net 30ms] ──10ms──▶ B [net 10ms]
//!   exclusive(A) = 20ms, exclusive(B) = 10ms
//! ```
//!
//! Exclusive times of all methods add up to the profiled wall time, which
//! makes them the denominator of [`MethodHotspot::percentage`].

// Percentage calculations intentionally convert u64 to f64
#![allow(clippy::cast_precision_loss)]

use crate::domain::{LocalIndex, Nanos};
use crate::snapshot::{Snapshot, SnapshotMethod};
use serde::Serialize;
use std::cmp::Reverse;
use std::str::FromStr;

// =============================================================================
// RANKING ORDER
// =============================================================================

/// Statistic a hotspot list is sorted by, largest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HotspotOrder {
    NetTime,
    SelfTime,
    Hits,
    #[default]
    ExclusiveTime,
}

impl FromStr for HotspotOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "net" => Ok(Self::NetTime),
            "self" => Ok(Self::SelfTime),
            "hits" => Ok(Self::Hits),
            "exclusive" => Ok(Self::ExclusiveTime),
            other => Err(format!("unknown ranking '{other}' (net, self, hits, exclusive)")),
        }
    }
}

// =============================================================================
// METHOD HOTSPOT (OUTPUT TYPE)
// =============================================================================

/// One method with its statistics and derived exclusive time.
///
/// ```text
///  EXCL %   HITS      NET ms   METHOD
///   42.3%    120     812.004   shop::Cart::checkout(&User)
///   18.7%   9000     360.118   shop::Tax::rate(u32)
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MethodHotspot {
    pub local: LocalIndex,
    pub name: String,
    pub hits: u32,
    pub net_time_ns: Nanos,
    pub self_time_ns: Nanos,
    /// Net time minus the time attributed to children
    pub exclusive_time_ns: Nanos,
    /// Share of the snapshot's total exclusive time (0.0 - 100.0)
    pub percentage: f64,
}

impl MethodHotspot {
    fn from_method(method: &SnapshotMethod, total_exclusive: Nanos) -> Self {
        let exclusive_time_ns = exclusive_time_ns(method);
        let percentage = if total_exclusive > 0 {
            (exclusive_time_ns as f64 / total_exclusive as f64) * 100.0
        } else {
            0.0
        };
        Self {
            local: method.local,
            name: method.name.clone(),
            hits: method.hits,
            net_time_ns: method.net_time_ns,
            self_time_ns: method.self_time_ns,
            exclusive_time_ns,
            percentage,
        }
    }

    /// Average net time per completed call
    #[must_use]
    pub fn mean_net_time_ns(&self) -> Nanos {
        if self.hits == 0 {
            0
        } else {
            self.net_time_ns / u64::from(self.hits)
        }
    }
}

/// Time spent in the method's own body.
///
/// Saturates at zero: a call still running in a child when the snapshot was
/// taken can attribute more to the edge than the parent has accumulated.
#[must_use]
pub fn exclusive_time_ns(method: &SnapshotMethod) -> Nanos {
    method.net_time_ns.saturating_sub(method.child_time_ns())
}

/// Rank every method of `snapshot` by `order` (largest first, ties by name).
#[must_use]
pub fn analyze_hotspots(snapshot: &Snapshot, order: HotspotOrder) -> Vec<MethodHotspot> {
    let total_exclusive: Nanos = snapshot.methods().iter().map(exclusive_time_ns).sum();

    let mut hotspots: Vec<MethodHotspot> = snapshot
        .methods()
        .iter()
        .map(|m| MethodHotspot::from_method(m, total_exclusive))
        .collect();

    hotspots.sort_by(|a, b| {
        let key = |h: &MethodHotspot| match order {
            HotspotOrder::NetTime => h.net_time_ns,
            HotspotOrder::SelfTime => h.self_time_ns,
            HotspotOrder::Hits => u64::from(h.hits),
            HotspotOrder::ExclusiveTime => h.exclusive_time_ns,
        };
        Reverse(key(a)).cmp(&Reverse(key(b))).then_with(|| a.name.cmp(&b.name))
    });
    hotspots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SessionId;
    use crate::snapshot::SnapshotEdge;

    fn method(local: u16, name: &str, hits: u32, net: u64, children: &[(u16, u64)]) -> SnapshotMethod {
        SnapshotMethod {
            local: LocalIndex(local),
            name: name.to_string(),
            hits,
            net_time_ns: net,
            self_time_ns: 0,
            children: children
                .iter()
                .map(|&(child, time_ns)| SnapshotEdge { child: LocalIndex(child), time_ns })
                .collect(),
        }
    }

    fn create_test_snapshot() -> Snapshot {
        Snapshot::new(
            SessionId(0),
            0,
            vec![
                method(0, "app::main()", 1, 30, &[(1, 10)]),
                method(1, "app::work()", 5, 10, &[]),
            ],
        )
        .unwrap()
    }

    #[test]
    fn test_exclusive_time_subtracts_children() {
        let hotspots = analyze_hotspots(&create_test_snapshot(), HotspotOrder::ExclusiveTime);
        assert_eq!(hotspots[0].name, "app::main()");
        assert_eq!(hotspots[0].exclusive_time_ns, 20);
        assert_eq!(hotspots[1].exclusive_time_ns, 10);
    }

    #[test]
    fn test_percentages_are_shares_of_exclusive_time() {
        let hotspots = analyze_hotspots(&create_test_snapshot(), HotspotOrder::ExclusiveTime);
        assert!((hotspots[0].percentage - 66.666).abs() < 0.01);
        assert!((hotspots[1].percentage - 33.333).abs() < 0.01);
    }

    #[test]
    fn test_rank_by_hits() {
        let hotspots = analyze_hotspots(&create_test_snapshot(), HotspotOrder::Hits);
        assert_eq!(hotspots[0].name, "app::work()");
        assert_eq!(hotspots[0].mean_net_time_ns(), 2);
    }

    #[test]
    fn test_exclusive_time_saturates() {
        let m = method(0, "app::main()", 1, 5, &[(0, 9)]);
        assert_eq!(exclusive_time_ns(&m), 0);
    }

    #[test]
    fn test_parse_order() {
        assert_eq!("NET".parse(), Ok(HotspotOrder::NetTime));
        assert!("latency".parse::<HotspotOrder>().is_err());
    }
}
