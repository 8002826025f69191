//! Method registry
//!
//! Table of every method instrumented in the current session, indexed by the
//! method's local slot. Records carry the live statistics the tracker
//! accumulates: hit count, net time, self time and the weighted edges to the
//! methods they call.
//!
//! The registry is not synchronised on its own; `ProfilerState` owns it
//! behind the engine lock.

use super::tracker::Sample;
use crate::domain::{FatalError, LocalIndex, MethodId, Nanos, SessionId};
use callscope_common::MAX_METHODS_PER_SESSION;

/// Time attributed by a caller to one of its callees
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildEdge {
    pub child: LocalIndex,
    pub time_ns: Nanos,
}

/// Live statistics of one instrumented method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodRecord {
    local: LocalIndex,
    name: String,
    hits: u32,
    net_time_ns: Nanos,
    self_time_ns: Nanos,
    children: Vec<ChildEdge>,
}

impl MethodRecord {
    fn new(local: LocalIndex, name: String) -> Self {
        Self { local, name, hits: 0, net_time_ns: 0, self_time_ns: 0, children: Vec::new() }
    }

    #[must_use]
    pub fn local(&self) -> LocalIndex {
        self.local
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Completed (outermost) invocations
    #[must_use]
    pub fn hits(&self) -> u32 {
        self.hits
    }

    /// Inclusive time across all invocations
    #[must_use]
    pub fn net_time_ns(&self) -> Nanos {
        self.net_time_ns
    }

    /// Always zero: the aggregation path does not compute self time.
    #[must_use]
    pub fn self_time_ns(&self) -> Nanos {
        self.self_time_ns
    }

    #[must_use]
    pub fn children(&self) -> &[ChildEdge] {
        &self.children
    }

    fn record_sample(&mut self, elapsed: Nanos) {
        self.hits = self.hits.saturating_add(1);
        self.net_time_ns = self.net_time_ns.saturating_add(elapsed);
    }

    fn add_child_time(&mut self, child: LocalIndex, elapsed: Nanos) {
        // Fan-out is small, a linear scan beats hashing here
        match self.children.iter_mut().find(|edge| edge.child == child) {
            Some(edge) => edge.time_ns = edge.time_ns.saturating_add(elapsed),
            None => self.children.push(ChildEdge { child, time_ns: elapsed }),
        }
    }

    fn clear_stats(&mut self) {
        self.hits = 0;
        self.net_time_ns = 0;
        self.self_time_ns = 0;
        self.children.clear();
    }
}

/// Fold one completed invocation into a table of records indexed by local slot.
///
/// Samples referring to slots outside the table are dropped.
pub(crate) fn apply_sample(records: &mut [MethodRecord], sample: Sample) {
    let Some(record) = records.get_mut(sample.method.index()) else {
        return;
    };
    record.record_sample(sample.elapsed);

    if let Some(parent) = sample.parent.and_then(|p| records.get_mut(p.index())) {
        parent.add_child_time(sample.method, sample.elapsed);
    }
}

/// Per-session table of method records.
#[derive(Debug)]
pub struct MethodRegistry {
    session: SessionId,
    max_methods: usize,
    records: Vec<MethodRecord>,
}

impl MethodRegistry {
    /// Create an empty registry at session 0.
    ///
    /// `max_methods` is clamped to what a 16-bit local index can address.
    #[must_use]
    pub fn new(max_methods: usize) -> Self {
        Self {
            session: SessionId::default(),
            max_methods: max_methods.min(MAX_METHODS_PER_SESSION),
            records: Vec::new(),
        }
    }

    #[must_use]
    pub fn session(&self) -> SessionId {
        self.session
    }

    #[must_use]
    pub fn max_methods(&self) -> usize {
        self.max_methods
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Allocate the next local slot of the current session.
    ///
    /// # Errors
    /// `FatalError::MethodLimitExceeded` once the session already holds
    /// `max_methods` records.
    pub fn register(&mut self, name: impl Into<String>) -> Result<MethodId, FatalError> {
        let overflow =
            || FatalError::MethodLimitExceeded { session: self.session, limit: self.max_methods };
        if self.records.len() >= self.max_methods {
            return Err(overflow());
        }
        let local = LocalIndex(u16::try_from(self.records.len()).map_err(|_| overflow())?);
        self.records.push(MethodRecord::new(local, name.into()));
        Ok(MethodId::new(self.session, local))
    }

    /// Local slot of `id`, or `None` if the id is stale or was never issued.
    #[must_use]
    pub fn resolve(&self, id: MethodId) -> Option<LocalIndex> {
        if id.session() != Some(self.session) {
            return None;
        }
        let local = id.local();
        (local.index() < self.records.len()).then_some(local)
    }

    #[must_use]
    pub fn get(&self, id: MethodId) -> Option<&MethodRecord> {
        self.resolve(id).and_then(|local| self.record(local))
    }

    #[must_use]
    pub fn record(&self, local: LocalIndex) -> Option<&MethodRecord> {
        self.records.get(local.index())
    }

    #[must_use]
    pub fn records(&self) -> &[MethodRecord] {
        &self.records
    }

    pub(crate) fn apply(&mut self, sample: Sample) {
        apply_sample(&mut self.records, sample);
    }

    /// Zero every counter and drop every edge. Slots and names survive.
    pub fn reset_stats(&mut self) {
        for record in &mut self.records {
            record.clear_stats();
        }
    }

    /// Advance the session counter and forget every record.
    pub fn start_new_session(&mut self) -> SessionId {
        self.session = self.session.next();
        self.records.clear();
        self.session
    }
}
