//! Process-wide profiler state
//!
//! [`ProfilerState`] is the single owner of the method registry and of every
//! thread's call state. One mutex guards both: enter/exit, registration,
//! resets, session transitions and snapshots all serialise on it, so the
//! aggregate counters stay exact under any interleaving of threads.
//!
//! # Hot path
//!
//! ```text
//! enter(id)
//!   ├─ recording disabled?  ──► no-op   (atomic, no lock)
//!   ├─ service thread?      ──► no-op   (no lock)
//!   └─ lock
//!        ├─ stale id?       ──► no-op
//!        └─ push frame on this thread's ThreadCallState
//! ```
//!
//! Neither `enter` nor `exit` panics or blocks beyond the lock. The only
//! failure is a [`FatalError`] when a thread exceeds the depth ceiling.

use super::clock::Clock;
use super::registry::{self, MethodRecord, MethodRegistry};
use super::tracker::{current_token, ThreadCallState, ThreadToken};
use crate::domain::{FatalError, LocalIndex, MethodId, SessionId};
use crate::snapshot::{Snapshot, SnapshotEdge, SnapshotMethod};
use callscope_common::{DEFAULT_MAX_CALL_DEPTH, MAX_METHODS_PER_SESSION};
use log::{debug, error};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::thread::{self, ThreadId};
use std::time::{SystemTime, UNIX_EPOCH};

/// Hard ceilings of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineLimits {
    pub max_methods: usize,
    pub max_call_depth: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self { max_methods: MAX_METHODS_PER_SESSION, max_call_depth: DEFAULT_MAX_CALL_DEPTH }
    }
}

/// Anything that can hand out method ids for newly instrumented methods.
pub trait MethodRegistrar {
    /// # Errors
    /// `FatalError::MethodLimitExceeded` when the session is full.
    fn new_method(&self, name: &str) -> Result<MethodId, FatalError>;
}

/// Instrumented call stack of a live thread, for thread introspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadStack {
    pub os_tid: i64,
    pub name: String,
    /// Qualified method names, innermost first
    pub frames: Vec<String>,
}

#[derive(Debug)]
struct ThreadSlot {
    owner: Weak<ThreadToken>,
    calls: ThreadCallState,
}

impl ThreadSlot {
    fn is_alive(&self) -> bool {
        self.owner.strong_count() > 0
    }
}

#[derive(Debug)]
struct EngineState {
    registry: MethodRegistry,
    threads: HashMap<ThreadId, ThreadSlot>,
}

impl EngineState {
    fn purge_dead_threads(&mut self) -> usize {
        let before = self.threads.len();
        self.threads.retain(|_, slot| slot.is_alive());
        before - self.threads.len()
    }
}

#[derive(Debug)]
pub struct ProfilerState {
    inner: Mutex<EngineState>,
    enabled: AtomicBool,
    service_thread: OnceLock<ThreadId>,
    clock: Arc<dyn Clock>,
    limits: EngineLimits,
}

impl ProfilerState {
    /// Create the engine with recording enabled at session 0.
    #[must_use]
    pub fn new(limits: EngineLimits, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(EngineState {
                registry: MethodRegistry::new(limits.max_methods),
                threads: HashMap::new(),
            }),
            enabled: AtomicBool::new(true),
            service_thread: OnceLock::new(),
            clock,
            limits,
        }
    }

    fn lock(&self) -> MutexGuard<'_, EngineState> {
        // A panic under the lock leaves counters at worst slightly off, keep going
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn limits(&self) -> EngineLimits {
        self.limits
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Declare the calling thread as the profiler's own service thread.
    ///
    /// Calls made from that thread are never recorded. Only the first
    /// declaration sticks.
    pub fn mark_service_thread(&self) {
        let id = thread::current().id();
        if self.service_thread.set(id).is_err() {
            debug!("Service thread already registered, ignoring {id:?}");
        }
    }

    fn is_service_thread(&self) -> bool {
        self.service_thread.get().is_some_and(|&id| id == thread::current().id())
    }

    #[must_use]
    pub fn session(&self) -> SessionId {
        self.lock().registry.session()
    }

    #[must_use]
    pub fn method_count(&self) -> usize {
        self.lock().registry.len()
    }

    /// Copy of the live record behind `id`, if the id is current
    #[must_use]
    pub fn method(&self, id: MethodId) -> Option<MethodRecord> {
        self.lock().registry.get(id).cloned()
    }

    /// Register a newly instrumented method in the current session.
    ///
    /// # Errors
    /// `FatalError::MethodLimitExceeded` when the session is full.
    pub fn new_method(&self, name: &str) -> Result<MethodId, FatalError> {
        self.lock().registry.register(name)
    }

    /// Record entry into `id` on the calling thread.
    ///
    /// # Errors
    /// `FatalError::CallStackOverflow` when the thread's stack is full.
    pub fn enter(&self, id: MethodId) -> Result<(), FatalError> {
        if !self.is_enabled() || self.is_service_thread() {
            return Ok(());
        }
        let Some(token) = current_token() else {
            return Ok(());
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(local) = state.registry.resolve(id) else {
            return Ok(());
        };
        let now = self.clock.now_ns();
        let max_depth = self.limits.max_call_depth;
        let slot = state.threads.entry(token.id()).or_insert_with(|| ThreadSlot {
            owner: Arc::downgrade(&token),
            calls: ThreadCallState::new(token.name(), max_depth),
        });
        slot.calls.enter(local, now)
    }

    /// Record exit from the method entered last on the calling thread.
    pub fn exit(&self, id: MethodId) {
        if !self.is_enabled() || self.is_service_thread() {
            return;
        }
        let Some(token) = current_token() else {
            return;
        };

        let mut guard = self.lock();
        let state = &mut *guard;
        if state.registry.resolve(id).is_none() {
            return;
        }
        let Some(slot) = state.threads.get_mut(&token.id()) else {
            return;
        };
        if let Some(sample) = slot.calls.exit(self.clock.now_ns()) {
            state.registry.apply(sample);
        }
    }

    /// Zero every statistic while keeping registrations.
    ///
    /// Frames still open restart their running duration now, so calls in
    /// flight only report the time spent after the reset.
    pub fn reset_stats(&self) {
        let mut state = self.lock();
        state.registry.reset_stats();
        state.purge_dead_threads();
        let now = self.clock.now_ns();
        for slot in state.threads.values_mut() {
            slot.calls.resync(now);
        }
    }

    /// Disable recording, discard every record and thread state, and move
    /// to the next session. Recording stays off until [`Self::end_session`].
    pub fn start_new_session(&self) -> SessionId {
        self.set_enabled(false);
        let mut state = self.lock();
        state.threads.clear();
        state.registry.start_new_session()
    }

    pub fn end_session(&self) {
        self.set_enabled(true);
    }

    /// Forget the call states of threads that have terminated.
    pub fn purge_dead_threads(&self) -> usize {
        self.lock().purge_dead_threads()
    }

    /// Number of threads with a call state
    #[must_use]
    pub fn tracked_threads(&self) -> usize {
        self.lock().threads.len()
    }

    /// Freeze the current statistics.
    ///
    /// Calls still running on live threads are included as if they returned
    /// now. This only affects the copy: the live counters and stacks are not
    /// touched, so the real return is still counted once.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let (session, mut frozen) = {
            let mut state = self.lock();
            state.purge_dead_threads();
            let now = self.clock.now_ns();
            let mut frozen = state.registry.records().to_vec();
            for slot in state.threads.values().filter(|slot| !slot.calls.is_idle()) {
                for sample in slot.calls.unwind_samples(now) {
                    registry::apply_sample(&mut frozen, sample);
                }
            }
            (state.registry.session(), frozen)
        };

        frozen.retain(|record| record.hits() > 0);
        let kept: Vec<LocalIndex> = frozen.iter().map(MethodRecord::local).collect();
        let methods = frozen
            .into_iter()
            .map(|record| SnapshotMethod {
                local: record.local(),
                name: record.name().to_string(),
                hits: record.hits(),
                net_time_ns: record.net_time_ns(),
                self_time_ns: record.self_time_ns(),
                children: record
                    .children()
                    .iter()
                    .filter(|edge| kept.binary_search(&edge.child).is_ok())
                    .map(|edge| SnapshotEdge { child: edge.child, time_ns: edge.time_ns })
                    .collect(),
            })
            .collect();

        // Locals are unique and edges were filtered against them above
        freeze(session, methods)
    }

    /// Instrumented stacks of live threads, keyed by kernel thread id.
    #[must_use]
    pub fn thread_stacks(&self) -> HashMap<i64, ThreadStack> {
        let state = self.lock();
        state
            .threads
            .values()
            .filter_map(|slot| {
                let owner = slot.owner.upgrade()?;
                let frames = slot
                    .calls
                    .stack()
                    .filter_map(|local| state.registry.record(local))
                    .map(|record| record.name().to_string())
                    .collect();
                Some((
                    owner.os_tid(),
                    ThreadStack { os_tid: owner.os_tid(), name: owner.name().to_string(), frames },
                ))
            })
            .collect()
    }
}

impl MethodRegistrar for ProfilerState {
    fn new_method(&self, name: &str) -> Result<MethodId, FatalError> {
        ProfilerState::new_method(self, name)
    }
}

fn freeze(session: SessionId, methods: Vec<SnapshotMethod>) -> Snapshot {
    Snapshot::new(session, unix_millis(), methods).unwrap_or_else(|e| {
        error!("Inconsistent method graph, sending an empty snapshot: {e}");
        Snapshot::empty(session, unix_millis())
    })
}

fn unix_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
