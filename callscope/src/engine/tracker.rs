//! Per-thread call stack tracking
//!
//! A [`ThreadCallState`] follows the instrumented calls of a single thread:
//!
//! ```text
//! IDLE ──enter──► ACTIVE(1) ──enter──► ACTIVE(2) ...
//!   ▲                 │                   │
//!   └──────exit───────┘◄──────exit────────┘
//! ```
//!
//! Every enter pushes a frame, recursive ones included, so unwinding always
//! pops the frame that was pushed last. A per-method recursion counter makes
//! sure only the outermost invocation of a recursive chain produces a
//! [`Sample`].

use crate::domain::{FatalError, LocalIndex, Nanos};
use std::sync::Arc;
use std::thread::{self, ThreadId};

/// Identity of a thread that has entered instrumented code.
///
/// Each thread owns its token through a thread local; the engine only holds
/// weak references, so a dropped token means the thread has terminated.
#[derive(Debug)]
pub struct ThreadToken {
    id: ThreadId,
    os_tid: i64,
    name: String,
}

impl ThreadToken {
    /// Describe the calling thread
    #[must_use]
    pub fn current() -> Self {
        let current = thread::current();
        let name = current.name().map_or_else(|| format!("{:?}", current.id()), str::to_string);
        Self { id: current.id(), os_tid: current_os_tid(), name }
    }

    #[must_use]
    pub fn id(&self) -> ThreadId {
        self.id
    }

    /// Kernel thread id (0 where the platform does not expose one)
    #[must_use]
    pub fn os_tid(&self) -> i64 {
        self.os_tid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(target_os = "linux")]
fn current_os_tid() -> i64 {
    // SAFETY: gettid takes no arguments, cannot fail and touches no memory
    #[allow(unsafe_code)]
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    i64::from(tid)
}

#[cfg(not(target_os = "linux"))]
fn current_os_tid() -> i64 {
    0
}

thread_local! {
    static CURRENT_THREAD: Arc<ThreadToken> = Arc::new(ThreadToken::current());
}

/// Token of the calling thread, or `None` while thread locals are being torn down.
pub(crate) fn current_token() -> Option<Arc<ThreadToken>> {
    CURRENT_THREAD.try_with(Arc::clone).ok()
}

/// One completed outermost invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub method: LocalIndex,
    /// Frame that was below the returning one, if any
    pub parent: Option<LocalIndex>,
    pub elapsed: Nanos,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    method: LocalIndex,
    start_ns: Nanos,
}

/// Open call frames and recursion counters of one thread.
#[derive(Debug)]
pub struct ThreadCallState {
    thread_name: String,
    max_depth: usize,
    frames: Vec<Frame>,
    recursion: Vec<u32>,
}

impl ThreadCallState {
    #[must_use]
    pub fn new(thread_name: impl Into<String>, max_depth: usize) -> Self {
        Self { thread_name: thread_name.into(), max_depth, frames: Vec::new(), recursion: Vec::new() }
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.frames.is_empty()
    }

    /// Open recursive invocations of `method` on this thread
    #[must_use]
    pub fn recursion_depth(&self, method: LocalIndex) -> u32 {
        self.recursion.get(method.index()).copied().unwrap_or(0)
    }

    /// Push a frame for `method`.
    ///
    /// # Errors
    /// `FatalError::CallStackOverflow` if the stack already holds `max_depth`
    /// frames. The state is left untouched in that case.
    pub fn enter(&mut self, method: LocalIndex, now: Nanos) -> Result<(), FatalError> {
        if self.frames.len() >= self.max_depth {
            return Err(FatalError::CallStackOverflow {
                thread: self.thread_name.clone(),
                limit: self.max_depth,
            });
        }

        let slot = method.index();
        if slot >= self.recursion.len() {
            self.recursion.resize(slot + 1, 0);
        }
        self.recursion[slot] = self.recursion[slot].saturating_add(1);

        // Only the outermost frame of a recursive chain is ever timed, but
        // inner frames still need a slot so pops stay balanced.
        self.frames.push(Frame { method, start_ns: now });
        Ok(())
    }

    /// Pop the top frame.
    ///
    /// The caller's id is not compared with the frame: instrumented code
    /// always exits the method it entered last. Returns a sample when the
    /// popped frame closes the outermost invocation of its method, and
    /// `None` for inner recursive frames or an unbalanced exit.
    pub fn exit(&mut self, now: Nanos) -> Option<Sample> {
        let frame = self.frames.pop()?;
        let counter = self.recursion.get_mut(frame.method.index())?;
        *counter = counter.saturating_sub(1);
        if *counter > 0 {
            return None;
        }
        Some(Sample {
            method: frame.method,
            parent: self.frames.last().map(|f| f.method),
            elapsed: now.saturating_sub(frame.start_ns),
        })
    }

    /// Samples the open frames would produce if they all returned at `now`,
    /// innermost first. The real stack is left alone.
    #[must_use]
    pub fn unwind_samples(&self, now: Nanos) -> Vec<Sample> {
        let mut recursion = self.recursion.clone();
        let mut samples = Vec::new();

        for (depth, frame) in self.frames.iter().enumerate().rev() {
            let Some(counter) = recursion.get_mut(frame.method.index()) else {
                continue;
            };
            *counter = counter.saturating_sub(1);
            if *counter == 0 {
                samples.push(Sample {
                    method: frame.method,
                    parent: depth.checked_sub(1).map(|below| self.frames[below].method),
                    elapsed: now.saturating_sub(frame.start_ns),
                });
            }
        }
        samples
    }

    /// Restart the running duration of every open frame at `now`
    pub fn resync(&mut self, now: Nanos) {
        for frame in &mut self.frames {
            frame.start_ns = now;
        }
    }

    /// Open methods, innermost first
    pub fn stack(&self) -> impl Iterator<Item = LocalIndex> + '_ {
        self.frames.iter().rev().map(|f| f.method)
    }

    /// Drop every frame and counter
    pub fn clear(&mut self) {
        self.frames.clear();
        self.recursion.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: LocalIndex = LocalIndex(0);
    const B: LocalIndex = LocalIndex(1);

    #[test]
    fn test_nested_call_produces_parent_link() {
        let mut state = ThreadCallState::new("main", 16);
        state.enter(A, 0).unwrap();
        state.enter(B, 5).unwrap();
        assert_eq!(state.exit(15), Some(Sample { method: B, parent: Some(A), elapsed: 10 }));
        assert_eq!(state.exit(30), Some(Sample { method: A, parent: None, elapsed: 30 }));
        assert!(state.is_idle());
    }

    #[test]
    fn test_recursion_samples_outermost_only() {
        let mut state = ThreadCallState::new("main", 16);
        for t in 0..3 {
            state.enter(A, t).unwrap();
        }
        assert_eq!(state.recursion_depth(A), 3);
        assert_eq!(state.exit(10), None);
        assert_eq!(state.exit(11), None);
        assert_eq!(state.exit(12), Some(Sample { method: A, parent: None, elapsed: 12 }));
        assert_eq!(state.recursion_depth(A), 0);
    }

    #[test]
    fn test_unbalanced_exit_is_ignored() {
        let mut state = ThreadCallState::new("main", 16);
        assert_eq!(state.exit(3), None);
        assert_eq!(state.depth(), 0);
    }

    #[test]
    fn test_depth_limit_is_fatal_and_leaves_state_alone() {
        let mut state = ThreadCallState::new("worker-1", 2);
        state.enter(A, 0).unwrap();
        state.enter(A, 1).unwrap();
        let err = state.enter(B, 2).unwrap_err();
        assert_eq!(err, FatalError::CallStackOverflow { thread: "worker-1".into(), limit: 2 });
        assert_eq!(state.depth(), 2);
        assert_eq!(state.recursion_depth(B), 0);
    }

    #[test]
    fn test_unwind_samples_do_not_touch_stack() {
        let mut state = ThreadCallState::new("main", 16);
        state.enter(A, 0).unwrap();
        state.enter(B, 4).unwrap();
        state.enter(B, 6).unwrap();

        let samples = state.unwind_samples(10);
        assert_eq!(
            samples,
            vec![
                Sample { method: B, parent: Some(A), elapsed: 6 },
                Sample { method: A, parent: None, elapsed: 10 },
            ]
        );
        assert_eq!(state.depth(), 3);
        assert_eq!(state.recursion_depth(B), 2);
    }

    #[test]
    fn test_resync_restarts_open_frames() {
        let mut state = ThreadCallState::new("main", 16);
        state.enter(A, 0).unwrap();
        state.resync(100);
        assert_eq!(state.exit(130).map(|s| s.elapsed), Some(30));
    }

    #[test]
    fn test_stack_is_innermost_first() {
        let mut state = ThreadCallState::new("main", 16);
        state.enter(A, 0).unwrap();
        state.enter(B, 1).unwrap();
        assert_eq!(state.stack().collect::<Vec<_>>(), vec![B, A]);
    }

    #[test]
    fn test_token_describes_current_thread() {
        let token = current_token().unwrap();
        assert_eq!(token.id(), thread::current().id());
        assert!(!token.name().is_empty());
    }
}
