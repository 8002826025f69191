//! Profiling engine
//!
//! - [`registry`] - per-session method table and its statistics
//! - [`tracker`] - per-thread call stacks and recursion counters
//! - [`state`] - [`ProfilerState`], the lock-guarded owner of both
//! - [`session`] - rule reloads and session transitions
//! - [`clock`] - injectable time source

pub mod clock;
pub mod registry;
pub mod session;
pub mod state;
pub mod tracker;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use registry::{ChildEdge, MethodRecord, MethodRegistry};
pub use session::{
    InstrumentationHost, NoProgress, ReloadProgress, ReloadSummary, SessionController,
};
pub use state::{EngineLimits, MethodRegistrar, ProfilerState, ThreadStack};
pub use tracker::{Sample, ThreadCallState, ThreadToken};
