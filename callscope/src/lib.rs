//! # callscope - In-Process Call Profiler
//!
//! callscope records how often instrumented methods are called and how much
//! wall-clock time they take, including the time attributed to each callee.
//! An agent lives inside the profiled process; a console drives it over TCP.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Profiled Application                       │
//! │          probe.enter(&agent) ... guard dropped on return        │
//! └───────────────────────┬─────────────────────────────────────────┘
//!                         │ enter / exit (method id)
//!                         ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Agent (this crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │  Instrument  │──▶│    Engine    │──▶│   Snapshot   │         │
//! │  │ (probes,     │   │ (registry,   │   │ (model,      │         │
//! │  │  rules)      │   │  tracker)    │   │  codec)      │         │
//! │  └──────────────┘   └──────────────┘   └──────┬───────┘         │
//! │         ▲                   ▲                  │                 │
//! │         │   reload          │ gc / reset       │                 │
//! │  ┌──────┴───────────────────┴──────────────────▼───────┐         │
//! │  │        Command server (remote::server, tokio)       │         │
//! │  └─────────────────────────┬───────────────────────────┘         │
//! └────────────────────────────┼────────────────────────────────────┘
//!                              │ TCP, big-endian frames
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │     Console: remote::Client, analysis (hotspots, call tree),    │
//! │              export (JSON), the `callscope` binary              │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! ### Agent Side
//!
//! - [`engine`]: method registry, per-thread call tracking, sessions
//!   - Every statistic lives behind one lock in [`engine::ProfilerState`]
//!   - A new rule set starts a new session and discards all records
//! - [`instrument`]: rules deciding what is instrumented, and the probe table
//!   applications declare their methods in
//! - [`agent`]: ties engine, probes and command server together
//! - [`config`]: the `key=value` agent options
//!
//! ### Shared
//!
//! - [`snapshot`]: frozen statistics and their binary format
//! - [`remote`]: command server, client and introspection payloads
//! - [`domain`]: core types (`MethodId`, `SessionId`) and errors
//!
//! ### Console Side
//!
//! - [`analysis`]: hotspot rankings and call tree reconstruction
//! - [`export`]: JSON export for external tools
//! - [`cli`]: command-line arguments of the console
//!
//! ## Typical Usage
//!
//! ```bash
//! # Start the application with the agent listening on port 7890
//! CALLSCOPE_AGENT="port=7890" ./my-app
//!
//! # Instrument a module, then watch the hottest methods
//! callscope apply 'shop::*(*) : accept'
//! callscope watch --by exclusive
//! ```
//!
//! ## Key Concepts
//!
//! - **Session**: one rule set's lifetime; method ids carry the session in
//!   their upper bits, so stale ids from an older session are ignored
//! - **Net time**: wall time of a call including its callees
//! - **Child edge**: time a method spent in one particular callee
//! - **Exclusive time**: net time minus all child edges

pub mod agent;
pub mod analysis;
pub mod cli;
pub mod config;
pub mod domain;
pub mod engine;
pub mod export;
pub mod instrument;
pub mod remote;
pub mod snapshot;

pub use agent::{Agent, RulesOutcome};
pub use config::AgentConfig;
