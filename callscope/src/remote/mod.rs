//! Remote command channel between a console and the in-process agent
//!
//! - [`server`] - agent side, tokio based, one console at a time
//! - [`client`] - console side, blocking
//! - [`payload`] - response bodies of the introspection commands
//! - [`introspect`] - where those bodies come from (`/proc/self`)

pub mod client;
pub mod introspect;
pub mod payload;
pub mod server;

pub use client::Client;
pub use payload::{ClassInfo, MemoryInfo, MemoryUsage, RuntimeInfo, ThreadInfo, ThreadState};
