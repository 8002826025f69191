//! Structured error types for callscope
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! `FatalError` is deliberately separate from everything else: it marks the
//! conditions after which the agent must not keep profiling.

use super::types::{LocalIndex, SessionId};
use thiserror::Error;

/// Engine ceilings that end the profiling agent.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FatalError {
    #[error("Reached limit of {limit} instrumented methods in {session}")]
    MethodLimitExceeded { session: SessionId, limit: usize },

    #[error("Call stack of thread '{thread}' exceeded {limit} frames")]
    CallStackOverflow { thread: String, limit: usize },
}

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("Not a call-trace snapshot (magic 0x{0:08x})")]
    BadMagic(u32),

    #[error("Unsupported snapshot protocol version {0}")]
    UnsupportedVersion(u32),

    #[error("Unsupported snapshot type {0}")]
    UnsupportedType(u32),

    #[error("Session id {0} does not fit the 8-bit session counter")]
    InvalidSession(u32),

    #[error("Method {0} appears twice in the snapshot")]
    DuplicateMethod(LocalIndex),

    #[error("Method {parent} has an edge to unknown method {child}")]
    DanglingEdge { parent: LocalIndex, child: LocalIndex },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Rule text that could not be parsed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuleParseError {
    #[error("Invalid rule pattern '{0}' (expected 'name(args)')")]
    InvalidPattern(String),

    #[error("Invalid rule action '{0}' (expected accept or reject)")]
    InvalidAction(String),

    #[error("Invalid rule entry '{0}' (expected 'pattern : action')")]
    MissingAction(String),

    #[error("Invalid rule option '{0}'")]
    InvalidOption(String),
}

/// One class that could not be redefined. Collected, never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Could not redefine class {class}: {reason}")]
pub struct RedefineError {
    pub class: String,
    pub reason: String,
}

/// Failure reported by the instrumentation layer while redefining one class.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error(transparent)]
    Redefine(#[from] RedefineError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("Instrumentation layer failure: {0}")]
    Unexpected(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReloadError {
    #[error(transparent)]
    InvalidRules(#[from] RuleParseError),

    #[error(transparent)]
    Fatal(#[from] FatalError),

    #[error("Instrumentation layer failure: {0}")]
    Host(String),
}

impl ReloadError {
    /// Whether the instrumentation state may be corrupt after this error
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ReloadError::InvalidRules(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid agent option '{0}'")]
    UnknownOption(String),

    #[error("Invalid value '{value}' for agent option '{key}'")]
    InvalidValue { key: String, value: String },
}

#[derive(Error, Debug)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start agent server on port {port}: {source}")]
    Bind { port: u16, source: std::io::Error },
}

#[derive(Error, Debug)]
pub enum ServerError {
    #[error("Protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Client not connected")]
    NotConnected,

    #[error("Client already connected")]
    AlreadyConnected,

    #[error("Version of remote agent is incompatible: console is {console} but agent is {agent}")]
    VersionMismatch { console: String, agent: String },

    #[error("Command {command} failed with status {status}")]
    CommandFailed { command: i32, status: i32 },

    #[error("Malformed response: {0}")]
    Protocol(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_error_display() {
        let err = FatalError::MethodLimitExceeded { session: SessionId(2), limit: 65_535 };
        assert_eq!(err.to_string(), "Reached limit of 65535 instrumented methods in session#2");
    }

    #[test]
    fn test_redefine_error_mentions_class() {
        let err = RedefineError { class: "app::Db".to_string(), reason: "locked".to_string() };
        assert!(err.to_string().contains("app::Db"));
        assert!(err.to_string().contains("locked"));
    }

    #[test]
    fn test_only_rule_errors_are_survivable() {
        assert!(!ReloadError::InvalidRules(RuleParseError::InvalidAction("x".into())).is_fatal());
        assert!(ReloadError::Host("boom".into()).is_fatal());
    }
}
