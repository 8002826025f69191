//! Domain types providing compile-time safety and self-documentation
//!
//! These newtype wrappers keep the three integers that flow through the
//! engine apart: a session generation, a per-session method slot, and the
//! composed id handed to instrumented code.

use serde::Serialize;
use std::fmt;

/// Instrumentation generation.
///
/// Incremented (wrapping at 8 bits) every time the rule set is reloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(transparent)]
pub struct SessionId(pub u8);

impl SessionId {
    /// The session following this one, wrapping after 255
    #[must_use]
    pub fn next(self) -> Self {
        SessionId(self.0.wrapping_add(1))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

/// Slot of a method inside the registry of one session (0-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct LocalIndex(pub u16);

impl LocalIndex {
    #[must_use]
    pub fn index(self) -> usize {
        usize::from(self.0)
    }
}

impl fmt::Display for LocalIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Global method id: `(session << 16) | local index`.
///
/// This is the value the instrumentation layer bakes into call sites. An id
/// whose session is not the current one is stale and ignored by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MethodId(u32);

impl MethodId {
    /// An id that can never match a live session (its session bits exceed 8 bits).
    pub const DETACHED: MethodId = MethodId(u32::MAX);

    #[must_use]
    pub fn new(session: SessionId, local: LocalIndex) -> Self {
        MethodId((u32::from(session.0) << 16) | u32::from(local.0))
    }

    /// Rebuild an id from its raw wire/call-site value
    #[must_use]
    pub fn from_raw(raw: u32) -> Self {
        MethodId(raw)
    }

    #[must_use]
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Session bits, or `None` when they do not fit a session counter
    #[must_use]
    pub fn session(self) -> Option<SessionId> {
        u8::try_from(self.0 >> 16).ok().map(SessionId)
    }

    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn local(self) -> LocalIndex {
        LocalIndex((self.0 & 0xFFFF) as u16)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.session() {
            Some(session) => write!(f, "{}/{}", session.0, self.local().0),
            None => write!(f, "detached"),
        }
    }
}

/// Nanoseconds of wall-clock time, as measured by the engine's clock
pub type Nanos = u64;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_method_id_composition() {
        let id = MethodId::new(SessionId(3), LocalIndex(17));
        assert_eq!(id.raw(), (3 << 16) | 17);
        assert_eq!(id.session(), Some(SessionId(3)));
        assert_eq!(id.local(), LocalIndex(17));
        assert_eq!(id.to_string(), "3/17");
    }

    #[test]
    fn test_session_wraps_at_eight_bits() {
        assert_eq!(SessionId(255).next(), SessionId(0));
        assert_eq!(SessionId(7).next(), SessionId(8));
    }

    #[test]
    fn test_detached_id_has_no_session() {
        assert_eq!(MethodId::DETACHED.session(), None);
        assert_eq!(MethodId::DETACHED.to_string(), "detached");
    }
}
