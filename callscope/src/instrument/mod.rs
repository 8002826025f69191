//! Instrumentation layer
//!
//! Decides which methods report to the engine ([`rules`], [`accessor`]) and
//! provides the probes that do the reporting ([`probe`]).

pub mod accessor;
pub mod probe;
pub mod rules;

pub use accessor::{is_accessor_like, Access, MethodSignature, Modifiers};
pub use probe::{CallHooks, MethodDescriptor, MethodProbe, ProbeGuard, ProbeTable};
pub use rules::{Action, Rule, RuleOptions, RuleSet, BUILTIN_DEFAULT_OPTIONS, RESTORE_ALL_RULES};
