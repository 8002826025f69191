//! Probe table instrumentation
//!
//! Code that wants to be profiled declares its classes and methods up front
//! and wraps each call in a [`ProbeGuard`]:
//!
//! ```ignore
//! let probe = agent.probe("shop::Cart", "checkout").unwrap();
//! let _guard = probe.enter(&*agent);
//! // ... method body ...
//! ```
//!
//! Every probe carries the method id it reports under. Redefining a class
//! re-arms the probes its rules accept with ids of the current session and
//! disarms the rest, which is what a call site rewrite would do.

use super::accessor::{MethodSignature, Modifiers};
use super::rules::RuleSet;
use crate::domain::{FatalError, HostError, MethodId, RedefineError};
use crate::engine::{InstrumentationHost, MethodRegistrar};
use log::debug;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Receives the enter/exit calls of armed probes.
pub trait CallHooks: Send + Sync {
    fn enter_method(&self, id: MethodId);
    fn exit_method(&self, id: MethodId);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodDescriptor {
    pub signature: MethodSignature,
    pub modifiers: Modifiers,
}

impl MethodDescriptor {
    /// A public instance method
    #[must_use]
    pub fn public(name: &str, params: &[&str], returns: Option<&str>) -> Self {
        Self { signature: MethodSignature::new(name, params, returns), modifiers: Modifiers::PUBLIC }
    }

    #[must_use]
    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }
}

/// Call site of one method.
#[derive(Debug)]
pub struct MethodProbe {
    descriptor: MethodDescriptor,
    qualified_name: String,
    id: AtomicU32,
}

impl MethodProbe {
    fn new(class: &str, descriptor: MethodDescriptor) -> Self {
        let qualified_name = format!("{class}::{}", descriptor.signature.display_name());
        Self { descriptor, qualified_name, id: AtomicU32::new(MethodId::DETACHED.raw()) }
    }

    /// `class::method(params)`
    #[must_use]
    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    #[must_use]
    pub fn descriptor(&self) -> &MethodDescriptor {
        &self.descriptor
    }

    #[must_use]
    pub fn method_id(&self) -> MethodId {
        MethodId::from_raw(self.id.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.method_id() != MethodId::DETACHED
    }

    fn arm(&self, id: MethodId) {
        self.id.store(id.raw(), Ordering::Release);
    }

    fn disarm(&self) {
        self.arm(MethodId::DETACHED);
    }

    /// Report entry and return a guard reporting the matching exit on drop.
    ///
    /// The exit carries the id read at entry, so a call spanning a
    /// redefinition exits the session it entered.
    #[must_use = "dropping the guard immediately records an empty call"]
    pub fn enter<'a>(&self, hooks: &'a dyn CallHooks) -> ProbeGuard<'a> {
        let id = self.method_id();
        if id != MethodId::DETACHED {
            hooks.enter_method(id);
        }
        ProbeGuard { hooks, id }
    }
}

/// Reports a method exit when dropped
pub struct ProbeGuard<'a> {
    hooks: &'a dyn CallHooks,
    id: MethodId,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.id != MethodId::DETACHED {
            self.hooks.exit_method(self.id);
        }
    }
}

#[derive(Debug, Default)]
struct ClassProbes {
    probes: Vec<Arc<MethodProbe>>,
}

impl ClassProbes {
    fn is_instrumented(&self) -> bool {
        self.probes.iter().any(|p| p.is_armed())
    }
}

/// Arm accepted probes with fresh ids and disarm the others.
fn instrument(
    probes: &[Arc<MethodProbe>],
    rules: &RuleSet,
    registrar: &dyn MethodRegistrar,
) -> Result<usize, FatalError> {
    let mut armed = 0;
    for probe in probes {
        let descriptor = &probe.descriptor;
        if rules.accepts_method(&probe.qualified_name, &descriptor.signature, descriptor.modifiers) {
            probe.arm(registrar.new_method(&probe.qualified_name)?);
            armed += 1;
        } else {
            probe.disarm();
        }
    }
    Ok(armed)
}

/// Every declared class and its method probes.
#[derive(Debug, Default)]
pub struct ProbeTable {
    classes: Mutex<BTreeMap<String, ClassProbes>>,
}

impl ProbeTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn classes(&self) -> MutexGuard<'_, BTreeMap<String, ClassProbes>> {
        self.classes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Load a class: create its probes and instrument them under `rules`.
    ///
    /// Declaring an already loaded class adds the methods it does not have
    /// yet and leaves the existing probes as they are.
    ///
    /// # Errors
    /// `FatalError::MethodLimitExceeded` if registration overflows the session.
    pub fn declare_class(
        &self,
        class: &str,
        methods: Vec<MethodDescriptor>,
        rules: &RuleSet,
        registrar: &dyn MethodRegistrar,
    ) -> Result<Vec<Arc<MethodProbe>>, FatalError> {
        let mut classes = self.classes();
        let entry = classes.entry(class.to_string()).or_default();

        let mut fresh = Vec::new();
        for descriptor in methods {
            if entry.probes.iter().any(|p| p.descriptor == descriptor) {
                continue;
            }
            fresh.push(Arc::new(MethodProbe::new(class, descriptor)));
        }
        // Probes are kept even if arming fails, they just stay detached
        entry.probes.extend(fresh.iter().cloned());
        let armed = instrument(&fresh, rules, registrar)?;
        debug!("Loaded {class}: {} new probes, {armed} instrumented", fresh.len());
        Ok(entry.probes.clone())
    }

    /// Every probe of `class`
    #[must_use]
    pub fn class_probes(&self, class: &str) -> Vec<Arc<MethodProbe>> {
        self.classes().get(class).map(|c| c.probes.clone()).unwrap_or_default()
    }

    /// Probe of the first method of `class` named `method`
    #[must_use]
    pub fn probe(&self, class: &str, method: &str) -> Option<Arc<MethodProbe>> {
        self.classes()
            .get(class)?
            .probes
            .iter()
            .find(|p| p.descriptor.signature.name == method)
            .cloned()
    }

    #[must_use]
    pub fn class_count(&self) -> usize {
        self.classes().len()
    }
}

impl InstrumentationHost for ProbeTable {
    fn loaded_classes(&self) -> Vec<String> {
        self.classes().keys().cloned().collect()
    }

    fn is_instrumented(&self, class: &str) -> bool {
        self.classes().get(class).is_some_and(ClassProbes::is_instrumented)
    }

    fn redefine(
        &self,
        class: &str,
        rules: &RuleSet,
        registrar: &dyn MethodRegistrar,
    ) -> Result<(), HostError> {
        let classes = self.classes();
        let probes = classes.get(class).ok_or_else(|| RedefineError {
            class: class.to_string(),
            reason: "class is not loaded".to_string(),
        })?;
        let armed = instrument(&probes.probes, rules, registrar)?;
        debug!("Redefined {class}: {armed} of {} methods instrumented", probes.probes.len());
        Ok(())
    }
}
