//! Session controller
//!
//! Applies a new rule set to a running process:
//!
//! ```text
//! 1. parse rules               (invalid text changes nothing)
//! 2. stop recording
//! 3. last rules ← current, current ← new
//! 4. start a new session       (registry and thread states discarded)
//! 5. redefine every loaded class that the last or the new rules touch
//! 6. end the session           (recording resumes)
//! ```
//!
//! Reloads are serialised by the controller's own lock. The engine lock is
//! only taken inside the individual engine calls, because redefinition
//! registers methods through that same engine.

use super::state::{MethodRegistrar, ProfilerState};
use crate::domain::{HostError, RedefineError, ReloadError, SessionId};
use crate::instrument::RuleSet;
use callscope_common::PROGRESS_STRIDE;
use log::{debug, info, warn};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// The layer that turns rules into instrumented code.
pub trait InstrumentationHost: Send + Sync {
    /// Names of every class that can be instrumented
    fn loaded_classes(&self) -> Vec<String>;

    /// Whether any method of `class` currently reports to the engine
    fn is_instrumented(&self, class: &str) -> bool;

    /// Re-instrument `class` under `rules`, registering accepted methods
    /// through `registrar`.
    ///
    /// # Errors
    /// `HostError::Redefine` for a class that could not be redefined,
    /// `HostError::Fatal` when registration hit an engine ceiling.
    fn redefine(
        &self,
        class: &str,
        rules: &RuleSet,
        registrar: &dyn MethodRegistrar,
    ) -> Result<(), HostError>;

    /// Every loaded class with its instrumentation flag
    fn list_classes(&self) -> Vec<(String, bool)> {
        self.loaded_classes()
            .into_iter()
            .map(|class| {
                let instrumented = self.is_instrumented(&class);
                (class, instrumented)
            })
            .collect()
    }
}

/// Receives progress while classes are probed during a reload.
pub trait ReloadProgress {
    fn set_max_value(&mut self, max: usize);
    fn set_value(&mut self, value: usize);
}

/// Progress sink that discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ReloadProgress for NoProgress {
    fn set_max_value(&mut self, _max: usize) {}
    fn set_value(&mut self, _value: usize) {}
}

/// Outcome of a reload that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReloadSummary {
    pub session: SessionId,
    /// Loaded classes considered
    pub probed: usize,
    /// Classes successfully redefined
    pub redefined: usize,
    /// Classes that could not be redefined
    pub errors: Vec<RedefineError>,
    pub elapsed: Duration,
}

#[derive(Debug, Default)]
struct RuleHistory {
    current: RuleSet,
    last: RuleSet,
}

pub struct SessionController {
    profiler: Arc<ProfilerState>,
    history: Mutex<RuleHistory>,
}

impl SessionController {
    #[must_use]
    pub fn new(profiler: Arc<ProfilerState>) -> Self {
        Self { profiler, history: Mutex::new(RuleHistory::default()) }
    }

    fn history(&self) -> MutexGuard<'_, RuleHistory> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn profiler(&self) -> &Arc<ProfilerState> {
        &self.profiler
    }

    /// Rules classes are instrumented with when they are first loaded
    #[must_use]
    pub fn current_rules(&self) -> RuleSet {
        self.history().current.clone()
    }

    /// Install rules without touching any loaded class.
    ///
    /// # Errors
    /// `ReloadError::InvalidRules` if either string fails to parse.
    pub fn install(&self, options: &str, rules: &str) -> Result<(), ReloadError> {
        let rules = RuleSet::parse(options, rules)?;
        let mut history = self.history();
        history.last = std::mem::replace(&mut history.current, rules);
        debug!("Installed {} rules without redefinition", history.current.rules().len());
        Ok(())
    }

    /// Apply new rules to every affected loaded class.
    ///
    /// Per-class failures are collected in the summary. Any other error
    /// leaves recording disabled: the instrumentation state is unknown and
    /// the caller decides whether the process can go on.
    ///
    /// # Errors
    /// `InvalidRules` (nothing changed), `Fatal` or `Host`.
    pub fn reload(
        &self,
        host: &dyn InstrumentationHost,
        options: &str,
        rules: &str,
        progress: &mut dyn ReloadProgress,
    ) -> Result<ReloadSummary, ReloadError> {
        let rules = RuleSet::parse(options, rules)?;
        let started = Instant::now();

        let mut history = self.history();
        self.profiler.set_enabled(false);
        history.last = std::mem::replace(&mut history.current, rules);
        let session = self.profiler.start_new_session();

        let classes = host.loaded_classes();
        progress.set_max_value(classes.len());

        let mut redefined = 0;
        let mut errors = Vec::new();
        for (index, class) in classes.iter().enumerate() {
            if must_redefine(host, &history, class) {
                match host.redefine(class, &history.current, self.profiler.as_ref()) {
                    Ok(()) => redefined += 1,
                    Err(HostError::Redefine(err)) => {
                        warn!("{err}");
                        errors.push(err);
                    }
                    Err(HostError::Fatal(err)) => return Err(err.into()),
                    Err(HostError::Unexpected(msg)) => return Err(ReloadError::Host(msg)),
                }
            }
            let probed = index + 1;
            if probed % PROGRESS_STRIDE == 0 {
                progress.set_value(probed);
            }
        }

        self.profiler.end_session();
        let summary = ReloadSummary {
            session,
            probed: classes.len(),
            redefined,
            errors,
            elapsed: started.elapsed(),
        };
        info!(
            "Reloaded rules in {:.1?}: {} classes probed, {} redefined, {} errors ({session})",
            summary.elapsed,
            summary.probed,
            summary.redefined,
            summary.errors.len()
        );
        Ok(summary)
    }
}

/// A class is redefined if it carries instrumentation now, or if the first
/// matching rule of either the last or the new rules accepts it.
fn must_redefine(host: &dyn InstrumentationHost, history: &RuleHistory, class: &str) -> bool {
    host.is_instrumented(class)
        || history.last.accepts_class(class)
        || history.current.accepts_class(class)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::FatalError;
    use crate::engine::clock::ManualClock;
    use crate::engine::state::EngineLimits;
    use std::collections::HashSet;

    #[derive(Default)]
    struct FakeHost {
        classes: Vec<String>,
        broken: HashSet<String>,
        redefined: Mutex<Vec<String>>,
    }

    impl FakeHost {
        fn with_classes(names: &[&str]) -> Self {
            Self { classes: names.iter().map(|s| (*s).to_string()).collect(), ..Self::default() }
        }
    }

    impl InstrumentationHost for FakeHost {
        fn loaded_classes(&self) -> Vec<String> {
            self.classes.clone()
        }

        fn is_instrumented(&self, _class: &str) -> bool {
            false
        }

        fn redefine(
            &self,
            class: &str,
            _rules: &RuleSet,
            registrar: &dyn MethodRegistrar,
        ) -> Result<(), HostError> {
            if self.broken.contains(class) {
                return Err(RedefineError { class: class.into(), reason: "locked".into() }.into());
            }
            registrar.new_method(&format!("{class}::run()"))?;
            self.redefined.lock().unwrap().push(class.to_string());
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder {
        max: Option<usize>,
        values: Vec<usize>,
    }

    impl ReloadProgress for Recorder {
        fn set_max_value(&mut self, max: usize) {
            self.max = Some(max);
        }
        fn set_value(&mut self, value: usize) {
            self.values.push(value);
        }
    }

    fn controller(max_methods: usize) -> SessionController {
        let limits = EngineLimits { max_methods, ..EngineLimits::default() };
        let clock = Arc::new(ManualClock::new(0));
        SessionController::new(Arc::new(ProfilerState::new(limits, clock)))
    }

    #[test]
    fn test_reload_redefines_only_matching_classes() {
        let controller = controller(100);
        let host = FakeHost::with_classes(&["app::Db", "app::Cache", "lib::Json"]);

        let summary =
            controller.reload(&host, "", "app::Db::*(*) : accept", &mut NoProgress).unwrap();

        assert_eq!(summary.session, SessionId(1));
        assert_eq!((summary.probed, summary.redefined), (3, 1));
        assert_eq!(*host.redefined.lock().unwrap(), vec!["app::Db".to_string()]);
        assert!(controller.profiler().is_enabled());
        assert_eq!(controller.profiler().method_count(), 1);
    }

    #[test]
    fn test_previously_accepted_classes_are_restored() {
        let controller = controller(100);
        let host = FakeHost::with_classes(&["app::Db"]);
        controller.reload(&host, "", "app::*(*) : accept", &mut NoProgress).unwrap();

        let summary = controller.reload(&host, "", "*(*):reject", &mut NoProgress).unwrap();
        assert_eq!(summary.redefined, 1);
    }

    #[test]
    fn test_class_failures_are_collected() {
        let mut host = FakeHost::with_classes(&["app::A", "app::B"]);
        host.broken.insert("app::A".into());
        let controller = controller(100);

        let summary = controller.reload(&host, "", "app::*(*) : accept", &mut NoProgress).unwrap();
        assert_eq!(summary.redefined, 1);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].class, "app::A");
    }

    #[test]
    fn test_method_overflow_aborts_reload_with_recording_off() {
        let host = FakeHost::with_classes(&["app::A", "app::B"]);
        let controller = controller(1);

        let err = controller.reload(&host, "", "app::*(*) : accept", &mut NoProgress).unwrap_err();
        assert!(matches!(err, ReloadError::Fatal(FatalError::MethodLimitExceeded { .. })));
        assert!(!controller.profiler().is_enabled());
    }

    #[test]
    fn test_invalid_rules_change_nothing() {
        let controller = controller(100);
        let host = FakeHost::with_classes(&["app::A"]);
        let err = controller.reload(&host, "", "app::* : accept", &mut NoProgress).unwrap_err();
        assert!(!err.is_fatal());
        assert_eq!(controller.profiler().session(), SessionId(0));
        assert!(controller.profiler().is_enabled());
    }

    #[test]
    fn test_progress_is_reported_every_stride() {
        let names: Vec<String> = (0..120).map(|i| format!("lib::C{i}")).collect();
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        let host = FakeHost::with_classes(&refs);
        let controller = controller(100);

        let mut progress = Recorder::default();
        controller.reload(&host, "", "", &mut progress).unwrap();
        assert_eq!(progress.max, Some(120));
        assert_eq!(progress.values, vec![50, 100]);
    }

    #[test]
    fn test_install_sets_rules_without_new_session() {
        let controller = controller(100);
        controller.install("", "app::*(*) : accept").unwrap();
        assert_eq!(controller.current_rules().rules().len(), 1);
        assert_eq!(controller.profiler().session(), SessionId(0));
    }
}
