//! In-process profiling agent
//!
//! The [`Agent`] ties the pieces together for an application that wants to
//! be profiled:
//!
//! ```text
//! Agent::launch(config)
//!   ├─ logging (env_logger, from `verbosity`)
//!   ├─ ProfilerState + SessionController + ProbeTable
//!   ├─ command server thread  (remote::server)
//!   └─ waitconn? block until a console sends the first rules
//! ```
//!
//! Fatal engine conditions end up in one place: the process exits with
//! [`FATAL_EXIT_CODE`] unless `exitonfailure=false`, in which case recording
//! is switched off and the application keeps running unprofiled.

use crate::config::AgentConfig;
use crate::domain::{AgentError, FatalError, MethodId, ReloadError};
use crate::engine::{
    Clock, InstrumentationHost, MonotonicClock, ProfilerState, ReloadProgress, ReloadSummary,
    SessionController,
};
use crate::instrument::{CallHooks, MethodDescriptor, MethodProbe, ProbeTable};
use crate::remote::introspect;
use crate::remote::payload::{ClassInfo, MemoryInfo, RuntimeInfo, ThreadInfo};
use crate::remote::server;
use crate::snapshot::{self, Snapshot};
use callscope_common::AGENT_VERSION;
use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock, PoisonError};
use std::time::SystemTime;

/// Exit status of a process ended by a fatal profiler error
pub const FATAL_EXIT_CODE: i32 = 3;

/// What an `ApplyRules` request did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RulesOutcome {
    /// First rules of a `waitconn` agent: stored, nothing redefined
    Installed,
    Reloaded(ReloadSummary),
}

/// Released once the first rules arrive
#[derive(Debug, Default)]
struct RulesGate {
    received: Mutex<bool>,
    arrived: Condvar,
}

impl RulesGate {
    fn is_open(&self) -> bool {
        *self.received.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open(&self) {
        *self.received.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.arrived.notify_all();
    }

    fn wait(&self) {
        let mut received = self.received.lock().unwrap_or_else(PoisonError::into_inner);
        while !*received {
            received = self.arrived.wait(received).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Initialise `env_logger` at the level implied by `verbosity`.
///
/// `RUST_LOG` still wins. Does nothing if a logger is already installed.
pub fn init_logging(config: &AgentConfig) {
    let env = env_logger::Env::default().default_filter_or(config.log_level().to_string());
    if env_logger::Builder::from_env(env).try_init().is_err() {
        debug!("Logger already initialised");
    }
}

pub struct Agent {
    config: AgentConfig,
    profiler: Arc<ProfilerState>,
    controller: SessionController,
    probes: ProbeTable,
    first_rules: RulesGate,
    cpu_time_monitoring: AtomicBool,
    started_at: SystemTime,
    baseline_rss: Option<i64>,
    server_addr: OnceLock<SocketAddr>,
}

impl Agent {
    /// Create an agent without starting the command server.
    #[must_use]
    pub fn new(config: AgentConfig) -> Arc<Self> {
        Self::with_clock(config, Arc::new(MonotonicClock::new()))
    }

    #[must_use]
    pub fn with_clock(config: AgentConfig, clock: Arc<dyn Clock>) -> Arc<Self> {
        let profiler = Arc::new(ProfilerState::new(config.engine_limits(), clock));
        Arc::new(Self {
            controller: SessionController::new(Arc::clone(&profiler)),
            profiler,
            probes: ProbeTable::new(),
            first_rules: RulesGate::default(),
            cpu_time_monitoring: AtomicBool::new(true),
            started_at: SystemTime::now(),
            baseline_rss: introspect::resident_bytes(),
            server_addr: OnceLock::new(),
            config,
        })
    }

    /// Start profiling this process: logging, command server, and with
    /// `waitconn` the wait for the first rules.
    ///
    /// # Errors
    /// `AgentError::Bind` if the command port is unavailable.
    pub fn launch(config: AgentConfig) -> Result<Arc<Self>, AgentError> {
        init_logging(&config);
        info!("{AGENT_VERSION} starting (pid {})", std::process::id());

        let agent = Self::new(config);
        if !agent.config.enabled {
            info!("Command server disabled");
            return Ok(agent);
        }

        let port = agent.config.port;
        let addr = server::spawn(Arc::clone(&agent), port)
            .map_err(|source| AgentError::Bind { port, source })?;
        // Only launch sets the address, and it runs once per agent
        let _ = agent.server_addr.set(addr);

        if agent.config.wait_connection {
            info!("Waiting for a console to send rules on {addr}");
            agent.wait_for_rules();
            info!("Rules received, resuming startup");
        }
        Ok(agent)
    }

    /// [`Self::launch`] configured from `CALLSCOPE_AGENT`
    ///
    /// # Errors
    /// Invalid options or an unavailable port.
    pub fn launch_from_env() -> Result<Arc<Self>, AgentError> {
        Self::launch(AgentConfig::from_env()?)
    }

    #[must_use]
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    #[must_use]
    pub fn profiler(&self) -> &Arc<ProfilerState> {
        &self.profiler
    }

    #[must_use]
    pub fn controller(&self) -> &SessionController {
        &self.controller
    }

    #[must_use]
    pub fn probes(&self) -> &ProbeTable {
        &self.probes
    }

    /// Address of the command server, once launched
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server_addr.get().copied()
    }

    fn fatal(&self, err: &FatalError) {
        error!("{err}");
        if self.config.exit_on_failure {
            error!("Aborting process");
            std::process::exit(FATAL_EXIT_CODE);
        }
        self.profiler.set_enabled(false);
        warn!("Profiling disabled after fatal error");
    }

    fn fatal_reload(&self, err: &ReloadError) {
        error!("Class redefinition failed, instrumentation state is unknown: {err}");
        if self.config.exit_on_failure {
            error!("Aborting process");
            std::process::exit(FATAL_EXIT_CODE);
        }
        self.profiler.end_session();
        warn!("Continuing with possibly inconsistent instrumentation");
    }

    /// Load a class into the probe table, instrumented under the current rules.
    pub fn declare_class(&self, class: &str, methods: Vec<MethodDescriptor>) -> Vec<Arc<MethodProbe>> {
        let rules = self.controller.current_rules();
        match self.probes.declare_class(class, methods, &rules, self.profiler.as_ref()) {
            Ok(probes) => probes,
            Err(err) => {
                self.fatal(&err);
                self.probes.class_probes(class)
            }
        }
    }

    #[must_use]
    pub fn probe(&self, class: &str, method: &str) -> Option<Arc<MethodProbe>> {
        self.probes.probe(class, method)
    }

    /// Register a method for an external instrumentation layer.
    ///
    /// Returns [`MethodId::DETACHED`] if the session is full and the agent
    /// survives the failure.
    pub fn new_method(&self, qualified_name: &str) -> MethodId {
        self.profiler.new_method(qualified_name).unwrap_or_else(|err| {
            self.fatal(&err);
            MethodId::DETACHED
        })
    }

    /// Apply rules sent by a console.
    ///
    /// # Errors
    /// Invalid rules (nothing changed) or a failed reload.
    pub fn apply_rules(
        &self,
        options: &str,
        rules: &str,
        progress: &mut dyn ReloadProgress,
    ) -> Result<RulesOutcome, ReloadError> {
        if self.config.wait_connection && !self.first_rules.is_open() {
            self.controller.install(options, rules)?;
            self.first_rules.open();
            return Ok(RulesOutcome::Installed);
        }

        match self.controller.reload(&self.probes, options, rules, progress) {
            Ok(summary) => Ok(RulesOutcome::Reloaded(summary)),
            Err(err) => {
                if err.is_fatal() {
                    self.fatal_reload(&err);
                }
                Err(err)
            }
        }
    }

    /// Block until the first rules have been applied
    pub fn wait_for_rules(&self) {
        self.first_rules.wait();
    }

    #[must_use]
    pub fn rules_received(&self) -> bool {
        self.first_rules.is_open()
    }

    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        self.profiler.snapshot()
    }

    pub fn reset_stats(&self) {
        self.profiler.reset_stats();
    }

    /// Reclaim the call states of terminated threads
    pub fn collect_garbage(&self) -> usize {
        let purged = self.profiler.purge_dead_threads();
        debug!("Reclaimed {purged} terminated thread states");
        purged
    }

    #[must_use]
    pub fn list_classes(&self) -> Vec<ClassInfo> {
        self.probes
            .list_classes()
            .into_iter()
            .map(|(name, instrumented)| ClassInfo { name, instrumented })
            .collect()
    }

    #[must_use]
    pub fn runtime_info(&self) -> RuntimeInfo {
        introspect::runtime_info(self.started_at)
    }

    #[must_use]
    pub fn memory_info(&self) -> MemoryInfo {
        introspect::memory_info(self.baseline_rss)
    }

    #[must_use]
    pub fn thread_info(&self, ids: &[i64], max_depth: i32) -> Vec<ThreadInfo> {
        let cpu = self.cpu_time_monitoring.load(Ordering::Relaxed);
        introspect::thread_info(ids, max_depth, cpu, &self.profiler.thread_stacks())
    }

    /// Toggle thread monitoring; returns which of (contention, cpu time)
    /// are supported. Contention monitoring never is.
    pub fn set_thread_monitoring(&self, _contention: bool, cpu_time: bool) -> (bool, bool) {
        self.cpu_time_monitoring.store(cpu_time, Ordering::Relaxed);
        (false, true)
    }

    /// Final bookkeeping before the process exits.
    ///
    /// With `snapshotonexit` the current statistics are written to the
    /// working directory; the path is returned.
    pub fn shutdown(&self) -> Option<PathBuf> {
        self.profiler.set_enabled(false);
        if !self.config.snapshot_on_exit {
            return None;
        }
        let dir = match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                error!("Cannot save snapshot, no working directory: {e}");
                return None;
            }
        };
        match snapshot::file::save_in(&self.snapshot(), &dir) {
            Ok(path) => {
                info!("Snapshot saved to {}", path.display());
                Some(path)
            }
            Err(e) => {
                error!("Failed to save snapshot: {e}");
                None
            }
        }
    }
}

impl CallHooks for Agent {
    fn enter_method(&self, id: MethodId) {
        if let Err(err) = self.profiler.enter(id) {
            self.fatal(&err);
        }
    }

    fn exit_method(&self, id: MethodId) {
        self.profiler.exit(id);
    }
}
