use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

/// Where a scenario is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ScenarioPhase {
    #[display("pending")]
    Pending,
    #[display("ramping-up")]
    RampingUp,
    #[display("steady")]
    Steady,
    #[display("ramping-down")]
    RampingDown,
    #[display("draining")]
    Draining,
    #[display("stopped")]
    Stopped,
}

/// Process wide counters for a run, shared between the scheduler, the VUs and the reporter.
#[derive(Debug)]
pub struct RunState {
    started: Instant,
    next_vu_id: AtomicU64,
    active_vus: AtomicU64,
    vus_spawned: AtomicU64,
    vus_max: AtomicU64,
    iterations_completed: AtomicU64,
    iterations_aborted: AtomicU64,
    dropped_iterations: AtomicU64,
    phases: Mutex<BTreeMap<String, ScenarioPhase>>,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            next_vu_id: AtomicU64::new(1),
            active_vus: AtomicU64::new(0),
            vus_spawned: AtomicU64::new(0),
            vus_max: AtomicU64::new(0),
            iterations_completed: AtomicU64::new(0),
            iterations_aborted: AtomicU64::new(0),
            dropped_iterations: AtomicU64::new(0),
            phases: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Allocate a VU id. Ids start at 1 and are never reused within a run.
    pub(crate) fn next_vu_id(&self) -> u64 {
        self.next_vu_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Returns the number of active VUs after the new one was counted.
    pub(crate) fn vu_started(&self) -> u64 {
        self.vus_spawned.fetch_add(1, Ordering::Relaxed);
        let active = self.active_vus.fetch_add(1, Ordering::AcqRel) + 1;
        self.vus_max.fetch_max(active, Ordering::AcqRel);
        active
    }

    /// Returns the number of active VUs left.
    pub(crate) fn vu_stopped(&self) -> u64 {
        self.active_vus.fetch_sub(1, Ordering::AcqRel) - 1
    }

    pub(crate) fn iteration_completed(&self) {
        self.iterations_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iteration_aborted(&self) {
        self.iterations_aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iterations_dropped(&self, count: u64) {
        self.dropped_iterations.fetch_add(count, Ordering::Relaxed);
    }

    pub(crate) fn set_phase(&self, scenario: &str, phase: ScenarioPhase) {
        let previous = self.phases.lock().insert(scenario.to_string(), phase);
        if previous != Some(phase) {
            log::info!("Scenario {scenario} is {phase}");
        }
    }

    pub fn phase(&self, scenario: &str) -> Option<ScenarioPhase> {
        self.phases.lock().get(scenario).copied()
    }

    pub fn active_vus(&self) -> u64 {
        self.active_vus.load(Ordering::Acquire)
    }

    pub fn vus_spawned(&self) -> u64 {
        self.vus_spawned.load(Ordering::Relaxed)
    }

    pub fn vus_max(&self) -> u64 {
        self.vus_max.load(Ordering::Acquire)
    }

    pub fn iterations_completed(&self) -> u64 {
        self.iterations_completed.load(Ordering::Relaxed)
    }

    pub fn iterations_aborted(&self) -> u64 {
        self.iterations_aborted.load(Ordering::Relaxed)
    }

    pub fn dropped_iterations(&self) -> u64 {
        self.dropped_iterations.load(Ordering::Relaxed)
    }
}
