use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use squall_core::prelude::ShutdownHandle;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;

use crate::context::UserValuesConstraint;
use crate::run_state::ScenarioPhase;
use crate::vu::{run_vu, Dispatch, VuSpec};

struct VuHandle {
    id: u64,
    stop: ShutdownHandle,
    busy: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// The VUs of one scenario. Only the scheduler task for that scenario touches it.
///
/// VUs that have been asked to stop move to `draining` and no longer count toward the population.
pub(crate) struct VuPool<RV: UserValuesConstraint, V: UserValuesConstraint> {
    spec: Arc<VuSpec<RV, V>>,
    running: Vec<VuHandle>,
    draining: Vec<VuHandle>,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> VuPool<RV, V> {
    pub(crate) fn new(spec: Arc<VuSpec<RV, V>>) -> Self {
        Self {
            spec,
            running: Vec::new(),
            draining: Vec::new(),
        }
    }

    pub(crate) fn scenario(&self) -> &str {
        &self.spec.scenario.name
    }

    pub(crate) fn set_phase(&self, phase: ScenarioPhase) {
        self.spec
            .runner_context
            .run_state()
            .set_phase(self.scenario(), phase);
    }

    /// Count tickets that no VU will ever serve.
    pub(crate) fn record_dropped(&self, count: u64) {
        self.spec
            .metrics
            .record_dropped(count, &self.spec.scenario_tags());
        self.spec
            .runner_context
            .run_state()
            .iterations_dropped(count);
    }

    pub(crate) fn len(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn spawn(&mut self, dispatch: Dispatch) {
        let id = self.spec.runner_context.run_state().next_vu_id();
        let stop = ShutdownHandle::new();
        let busy = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(run_vu(
            self.spec.clone(),
            id,
            dispatch,
            stop.new_listener(),
            busy.clone(),
        ));

        self.running.push(VuHandle {
            id,
            stop,
            busy,
            join,
        });
    }

    /// Spawn or stop continuously looping VUs until `target` are running.
    pub(crate) fn scale_to(&mut self, target: usize) {
        if target != self.running.len() {
            log::debug!(
                "Scenario {} scaling from {} to {target} VUs",
                self.scenario(),
                self.running.len()
            );
        }

        while self.running.len() < target {
            self.spawn(Dispatch::Continuous);
        }
        while self.running.len() > target {
            self.stop_one();
        }
    }

    /// Stop the most recently spawned idle VU, or if every VU is busy, the most recently spawned
    /// one. Either way the VU stops at its next iteration boundary.
    ///
    /// A busy VU is never interrupted: it finishes the iteration it is running, so a ramp-down
    /// can briefly leave more VUs active than the target. Only the scenario's graceful stop
    /// deadline cuts an iteration short.
    fn stop_one(&mut self) {
        let index = self
            .running
            .iter()
            .rposition(|h| !h.busy.load(Ordering::Acquire))
            .or_else(|| self.running.len().checked_sub(1));

        if let Some(index) = index {
            let handle = self.running.remove(index);
            log::trace!("Stopping VU {}", handle.id);
            handle.stop.shutdown();
            self.draining.push(handle);
        }
    }

    fn stop_all(&mut self) {
        for handle in self.running.drain(..) {
            handle.stop.shutdown();
            self.draining.push(handle);
        }
    }

    /// Forget VUs that have already exited.
    pub(crate) fn reap(&mut self) {
        let finished = |handle: &mut VuHandle| match (&mut handle.join).now_or_never() {
            Some(result) => {
                log_join(handle.id, result);
                false
            }
            None => true,
        };
        self.running.retain_mut(finished);
        self.draining.retain_mut(finished);
    }

    /// Wait for every running VU to exit by itself.
    pub(crate) async fn join_running(&mut self) {
        while let Some(handle) = self.running.last_mut() {
            let result = (&mut handle.join).await;
            let id = handle.id;
            self.running.pop();
            log_join(id, result);
        }
    }

    /// Ask every VU to stop and wait up to `graceful_stop` for them to finish their iteration.
    /// Whatever is still running after that is hard stopped.
    pub(crate) async fn drain(&mut self, graceful_stop: Duration) {
        self.stop_all();
        let deadline = Instant::now() + graceful_stop;

        let mut late = Vec::new();
        for mut handle in self.draining.drain(..) {
            match tokio::time::timeout_at(deadline, &mut handle.join).await {
                Ok(result) => log_join(handle.id, result),
                Err(_) => late.push(handle),
            }
        }

        if !late.is_empty() {
            log::warn!(
                "Scenario {}: {} VUs still running after graceful stop of {graceful_stop:?}, aborting their iterations",
                self.spec.scenario.name,
                late.len()
            );
            self.spec.hard_stop.shutdown();
            for handle in late {
                log_join(handle.id, handle.join.await);
            }
        }
    }
}

fn log_join(id: u64, result: Result<(), JoinError>) {
    if let Err(e) = result {
        log::error!("VU {id} task failed: {e}");
    }
}
