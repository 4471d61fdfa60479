use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use squall_core::prelude::{DelegatedShutdownListener, IterationOutcome, ShutdownHandle};
use squall_instruments::{builtin, Counter, Gauge, MetricsError, MetricsRegistry, Rate, Tags, Trend};
use tokio::time::Instant;

use crate::context::{
    log_metric_error, RequestMetrics, RunnerContext, ScenarioInfo, UserValuesConstraint, VuContext,
};
use crate::definition::{IterationFn, VuHook};
use crate::scheduler::TicketGate;

/// How a VU decides whether to start another iteration.
pub(crate) enum Dispatch {
    /// Back to back until stopped
    Continuous,
    /// A fixed number of iterations, then stop
    Fixed(u64),
    /// One iteration per ticket from the gate. A VU spawned to serve a ticket starts `prepaid`.
    Tickets { gate: Arc<TicketGate>, prepaid: bool },
}

impl Dispatch {
    async fn next(&mut self, started: u64, stop: &mut DelegatedShutdownListener) -> bool {
        match self {
            Dispatch::Continuous => true,
            Dispatch::Fixed(iterations) => started < *iterations,
            Dispatch::Tickets { gate, prepaid } => {
                if *prepaid {
                    *prepaid = false;
                    true
                } else {
                    gate.take(stop).await
                }
            }
        }
    }
}

/// Handles for the metrics the runtime records about VUs and iterations.
#[derive(Debug, Clone)]
pub(crate) struct VuMetrics {
    pub(crate) request: RequestMetrics,
    iterations: Counter,
    iteration_duration: Trend,
    iterations_failed: Rate,
    iterations_aborted: Counter,
    dropped_iterations: Counter,
    vus: Gauge,
    vus_max: Gauge,
}

impl VuMetrics {
    pub(crate) fn new(registry: &MetricsRegistry) -> Result<Self, MetricsError> {
        Ok(Self {
            request: RequestMetrics::new(registry)?,
            iterations: registry.counter(builtin::ITERATIONS)?,
            iteration_duration: registry.trend(builtin::ITERATION_DURATION)?,
            iterations_failed: registry.rate(builtin::ITERATIONS_FAILED)?,
            iterations_aborted: registry.counter(builtin::ITERATIONS_ABORTED)?,
            dropped_iterations: registry.counter(builtin::DROPPED_ITERATIONS)?,
            vus: registry.gauge(builtin::VUS)?,
            vus_max: registry.gauge(builtin::VUS_MAX)?,
        })
    }

    pub(crate) fn record_dropped(&self, count: u64, tags: &Tags) {
        log_metric_error(self.dropped_iterations.add(count as f64, tags));
    }

    fn record_population(&self, active: u64, max: u64) {
        log_metric_error(self.vus.set(active as f64, &Tags::new()));
        log_metric_error(self.vus_max.set(max as f64, &Tags::new()));
    }
}

/// Everything the VUs of one scenario share.
pub(crate) struct VuSpec<RV: UserValuesConstraint, V: UserValuesConstraint> {
    pub(crate) runner_context: Arc<RunnerContext<RV>>,
    pub(crate) scenario: Arc<ScenarioInfo>,
    pub(crate) setup: Option<VuHook<RV, V>>,
    pub(crate) iteration: IterationFn<RV, V>,
    pub(crate) teardown: Option<VuHook<RV, V>>,
    /// Raised when the scenario's graceful stop period runs out
    pub(crate) hard_stop: ShutdownHandle,
    pub(crate) metrics: VuMetrics,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> VuSpec<RV, V> {
    pub(crate) fn scenario_tags(&self) -> Tags {
        let mut tags = self.scenario.tags.clone();
        tags.insert("scenario".to_string(), self.scenario.name.clone());
        tags
    }
}

/// The life of one VU: setup, iterations until `stop` is raised or dispatch runs dry, teardown.
///
/// `stop` is only checked between iterations. The scenario's hard stop is raced against whatever
/// the VU is doing, and an iteration interrupted by it is recorded as aborted.
pub(crate) async fn run_vu<RV: UserValuesConstraint, V: UserValuesConstraint>(
    spec: Arc<VuSpec<RV, V>>,
    vu_id: u64,
    mut dispatch: Dispatch,
    mut stop: DelegatedShutdownListener,
    busy: Arc<AtomicBool>,
) {
    let run_state = spec.runner_context.run_state().clone();
    let active = run_state.vu_started();
    spec.metrics.record_population(active, run_state.vus_max());
    log::debug!("VU {vu_id} started in scenario {}", spec.scenario.name);

    let mut ctx = VuContext::<RV, V>::new(
        vu_id,
        spec.scenario.clone(),
        spec.runner_context.clone(),
        stop.clone(),
        spec.metrics.request.clone(),
    );
    let mut hard_stop = spec.hard_stop.new_listener();
    let mut hard_stopped = false;

    let setup_ok = match spec.setup {
        Some(setup) => tokio::select! {
            biased;
            result = setup(&mut ctx) => match result {
                Ok(()) => true,
                Err(e) => {
                    log::error!("VU {vu_id} setup failed, it will not run any iterations: {e:?}");
                    false
                }
            },
            _ = hard_stop.wait_for_shutdown() => {
                hard_stopped = true;
                false
            }
        },
        None => true,
    };

    let mut started = 0;
    while setup_ok {
        if stop.should_shutdown() || hard_stop.should_shutdown() {
            break;
        }
        if !dispatch.next(started, &mut stop).await {
            break;
        }

        busy.store(true, Ordering::Release);
        ctx.start_iteration(started);
        started += 1;

        let iteration_start = Instant::now();
        let outcome = tokio::select! {
            biased;
            result = (spec.iteration)(&mut ctx) => IterationOutcome::from(result),
            _ = hard_stop.wait_for_shutdown() => {
                hard_stopped = true;
                IterationOutcome::Aborted
            }
        };
        let elapsed = iteration_start.elapsed();
        busy.store(false, Ordering::Release);

        let tags = ctx.tags();
        match &outcome {
            IterationOutcome::Aborted => {
                log::debug!("VU {vu_id} iteration {started} aborted");
                log_metric_error(spec.metrics.iterations_aborted.incr(&tags));
                run_state.iteration_aborted();
            }
            outcome => {
                if let IterationOutcome::FailedAssertion(msg) | IterationOutcome::TransportError(msg) =
                    outcome
                {
                    log::debug!("VU {vu_id} iteration {started} failed: {msg}");
                }
                log_metric_error(spec.metrics.iterations.incr(&tags));
                log_metric_error(spec.metrics.iteration_duration.add_duration(elapsed, &tags));
                log_metric_error(spec.metrics.iterations_failed.add(outcome.is_failed(), &tags));
                run_state.iteration_completed();
            }
        }

        if hard_stopped {
            break;
        }
    }

    if let Dispatch::Tickets { prepaid: true, .. } = dispatch {
        spec.metrics.record_dropped(1, &spec.scenario_tags());
        run_state.iterations_dropped(1);
    }

    if setup_ok && !hard_stopped {
        if let Some(teardown) = spec.teardown {
            tokio::select! {
                biased;
                result = teardown(&mut ctx) => {
                    if let Err(e) = result {
                        log::error!("VU {vu_id} teardown failed: {e:?}");
                    }
                },
                _ = hard_stop.wait_for_shutdown() => {
                    log::warn!("VU {vu_id} teardown interrupted by hard stop");
                }
            }
        }
    }

    let active = run_state.vu_stopped();
    spec.metrics.record_population(active, run_state.vus_max());
    log::debug!("VU {vu_id} stopped after {started} iterations");
}
