use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use squall_core::prelude::{DelegatedShutdownListener, ShutdownHandle};
use squall_instruments::{builtin, MetricsRegistry, SummaryReporter, ThresholdEvaluator};
use squall_summary_model::{append_run_summary, export_run_summary, RunSummary};
use tokio::time::{Instant, MissedTickBehavior};

use crate::context::{RunnerContext, ScenarioInfo, UserValuesConstraint};
use crate::definition::ScenarioDefinitionBuilder;
use crate::executor::Executor;
use crate::monitor::start_monitor;
use crate::progress::start_progress;
use crate::run_state::RunState;
use crate::scheduler::run_scenario;
use crate::shutdown::start_shutdown_listener;
use crate::vu::{VuMetrics, VuSpec};

/// Exit code when the run completed but at least one threshold failed.
pub const EXIT_THRESHOLDS_FAILED: i32 = 99;
/// Exit code when the run could not start, or the scheduler failed part way through.
pub const EXIT_CONFIG_FAULT: i32 = 104;

/// How often `abortOnFail` thresholds are checked while the run is going.
const THRESHOLD_CHECKPOINT_INTERVAL: Duration = Duration::from_secs(2);

/// The result of a run that got as far as producing a summary.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
}

impl RunOutcome {
    pub fn passed(&self) -> bool {
        self.summary.thresholds_passed()
    }

    pub fn exit_code(&self) -> i32 {
        if self.passed() {
            0
        } else {
            EXIT_THRESHOLDS_FAILED
        }
    }
}

/// The process exit code for the result of [run].
pub fn exit_code(result: &anyhow::Result<RunOutcome>) -> i32 {
    match result {
        Ok(outcome) => outcome.exit_code(),
        Err(_) => EXIT_CONFIG_FAULT,
    }
}

pub fn run<RV: UserValuesConstraint, V: UserValuesConstraint>(
    definition: ScenarioDefinitionBuilder<RV, V>,
) -> anyhow::Result<RunOutcome> {
    let definition = definition.build()?;

    log::info!("Running test: {}", definition.name);

    let planned_runtime = definition.planned_duration();
    let scenario_descriptions = definition.scenario_descriptions();

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    let signals = start_shutdown_listener(&runtime);

    let registry = Arc::new(MetricsRegistry::new());
    builtin::register_builtin(&registry)?;
    for (name, kind) in &definition.declared_metrics {
        registry
            .register(name, *kind)
            .with_context(|| format!("Failed to declare metric {name}"))?;
    }
    definition.thresholds.validate(&registry)?;

    let run_id = definition
        .run_id
        .clone()
        .unwrap_or_else(|| nanoid::nanoid!());
    let run_state = Arc::new(RunState::new());
    let executor = Arc::new(Executor::new(
        runtime.handle().clone(),
        signals.interrupt.clone(),
    ));
    let mut runner_context = RunnerContext::new(
        executor,
        registry.clone(),
        definition.transport.clone(),
        signals.run_stop.clone(),
        run_state.clone(),
        run_id.clone(),
    );

    let started_at = chrono::Utc::now();
    if let Some(setup_fn) = &definition.setup_fn {
        setup_fn(&mut runner_context)?;
    }
    let runner_context = Arc::new(runner_context);

    // Raised once every scenario has stopped, to wind down the helper threads and tasks
    let finished = ShutdownHandle::new();

    if !definition.no_progress && !planned_runtime.is_zero() {
        if let Err(e) = start_progress(planned_runtime, finished.new_listener()) {
            log::warn!("Could not start the progress bar: {e:?}");
        }
    }

    // Ready to start spawning VUs so start the resource monitor to report high usage which might
    // lead to a misleading outcome.
    if let Err(e) = start_monitor(finished.new_listener()) {
        log::warn!("Could not start the resource monitor: {e:?}");
    }

    let thresholds = Arc::new(definition.thresholds);
    let aborted_by_threshold = Arc::new(AtomicBool::new(false));
    if !definition.no_thresholds && thresholds.has_abort_on_fail() {
        runtime.spawn(threshold_checkpoints(
            thresholds.clone(),
            registry.clone(),
            run_state.clone(),
            signals.run_stop.clone(),
            aborted_by_threshold.clone(),
            finished.new_listener(),
        ));
    }

    let run_start = Instant::now();
    let mut hard_stops = Vec::new();
    let mut scenario_tasks = Vec::new();
    for scenario in definition.scenarios {
        let iteration = *definition
            .iterations
            .get(&scenario.exec)
            .with_context(|| format!("No iteration named {}", scenario.exec))?;
        let hard_stop = ShutdownHandle::new();
        hard_stops.push(hard_stop.clone());

        let spec = Arc::new(VuSpec {
            runner_context: runner_context.clone(),
            scenario: Arc::new(ScenarioInfo {
                name: scenario.name.clone(),
                tags: scenario.tags.clone(),
            }),
            setup: definition.setup_vu_fn,
            iteration,
            teardown: definition.teardown_vu_fn,
            hard_stop,
            metrics: VuMetrics::new(&registry)?,
        });

        scenario_tasks.push(runtime.spawn(run_scenario(
            scenario,
            spec,
            signals.run_stop.new_listener(),
        )));
    }

    // A second Ctrl-C abandons whatever the VUs are doing
    runtime.spawn({
        let mut interrupt = signals.interrupt.new_listener();
        let mut finished = finished.new_listener();
        async move {
            tokio::select! {
                _ = interrupt.wait_for_shutdown() => {
                    for hard_stop in hard_stops {
                        hard_stop.shutdown();
                    }
                }
                _ = finished.wait_for_shutdown() => {}
            }
        }
    });

    let mut scheduler_fault = None;
    for result in runtime.block_on(futures::future::join_all(scenario_tasks)) {
        if let Err(e) = result {
            log::error!("Scenario scheduler failed: {e}");
            scheduler_fault.get_or_insert(e);
        }
    }
    let run_duration = run_start.elapsed();
    finished.shutdown();

    if let Some(teardown_fn) = definition.teardown_fn {
        // Don't crash the runner if the teardown fails. We still want the reporting and runner
        // shutdown to happen cleanly. The hook is documented as 'best effort'
        if let Err(e) = teardown_fn(runner_context.clone()) {
            log::error!("Teardown failed: {:?}", e);
        }
    }

    registry.freeze();

    let verdicts = if definition.no_thresholds {
        Vec::new()
    } else {
        thresholds.evaluate(&registry, run_duration)?
    };

    let reporter = SummaryReporter::new(definition.trend_stats);
    let mut summary = RunSummary::new(
        run_id,
        definition.name,
        scenario_descriptions,
        started_at.timestamp(),
        env!("CARGO_PKG_VERSION").to_string(),
    );
    summary.ended_at = chrono::Utc::now().timestamp();
    summary.run_duration_ms = run_duration.as_millis() as u64;
    summary.total_iterations = run_state.iterations_completed();
    summary.aborted_iterations = run_state.iterations_aborted();
    summary.dropped_iterations = run_state.dropped_iterations();
    summary.vus_spawned = run_state.vus_spawned();
    summary.vus_max = run_state.vus_max();
    summary.aborted_by_threshold = aborted_by_threshold.load(Ordering::Acquire);
    summary.metrics = reporter.summarise_metrics(&registry, run_duration)?;
    summary.thresholds = verdicts;
    capture_env(&mut summary, &definition.capture_env);
    summary.fingerprint = summary.compute_fingerprint(&definition.resolved_config);
    log::debug!("Run configuration fingerprint: {}", summary.fingerprint);

    reporter.print(&summary);

    if let Some(path) = definition.summary_export {
        write_summary(&summary, &path)
            .with_context(|| format!("Failed to write run summary to {path:?}"))?;
    }

    if let Some(e) = scheduler_fault {
        return Err(anyhow::anyhow!(e).context("A scenario scheduler failed"));
    }

    Ok(RunOutcome { summary })
}

/// Periodically evaluate thresholds and stop the run when an `abortOnFail` threshold fails.
async fn threshold_checkpoints(
    thresholds: Arc<ThresholdEvaluator>,
    registry: Arc<MetricsRegistry>,
    run_state: Arc<RunState>,
    run_stop: ShutdownHandle,
    aborted_by_threshold: Arc<AtomicBool>,
    mut finished: DelegatedShutdownListener,
) {
    let mut checkpoint = tokio::time::interval_at(
        Instant::now() + THRESHOLD_CHECKPOINT_INTERVAL,
        THRESHOLD_CHECKPOINT_INTERVAL,
    );
    checkpoint.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = checkpoint.tick() => {}
            _ = finished.wait_for_shutdown() => break,
        }

        let elapsed = run_state.elapsed();
        let verdicts = match thresholds.evaluate(&registry, elapsed) {
            Ok(verdicts) => verdicts,
            Err(e) => {
                log::warn!("Threshold checkpoint failed: {e}");
                continue;
            }
        };

        if let Some(verdict) = thresholds.should_abort(&verdicts, elapsed) {
            log::error!(
                "Threshold {}: {} failed with {:.2}, stopping the run",
                verdict.metric,
                verdict.expression,
                verdict.observed
            );
            aborted_by_threshold.store(true, Ordering::Release);
            run_stop.shutdown();
            break;
        }
    }
}

fn capture_env(summary: &mut RunSummary, keys: &HashSet<String>) {
    for key in keys {
        if let Ok(value) = std::env::var(key) {
            summary.add_env(key.clone(), value);
        }
    }
}

fn write_summary(summary: &RunSummary, path: &Path) -> anyhow::Result<()> {
    if path.extension().is_some_and(|ext| ext == "jsonl") {
        append_run_summary(summary, path.to_path_buf())
    } else {
        export_run_summary(summary, path.to_path_buf())
    }
}
