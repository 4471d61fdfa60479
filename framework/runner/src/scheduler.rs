mod arrival_rate;
mod constant_vus;
mod per_vu_iterations;
mod pool;
mod ramping_vus;

use std::sync::Arc;

use squall_core::prelude::DelegatedShutdownListener;
use tokio::time::Instant;

pub(crate) use arrival_rate::TicketGate;

use crate::config::{ExecutorConfig, Scenario};
use crate::context::UserValuesConstraint;
use crate::run_state::ScenarioPhase;
use crate::scheduler::pool::VuPool;
use crate::vu::VuSpec;

/// Drive one scenario from its start time to the moment its last VU has stopped.
///
/// `run_stop` is the global stop. Raising it sends every scenario straight to draining.
pub(crate) async fn run_scenario<RV: UserValuesConstraint, V: UserValuesConstraint>(
    scenario: Scenario,
    spec: Arc<VuSpec<RV, V>>,
    mut run_stop: DelegatedShutdownListener,
) {
    let mut pool = VuPool::new(spec);
    pool.set_phase(ScenarioPhase::Pending);

    if !scenario.start_time.is_zero() {
        tokio::select! {
            _ = tokio::time::sleep(scenario.start_time) => {}
            _ = run_stop.wait_for_shutdown() => {
                log::info!("Scenario {} stopped before it started", scenario.name);
                pool.set_phase(ScenarioPhase::Stopped);
                return;
            }
        }
    }

    log::info!(
        "Starting scenario {}, {}",
        scenario.name,
        scenario.executor.describe()
    );
    let start = Instant::now();
    let mut gate = None;
    match &scenario.executor {
        ExecutorConfig::ConstantVus(config) => {
            constant_vus::run(&mut pool, config, start, &mut run_stop).await
        }
        ExecutorConfig::RampingVus(config) => {
            ramping_vus::run(&mut pool, config, start, &mut run_stop).await
        }
        ExecutorConfig::RampingArrivalRate(config) => {
            let tickets = Arc::new(TicketGate::new());
            arrival_rate::run(&mut pool, config, start, &mut run_stop, &tickets).await;
            gate = Some(tickets);
        }
        ExecutorConfig::PerVuIterations(config) => {
            per_vu_iterations::run(&mut pool, config, start, &mut run_stop).await
        }
    }

    pool.set_phase(ScenarioPhase::Draining);
    pool.drain(scenario.graceful_stop).await;

    if let Some(gate) = gate {
        let leftover = gate.leftover();
        if leftover > 0 {
            log::debug!(
                "Scenario {}: {leftover} queued iterations were never run",
                scenario.name
            );
            pool.record_dropped(leftover);
        }
    }

    pool.set_phase(ScenarioPhase::Stopped);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ScenarioConfig;
    use crate::context::VuContext;
    use crate::definition::IterationFn;
    use crate::run_state::RunState;
    use crate::stage::Stage;
    use crate::test_support::{scenario_spec, NoValues};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use squall_core::prelude::{IterationResult, ShutdownHandle};
    use std::time::Duration;

    fn sleep_for(ctx: &mut VuContext<NoValues, NoValues>, ms: u64) -> BoxFuture<'_, IterationResult> {
        async move {
            ctx.sleep(Duration::from_millis(ms)).await;
            Ok(())
        }
        .boxed()
    }

    fn sleep_100ms(ctx: &mut VuContext<NoValues, NoValues>) -> BoxFuture<'_, IterationResult> {
        sleep_for(ctx, 100)
    }

    fn sleep_130ms(ctx: &mut VuContext<NoValues, NoValues>) -> BoxFuture<'_, IterationResult> {
        sleep_for(ctx, 130)
    }

    fn sleep_950ms(ctx: &mut VuContext<NoValues, NoValues>) -> BoxFuture<'_, IterationResult> {
        sleep_for(ctx, 950)
    }

    fn sleep_1s(ctx: &mut VuContext<NoValues, NoValues>) -> BoxFuture<'_, IterationResult> {
        sleep_for(ctx, 1000)
    }

    fn sleep_4s(ctx: &mut VuContext<NoValues, NoValues>) -> BoxFuture<'_, IterationResult> {
        sleep_for(ctx, 4000)
    }

    async fn run(
        config: ScenarioConfig,
        iteration: IterationFn<NoValues, NoValues>,
        run_stop: &ShutdownHandle,
    ) -> Arc<RunState> {
        let scenario = config.validate("test").unwrap();
        let spec = scenario_spec(&scenario, iteration);
        let run_state = spec.runner_context.run_state().clone();
        run_scenario(scenario, spec, run_stop.new_listener()).await;
        run_state
    }

    #[tokio::test(start_paused = true)]
    async fn constant_vus_stop_within_graceful_stop() {
        let start = Instant::now();
        let config = ScenarioConfig::constant_vus(3, Duration::from_secs(5))
            .with_graceful_stop(Duration::from_secs(2));

        let run_state = run(config, sleep_4s, &ShutdownHandle::new()).await;

        // Iterations run 0-4s and 4-8s. The second is still in flight at the 7s hard stop.
        assert!(start.elapsed() <= Duration::from_secs(7));
        assert_eq!(3, run_state.iterations_completed());
        assert_eq!(3, run_state.iterations_aborted());
        assert_eq!(0, run_state.active_vus());
        assert_eq!(3, run_state.vus_max());
        assert_eq!(Some(ScenarioPhase::Stopped), run_state.phase("test"));
    }

    #[tokio::test(start_paused = true)]
    async fn constant_vus_finish_iterations_inside_graceful_stop() {
        let config = ScenarioConfig::constant_vus(2, Duration::from_millis(1050))
            .with_graceful_stop(Duration::from_secs(2));

        let run_state = run(config, sleep_1s, &ShutdownHandle::new()).await;

        assert_eq!(4, run_state.iterations_completed());
        assert_eq!(0, run_state.iterations_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn global_stop_drains_early() {
        let start = Instant::now();
        let run_stop = ShutdownHandle::new();
        let stopper = {
            let run_stop = run_stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(2500)).await;
                run_stop.shutdown();
            })
        };

        let config = ScenarioConfig::constant_vus(1, Duration::from_secs(100));
        let run_state = run(config, sleep_1s, &run_stop).await;
        stopper.await.unwrap();

        assert_eq!(3, run_state.iterations_completed());
        assert!(start.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn ramping_vus_track_stages() {
        let stages = vec![
            Stage::new(Duration::from_secs(10), 10.0),
            Stage::new(Duration::from_secs(10), 0.0),
        ];
        let config = ScenarioConfig::ramping_vus(0, stages.clone());
        let scenario = config.validate("ramp").unwrap();
        let profile = crate::stage::Stages::new(0.0, stages);
        let spec = scenario_spec(&scenario, sleep_100ms);
        let run_state = spec.runner_context.run_state().clone();

        let run_stop = ShutdownHandle::new();
        let start = Instant::now();
        let scheduler = tokio::spawn(run_scenario(scenario, spec, run_stop.new_listener()));

        for second in 0..20 {
            let at = Duration::from_millis(second * 1000 + 500);
            tokio::time::sleep_until(start + at).await;
            let expected = profile.value_at(at);
            let active = run_state.active_vus() as f64;
            assert!(
                (active - expected).abs() <= 1.0,
                "at {at:?} expected {expected} VUs, found {active}"
            );
        }

        scheduler.await.unwrap();
        assert_eq!(10, run_state.vus_max());
        assert_eq!(0, run_state.active_vus());
        assert_eq!(0, run_state.iterations_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_rate_drops_when_pool_is_exhausted() {
        let config = ScenarioConfig::ramping_arrival_rate(
            10.0,
            Duration::from_secs(1),
            vec![Stage::new(Duration::from_secs(2), 10.0)],
            1,
            2,
        );

        let run_state = run(config, sleep_950ms, &ShutdownHandle::new()).await;

        // Tickets every 100ms, two VUs that each need 950ms per iteration
        assert_eq!(2, run_state.vus_spawned());
        assert_eq!(4, run_state.iterations_completed());
        assert_eq!(16, run_state.dropped_iterations());
    }

    #[tokio::test(start_paused = true)]
    async fn arrival_rate_queue_absorbs_bursts() {
        let config = ScenarioConfig::ramping_arrival_rate(
            10.0,
            Duration::from_secs(1),
            vec![Stage::new(Duration::from_millis(500), 10.0)],
            1,
            1,
        )
        .with_overflow(crate::config::OverflowPolicy::Queue { capacity: 10 });

        let run_state = run(config, sleep_130ms, &ShutdownHandle::new()).await;

        // One VU serves the queue back to back. The last ticket is still queued when the
        // scenario drains.
        assert_eq!(1, run_state.vus_spawned());
        assert_eq!(4, run_state.iterations_completed());
        assert_eq!(1, run_state.dropped_iterations());
    }

    #[tokio::test(start_paused = true)]
    async fn per_vu_iterations_run_exactly() {
        let config = ScenarioConfig::per_vu_iterations(3, 4);

        let run_state = run(config, sleep_100ms, &ShutdownHandle::new()).await;

        assert_eq!(3, run_state.vus_spawned());
        assert_eq!(12, run_state.iterations_completed());
        assert_eq!(0, run_state.iterations_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn per_vu_iterations_max_duration() {
        let config = ScenarioConfig::per_vu_iterations(1, 100)
            .with_max_duration(Duration::from_millis(3500))
            .with_graceful_stop(Duration::ZERO);

        let run_state = run(config, sleep_1s, &ShutdownHandle::new()).await;

        assert_eq!(3, run_state.iterations_completed());
        assert_eq!(1, run_state.iterations_aborted());
    }

    #[tokio::test(start_paused = true)]
    async fn start_time_delays_scenario() {
        let start = Instant::now();
        let config =
            ScenarioConfig::per_vu_iterations(1, 1).with_start_time(Duration::from_secs(3));

        let run_state = run(config, sleep_100ms, &ShutdownHandle::new()).await;

        assert_eq!(1, run_state.iterations_completed());
        assert!(start.elapsed() >= Duration::from_millis(3100));
    }
}
