use squall_core::prelude::DelegatedShutdownListener;
use tokio::time::Instant;

use crate::config::PerVuIterations;
use crate::context::UserValuesConstraint;
use crate::run_state::ScenarioPhase;
use crate::scheduler::pool::VuPool;
use crate::vu::Dispatch;

/// Every VU runs its share of iterations once. Ends when all of them are done or `maxDuration`
/// is reached.
pub(crate) async fn run<RV: UserValuesConstraint, V: UserValuesConstraint>(
    pool: &mut VuPool<RV, V>,
    config: &PerVuIterations,
    start: Instant,
    run_stop: &mut DelegatedShutdownListener,
) {
    pool.set_phase(ScenarioPhase::RampingUp);
    for _ in 0..config.vus {
        pool.spawn(Dispatch::Fixed(config.iterations));
    }
    pool.set_phase(ScenarioPhase::Steady);

    let scenario = pool.scenario().to_string();
    tokio::select! {
        _ = pool.join_running() => {
            log::debug!("Scenario {scenario}: every VU finished its iterations");
        }
        _ = tokio::time::sleep_until(start + config.max_duration) => {
            log::warn!(
                "Scenario {scenario} reached maxDuration of {:?} before all iterations finished",
                config.max_duration
            );
        }
        _ = run_stop.wait_for_shutdown() => {
            log::info!("Scenario {scenario} stopped early");
        }
    }
}
