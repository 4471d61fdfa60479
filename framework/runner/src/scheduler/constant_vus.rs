use squall_core::prelude::DelegatedShutdownListener;
use tokio::time::Instant;

use crate::config::ConstantVus;
use crate::context::UserValuesConstraint;
use crate::run_state::ScenarioPhase;
use crate::scheduler::pool::VuPool;
use crate::vu::Dispatch;

/// A fixed number of VUs, each looping back to back, until the duration is up.
pub(crate) async fn run<RV: UserValuesConstraint, V: UserValuesConstraint>(
    pool: &mut VuPool<RV, V>,
    config: &ConstantVus,
    start: Instant,
    run_stop: &mut DelegatedShutdownListener,
) {
    pool.set_phase(ScenarioPhase::RampingUp);
    for _ in 0..config.vus {
        pool.spawn(Dispatch::Continuous);
    }
    pool.set_phase(ScenarioPhase::Steady);

    tokio::select! {
        _ = tokio::time::sleep_until(start + config.duration) => {}
        _ = run_stop.wait_for_shutdown() => {
            log::info!("Scenario {} stopped early", pool.scenario());
        }
    }
}
