use std::cmp::Ordering;

use squall_core::prelude::DelegatedShutdownListener;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::RampingVus;
use crate::context::UserValuesConstraint;
use crate::run_state::ScenarioPhase;
use crate::scheduler::pool::VuPool;

/// Sample the stage profile every control interval and converge the population to it.
pub(crate) async fn run<RV: UserValuesConstraint, V: UserValuesConstraint>(
    pool: &mut VuPool<RV, V>,
    config: &RampingVus,
    start: Instant,
    run_stop: &mut DelegatedShutdownListener,
) {
    let end = start + config.stages.total_duration();
    let mut control = tokio::time::interval_at(start, config.control_interval);
    control.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = run_stop.wait_for_shutdown() => {
                log::info!("Scenario {} stopped early", pool.scenario());
                break;
            }
            _ = tokio::time::sleep_until(end) => break,
            _ = control.tick() => {}
        }

        let elapsed = Instant::now().saturating_duration_since(start);
        pool.reap();
        pool.scale_to(config.stages.value_at(elapsed).round() as usize);
        pool.set_phase(phase_for(config.stages.direction_at(elapsed)));
    }
}

pub(super) fn phase_for(direction: Ordering) -> ScenarioPhase {
    match direction {
        Ordering::Greater => ScenarioPhase::RampingUp,
        Ordering::Equal => ScenarioPhase::Steady,
        Ordering::Less => ScenarioPhase::RampingDown,
    }
}
