use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use squall_core::prelude::DelegatedShutdownListener;
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::{OverflowPolicy, RampingArrivalRate};
use crate::context::UserValuesConstraint;
use crate::scheduler::pool::VuPool;
use crate::scheduler::ramping_vus::phase_for;
use crate::vu::Dispatch;

#[derive(Debug, Default)]
struct GateState {
    /// VUs waiting for a ticket that has not been assigned to them yet
    idle: usize,
    /// Queued tickets, only used with [OverflowPolicy::Queue]
    pending: usize,
}

/// Hands arrival-rate tickets to the VUs of a pool.
///
/// A ticket is only handed out when a VU is known to be waiting for it, so the dispatcher can tell
/// straight away whether it has to grow the pool or drop the ticket.
#[derive(Debug)]
pub(crate) struct TicketGate {
    state: Mutex<GateState>,
    tickets: Semaphore,
}

impl Default for TicketGate {
    fn default() -> Self {
        Self::new()
    }
}

impl TicketGate {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            tickets: Semaphore::new(0),
        }
    }

    /// Wait for a ticket. Returns false if `stop` was raised first.
    pub(crate) async fn take(&self, stop: &mut DelegatedShutdownListener) -> bool {
        {
            let mut state = self.state.lock();
            if state.pending > 0 {
                state.pending -= 1;
                return true;
            }
            state.idle += 1;
        }

        tokio::select! {
            biased;
            _ = stop.wait_for_shutdown() => {
                let mut state = self.state.lock();
                // If a ticket was already assigned to this VU it stays in the semaphore and is
                // counted by `leftover`.
                state.idle = state.idle.saturating_sub(1);
                false
            }
            permit = self.tickets.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    true
                }
                Err(_) => false,
            }
        }
    }

    /// Give a ticket to a waiting VU, if there is one.
    pub(crate) fn try_assign(&self) -> bool {
        let mut state = self.state.lock();
        if state.idle == 0 {
            return false;
        }
        state.idle -= 1;
        self.tickets.add_permits(1);
        true
    }

    /// Queue a ticket for the next VU to become free. Returns false if the queue is full.
    pub(crate) fn enqueue(&self, capacity: usize) -> bool {
        let mut state = self.state.lock();
        if state.pending >= capacity {
            return false;
        }
        state.pending += 1;
        true
    }

    /// Tickets that were emitted but never taken by a VU.
    pub(crate) fn leftover(&self) -> u64 {
        let state = self.state.lock();
        (state.pending + self.tickets.available_permits()) as u64
    }
}

/// Emit tickets so that the number emitted by `t` is the whole part of the integral of the rate,
/// and find a VU for each one.
pub(crate) async fn run<RV: UserValuesConstraint, V: UserValuesConstraint>(
    pool: &mut VuPool<RV, V>,
    config: &RampingArrivalRate,
    start: Instant,
    run_stop: &mut DelegatedShutdownListener,
    gate: &Arc<TicketGate>,
) {
    pool.set_phase(phase_for(config.stages.direction_at(Duration::ZERO)));
    for _ in 0..config.pre_allocated_vus {
        pool.spawn(Dispatch::Tickets {
            gate: gate.clone(),
            prepaid: false,
        });
    }

    let unit = config.time_unit.as_secs_f64();
    let end = start + config.stages.total_duration();
    let mut emitted: u64 = 0;

    loop {
        let next_at = config
            .stages
            .elapsed_for_cumulative((emitted + 1) as f64 * unit)
            .map(|offset| start + offset)
            .filter(|at| *at <= end);

        let Some(next_at) = next_at else {
            // No more tickets, hold until the stages are over
            tokio::select! {
                _ = tokio::time::sleep_until(end) => {}
                _ = run_stop.wait_for_shutdown() => {}
            }
            break;
        };

        tokio::select! {
            biased;
            _ = run_stop.wait_for_shutdown() => {
                log::info!("Scenario {} stopped early", pool.scenario());
                break;
            }
            _ = tokio::time::sleep_until(next_at) => {}
        }

        let elapsed = Instant::now().saturating_duration_since(start);
        let due = ((config.stages.cumulative_at(elapsed) / unit).floor() as u64).max(emitted + 1);
        for _ in emitted..due {
            dispatch_ticket(pool, config, gate);
        }
        emitted = due;

        pool.set_phase(phase_for(config.stages.direction_at(elapsed)));
    }

    log::debug!("Scenario {} emitted {emitted} tickets", pool.scenario());
}

fn dispatch_ticket<RV: UserValuesConstraint, V: UserValuesConstraint>(
    pool: &mut VuPool<RV, V>,
    config: &RampingArrivalRate,
    gate: &Arc<TicketGate>,
) {
    if gate.try_assign() {
        return;
    }

    // VUs whose setup failed have exited and no longer hold a slot
    pool.reap();
    if pool.len() < config.max_vus {
        log::debug!(
            "Scenario {} growing pool to {} VUs",
            pool.scenario(),
            pool.len() + 1
        );
        pool.spawn(Dispatch::Tickets {
            gate: gate.clone(),
            prepaid: true,
        });
        return;
    }

    let queued = match config.overflow {
        OverflowPolicy::Drop => false,
        OverflowPolicy::Queue { capacity } => gate.enqueue(capacity),
    };
    if !queued {
        log::debug!(
            "Scenario {} dropped an iteration, all {} VUs are busy",
            pool.scenario(),
            config.max_vus
        );
        pool.record_dropped(1);
    }
}
