use std::sync::Arc;

use squall_core::prelude::ShutdownHandle;
use squall_instruments::{builtin, MetricsRegistry};
use tokio::runtime::Handle;

use crate::config::Scenario;
use crate::context::{RunnerContext, ScenarioInfo, UserValuesConstraint};
use crate::definition::IterationFn;
use crate::executor::Executor;
use crate::run_state::RunState;
use crate::transport::UnconfiguredTransport;
use crate::vu::{VuMetrics, VuSpec};

#[derive(Debug, Default)]
pub(crate) struct NoValues;

impl UserValuesConstraint for NoValues {}

pub(crate) fn runner_context() -> Arc<RunnerContext<NoValues>> {
    let registry = Arc::new(MetricsRegistry::new());
    builtin::register_builtin(&registry).unwrap();

    Arc::new(RunnerContext::new(
        Arc::new(Executor::new(Handle::current(), ShutdownHandle::new())),
        registry,
        Arc::new(UnconfiguredTransport),
        ShutdownHandle::new(),
        Arc::new(RunState::new()),
        "test-run".to_string(),
    ))
}

pub(crate) fn scenario_spec(
    scenario: &Scenario,
    iteration: IterationFn<NoValues, NoValues>,
) -> Arc<VuSpec<NoValues, NoValues>> {
    let runner_context = runner_context();
    let metrics = VuMetrics::new(runner_context.registry()).unwrap();

    Arc::new(VuSpec {
        runner_context,
        scenario: Arc::new(ScenarioInfo {
            name: scenario.name.clone(),
            tags: scenario.tags.clone(),
        }),
        setup: None,
        iteration,
        teardown: None,
        hard_stop: ShutdownHandle::new(),
        metrics,
    })
}
