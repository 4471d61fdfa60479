use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use squall_core::prelude::IterationResult;
use squall_instruments::{Aggregation, MetricKind, ThresholdConfig, ThresholdEvaluator};

use crate::cli::SquallCli;
use crate::config::{
    parse_trend_stats, validate_scenarios, ConfigError, RunConfig, Scenario, ScenarioConfig,
    DEFAULT_EXEC,
};
use crate::context::{RunnerContext, UserValuesConstraint, VuContext};
use crate::init::init;
use crate::transport::{Transport, UnconfiguredTransport};

pub type HookResult = anyhow::Result<()>;

pub type GlobalHookMut<RV> = fn(&mut RunnerContext<RV>) -> HookResult;
pub type GlobalHook<RV> = fn(Arc<RunnerContext<RV>>) -> HookResult;
pub type VuHook<RV, V> = for<'a> fn(&'a mut VuContext<RV, V>) -> BoxFuture<'a, HookResult>;
pub type IterationFn<RV, V> =
    for<'a> fn(&'a mut VuContext<RV, V>) -> BoxFuture<'a, IterationResult>;

/// Used when neither code, the config file nor the command line defines a scenario: one VU runs
/// the default iteration once.
const DEFAULT_SCENARIO: &str = "default";

/// Used for `--vus` and `--duration` when only the other one is given.
const DEFAULT_CLI_DURATION: Duration = Duration::from_secs(10);

/// The builder for a test definition.
///
/// This must be used at the start of a test to define what you want to run.
pub struct ScenarioDefinitionBuilder<RV: UserValuesConstraint, V: UserValuesConstraint> {
    /// The name of the test, recommended value is `env!("CARGO_PKG_NAME")`.
    name: String,
    cli: SquallCli,
    /// Scenarios declared in code. A config file that declares scenarios replaces these.
    scenarios: Vec<(String, ScenarioConfig)>,
    thresholds: Vec<ThresholdConfig>,
    summary_trend_stats: Vec<String>,
    declared_metrics: Vec<(String, MetricKind)>,
    capture_env: HashSet<String>,
    transport: Option<Arc<dyn Transport>>,
    /// Global setup hook. Runs once, before any VU starts.
    setup_fn: Option<GlobalHookMut<RV>>,
    /// Runs once for each VU before its first iteration. A VU whose setup fails runs no iterations.
    setup_vu_fn: Option<VuHook<RV, V>>,
    /// Iteration bodies by name. Scenarios pick one with `exec`, the one registered with
    /// [ScenarioDefinitionBuilder::use_iteration] is called `default`.
    iterations: HashMap<String, IterationFn<RV, V>>,
    /// Runs once for each VU that stopped gracefully.
    teardown_vu_fn: Option<VuHook<RV, V>>,
    /// Global teardown hook. Runs once after every VU has stopped. Failures are logged and don't
    /// prevent the summary from being produced.
    teardown_fn: Option<GlobalHook<RV>>,
}

pub(crate) struct ScenarioDefinition<RV: UserValuesConstraint, V: UserValuesConstraint> {
    pub(crate) name: String,
    pub(crate) scenarios: Vec<Scenario>,
    pub(crate) thresholds: ThresholdEvaluator,
    /// Every resolved setting that shapes the run, one entry each, in a stable order
    pub(crate) resolved_config: Vec<String>,
    pub(crate) trend_stats: Vec<Aggregation>,
    pub(crate) declared_metrics: Vec<(String, MetricKind)>,
    pub(crate) capture_env: HashSet<String>,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) no_progress: bool,
    pub(crate) no_thresholds: bool,
    pub(crate) summary_export: Option<std::path::PathBuf>,
    pub(crate) run_id: Option<String>,
    pub(crate) setup_fn: Option<GlobalHookMut<RV>>,
    pub(crate) setup_vu_fn: Option<VuHook<RV, V>>,
    pub(crate) iterations: HashMap<String, IterationFn<RV, V>>,
    pub(crate) teardown_vu_fn: Option<VuHook<RV, V>>,
    pub(crate) teardown_fn: Option<GlobalHook<RV>>,
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> ScenarioDefinitionBuilder<RV, V> {
    /// Initialise logging, parse the command line and create a new test definition.
    pub fn new_with_init(name: &str) -> Self {
        let cli = init();
        Self::new(name, cli)
    }

    /// Create a new test definition from already parsed command line arguments.
    pub fn new(name: &str, cli: SquallCli) -> Self {
        Self {
            name: name.to_string(),
            cli,
            scenarios: Vec::new(),
            thresholds: Vec::new(),
            summary_trend_stats: Vec::new(),
            declared_metrics: Vec::new(),
            capture_env: HashSet::with_capacity(0),
            transport: None,
            setup_fn: None,
            setup_vu_fn: None,
            iterations: HashMap::new(),
            teardown_vu_fn: None,
            teardown_fn: None,
        }
    }

    pub fn with_scenario(mut self, name: &str, scenario: ScenarioConfig) -> Self {
        self.scenarios.push((name.to_string(), scenario));
        self
    }

    pub fn with_threshold(mut self, threshold: ThresholdConfig) -> Self {
        self.thresholds.push(threshold);
        self
    }

    /// Statistics to show for every Trend in the summary, e.g. `["avg", "p(99)"]`.
    pub fn with_summary_trend_stats(mut self, stats: &[&str]) -> Self {
        self.summary_trend_stats = stats.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Register a custom metric before the run starts, so that thresholds can refer to it.
    pub fn declare_metric(mut self, name: &str, kind: MetricKind) -> Self {
        self.declared_metrics.push((name.to_string(), kind));
        self
    }

    /// Record the value of an environment variable in the run summary.
    pub fn add_capture_env(mut self, key: &str) -> Self {
        self.capture_env.insert(key.to_string());
        self
    }

    pub fn with_transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Arc::new(transport));
        self
    }

    /// Set the global setup hook [ScenarioDefinitionBuilder::setup_fn].
    pub fn use_setup(mut self, setup_fn: GlobalHookMut<RV>) -> Self {
        self.setup_fn = Some(setup_fn);
        self
    }

    /// Set the VU setup hook [ScenarioDefinitionBuilder::setup_vu_fn].
    pub fn use_vu_setup(mut self, setup_vu_fn: VuHook<RV, V>) -> Self {
        self.setup_vu_fn = Some(setup_vu_fn);
        self
    }

    /// Set the `default` iteration body.
    pub fn use_iteration(self, iteration: IterationFn<RV, V>) -> Self {
        self.use_named_iteration(DEFAULT_EXEC, iteration)
    }

    /// Add a named iteration body, for scenarios to select with `exec`.
    pub fn use_named_iteration(mut self, name: &str, iteration: IterationFn<RV, V>) -> Self {
        let previous = self.iterations.insert(name.to_string(), iteration);

        if previous.is_some() {
            panic!("Iteration [{}] is already defined", name);
        }

        self
    }

    /// Set the VU teardown hook [ScenarioDefinitionBuilder::teardown_vu_fn].
    pub fn use_vu_teardown(mut self, teardown_vu_fn: VuHook<RV, V>) -> Self {
        self.teardown_vu_fn = Some(teardown_vu_fn);
        self
    }

    /// Set the global teardown hook [ScenarioDefinitionBuilder::teardown_fn].
    pub fn use_teardown(mut self, teardown_fn: GlobalHook<RV>) -> Self {
        self.teardown_fn = Some(teardown_fn);
        self
    }

    /// Resolve scenarios and thresholds from code, the config file and the command line, in that
    /// order, and validate all of it.
    pub(crate) fn build(self) -> Result<ScenarioDefinition<RV, V>, ConfigError> {
        let mut scenarios = self.scenarios;
        let mut thresholds = self.thresholds;
        let mut trend_stats = parse_trend_stats(&self.summary_trend_stats)?;

        if let Some(path) = &self.cli.config {
            log::info!("Loading run configuration from {path:?}");
            let config = RunConfig::from_file(path)?;
            if !config.scenarios.is_empty() {
                scenarios = config.scenarios.clone().into_iter().collect();
            }
            if !config.summary_trend_stats.is_empty() {
                trend_stats = config.trend_stats()?;
            }
            thresholds.extend(config.thresholds.into_iter().map(ThresholdConfig::from));
        }

        if self.cli.vus.is_some() || self.cli.duration.is_some() {
            let vus = self.cli.vus.unwrap_or(1);
            let duration = self.cli.duration.unwrap_or(DEFAULT_CLI_DURATION);
            log::info!("Running {vus} VUs for {duration:?} from the command line");
            scenarios = vec![(
                DEFAULT_SCENARIO.to_string(),
                ScenarioConfig::constant_vus(vus, duration),
            )];
        }

        if scenarios.is_empty() {
            scenarios.push((
                DEFAULT_SCENARIO.to_string(),
                ScenarioConfig::per_vu_iterations(1, 1),
            ));
        }

        let known_execs = self.iterations.keys().cloned().collect::<HashSet<_>>();
        let scenarios = validate_scenarios(scenarios.iter().map(|(n, s)| (n, s)), &known_execs)?;
        let evaluator = ThresholdEvaluator::new(&thresholds)?;
        let resolved_config = resolved_config(
            &scenarios,
            &thresholds,
            &trend_stats,
            &self.declared_metrics,
        );

        Ok(ScenarioDefinition {
            name: self.name,
            scenarios,
            thresholds: evaluator,
            resolved_config,
            trend_stats,
            declared_metrics: self.declared_metrics,
            capture_env: self.capture_env,
            transport: self
                .transport
                .unwrap_or_else(|| Arc::new(UnconfiguredTransport)),
            no_progress: self.cli.no_progress,
            no_thresholds: self.cli.no_thresholds,
            summary_export: self.cli.summary_export,
            run_id: self.cli.run_id,
            setup_fn: self.setup_fn,
            setup_vu_fn: self.setup_vu_fn,
            iterations: self.iterations,
            teardown_vu_fn: self.teardown_vu_fn,
            teardown_fn: self.teardown_fn,
        })
    }
}

fn resolved_config(
    scenarios: &[Scenario],
    thresholds: &[ThresholdConfig],
    trend_stats: &[Aggregation],
    declared_metrics: &[(String, MetricKind)],
) -> Vec<String> {
    let mut lines = Vec::new();
    lines.extend(scenarios.iter().map(|s| format!("scenario {s:?}")));
    lines.extend(thresholds.iter().map(|t| format!("threshold {t:?}")));
    lines.push(format!("summaryTrendStats {trend_stats:?}"));
    let mut declared = declared_metrics.to_vec();
    declared.sort_by(|a, b| a.0.cmp(&b.0));
    lines.extend(
        declared
            .iter()
            .map(|(name, kind)| format!("metric {name} {kind:?}")),
    );
    lines
}

impl<RV: UserValuesConstraint, V: UserValuesConstraint> ScenarioDefinition<RV, V> {
    /// The longest any scenario plans to run, including its start offset.
    pub(crate) fn planned_duration(&self) -> Duration {
        self.scenarios
            .iter()
            .map(|s| s.start_time + s.executor.planned_duration())
            .max()
            .unwrap_or_default()
    }

    pub(crate) fn scenario_descriptions(&self) -> BTreeMap<String, String> {
        self.scenarios
            .iter()
            .map(|s| (s.name.clone(), s.executor.describe()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[derive(Debug, Default)]
    struct Values;
    impl UserValuesConstraint for Values {}

    fn iteration(_ctx: &mut VuContext<Values, Values>) -> BoxFuture<'_, IterationResult> {
        async { Ok(()) }.boxed()
    }

    fn cli() -> SquallCli {
        SquallCli {
            config: None,
            vus: None,
            duration: None,
            no_progress: true,
            summary_export: None,
            run_id: None,
            no_thresholds: false,
        }
    }

    #[test]
    fn default_scenario_when_none_defined() {
        let definition = ScenarioDefinitionBuilder::<Values, Values>::new("t", cli())
            .use_iteration(iteration)
            .build()
            .unwrap();

        assert_eq!(1, definition.scenarios.len());
        assert_eq!("default", definition.scenarios[0].name);
        assert_eq!(
            "per-vu-iterations: 1 iterations for each of 1 VUs, max 10m",
            definition.scenarios[0].executor.describe()
        );
    }

    #[test]
    fn cli_vus_replace_scenarios() {
        let mut cli = cli();
        cli.vus = Some(3);
        let definition = ScenarioDefinitionBuilder::<Values, Values>::new("t", cli)
            .with_scenario("a", ScenarioConfig::per_vu_iterations(1, 1))
            .use_iteration(iteration)
            .build()
            .unwrap();

        assert_eq!(1, definition.scenarios.len());
        assert_eq!(Duration::from_secs(10), definition.planned_duration());
    }

    #[test]
    fn config_file_scenarios_replace_code_scenarios() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[scenarios.from_file]
executor = "constant-vus"
vus = 2
duration = "3s"
startTime = "2s"

[[thresholds]]
metric = "checks"
expressions = ["rate>0.9"]
"#
        )
        .unwrap();

        let mut cli = cli();
        cli.config = Some(file.path().to_path_buf());
        let definition = ScenarioDefinitionBuilder::<Values, Values>::new("t", cli)
            .with_scenario("in_code", ScenarioConfig::per_vu_iterations(1, 1))
            .with_threshold(ThresholdConfig::new("http_req_failed", ["rate<0.1"]))
            .use_iteration(iteration)
            .build()
            .unwrap();

        assert_eq!(
            vec!["from_file"],
            definition
                .scenarios
                .iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
        );
        assert_eq!(Duration::from_secs(5), definition.planned_duration());
        assert!(!definition.thresholds.is_empty());
    }

    #[test]
    fn resolved_config_tracks_scenarios_and_thresholds() {
        let build = |iterations: u64, threshold: &str| {
            ScenarioDefinitionBuilder::<Values, Values>::new("t", cli())
                .with_scenario("a", ScenarioConfig::per_vu_iterations(2, iterations))
                .with_threshold(ThresholdConfig::new("http_req_failed", [threshold]))
                .use_iteration(iteration)
                .build()
                .unwrap()
                .resolved_config
        };

        let config = build(5, "rate<0.1");
        assert_eq!(config, build(5, "rate<0.1"));
        assert_ne!(config, build(6, "rate<0.1"));
        assert_ne!(config, build(5, "rate<0.2"));
    }

    #[test]
    fn unknown_exec_fails_build() {
        let result = ScenarioDefinitionBuilder::<Values, Values>::new("t", cli())
            .with_scenario(
                "a",
                ScenarioConfig::per_vu_iterations(1, 1).with_exec("missing"),
            )
            .use_iteration(iteration)
            .build();
        assert!(matches!(result, Err(ConfigError::UnknownExec { .. })));
    }

    #[test]
    fn bad_threshold_fails_build() {
        let result = ScenarioDefinitionBuilder::<Values, Values>::new("t", cli())
            .with_threshold(ThresholdConfig::new("http_req_failed", ["rate<<1"]))
            .use_iteration(iteration)
            .build();
        assert!(matches!(result, Err(ConfigError::Threshold(_))));
    }

    #[test]
    #[should_panic(expected = "Iteration [default] is already defined")]
    fn duplicate_iteration_panics() {
        let _ = ScenarioDefinitionBuilder::<Values, Values>::new("t", cli())
            .use_iteration(iteration)
            .use_iteration(iteration);
    }
}
