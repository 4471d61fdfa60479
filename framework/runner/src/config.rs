use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use squall_instruments::{Aggregation, ParseAggregationError, Tags, ThresholdConfig, ThresholdError};

use crate::stage::{Stage, Stages};

pub const DEFAULT_EXEC: &str = "default";
pub const DEFAULT_GRACEFUL_STOP: Duration = Duration::from_secs(30);
pub const DEFAULT_CONTROL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_TIME_UNIT: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_DURATION: Duration = Duration::from_secs(600);
/// Upper bound for a stage target, in VUs or iterations per time unit.
pub const MAX_STAGE_TARGET: f64 = 1_000_000.0;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("No scenarios to run")]
    NoScenarios,
    #[error("Scenario `{0}` is defined more than once")]
    DuplicateScenario(String),
    #[error("Scenario `{scenario}` uses unknown executor `{executor}`")]
    UnknownExecutor { scenario: String, executor: String },
    #[error("Scenario `{scenario}` is missing `{parameter}`, which {executor} requires")]
    MissingParameter {
        scenario: String,
        executor: &'static str,
        parameter: &'static str,
    },
    #[error("Scenario `{scenario}` sets `{parameter}`, which {executor} does not use")]
    UnexpectedParameter {
        scenario: String,
        executor: &'static str,
        parameter: &'static str,
    },
    #[error("Scenario `{scenario}` has an invalid `{parameter}`: {reason}")]
    InvalidParameter {
        scenario: String,
        parameter: &'static str,
        reason: String,
    },
    #[error("Scenario `{scenario}` needs at least one stage")]
    EmptyStages { scenario: String },
    #[error("Scenario `{scenario}` has maxVUs ({max_vus}) below preAllocatedVUs ({pre_allocated_vus})")]
    MaxVusBelowPreAllocated {
        scenario: String,
        max_vus: usize,
        pre_allocated_vus: usize,
    },
    #[error("Scenario `{scenario}` runs `{exec}`, but no iteration with that name is defined")]
    UnknownExec { scenario: String, exec: String },
    #[error(transparent)]
    Threshold(#[from] ThresholdError),
    #[error(transparent)]
    TrendStat(#[from] ParseAggregationError),
}

/// What happens to an arrival-rate ticket when every VU is busy and the pool can't grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(tag = "policy", rename_all = "camelCase")]
pub enum OverflowPolicy {
    /// Drop the ticket and count it in `dropped_iterations`
    #[default]
    Drop,
    /// Hold up to `capacity` tickets until a VU frees up, and drop the rest
    Queue { capacity: usize },
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StageConfig {
    #[serde(deserialize_with = "deserialize_duration")]
    pub duration: Duration,
    pub target: f64,
}

/// A scenario as written in a config file, or built in code with the constructors below.
///
/// Which fields apply depends on `executor`. [ScenarioConfig::validate] checks the combination
/// and turns it into a [Scenario].
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ScenarioConfig {
    pub executor: String,
    pub vus: Option<usize>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub duration: Option<Duration>,
    pub stages: Option<Vec<StageConfig>>,
    #[serde(rename = "startVUs")]
    pub start_vus: Option<usize>,
    pub start_rate: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub time_unit: Option<Duration>,
    #[serde(rename = "preAllocatedVUs")]
    pub pre_allocated_vus: Option<usize>,
    #[serde(rename = "maxVUs")]
    pub max_vus: Option<usize>,
    pub iterations: Option<u64>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub max_duration: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub graceful_stop: Option<Duration>,
    pub exec: Option<String>,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub start_time: Option<Duration>,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    pub control_interval: Option<Duration>,
    pub overflow: Option<OverflowPolicy>,
}

fn to_stage_configs(stages: Vec<Stage>) -> Vec<StageConfig> {
    stages
        .into_iter()
        .map(|s| StageConfig {
            duration: s.duration,
            target: s.target,
        })
        .collect()
}

impl ScenarioConfig {
    pub fn constant_vus(vus: usize, duration: Duration) -> Self {
        Self {
            executor: "constant-vus".to_string(),
            vus: Some(vus),
            duration: Some(duration),
            ..Default::default()
        }
    }

    pub fn ramping_vus(start_vus: usize, stages: Vec<Stage>) -> Self {
        Self {
            executor: "ramping-vus".to_string(),
            start_vus: Some(start_vus),
            stages: Some(to_stage_configs(stages)),
            ..Default::default()
        }
    }

    pub fn ramping_arrival_rate(
        start_rate: f64,
        time_unit: Duration,
        stages: Vec<Stage>,
        pre_allocated_vus: usize,
        max_vus: usize,
    ) -> Self {
        Self {
            executor: "ramping-arrival-rate".to_string(),
            start_rate: Some(start_rate),
            time_unit: Some(time_unit),
            stages: Some(to_stage_configs(stages)),
            pre_allocated_vus: Some(pre_allocated_vus),
            max_vus: Some(max_vus),
            ..Default::default()
        }
    }

    pub fn per_vu_iterations(vus: usize, iterations: u64) -> Self {
        Self {
            executor: "per-vu-iterations".to_string(),
            vus: Some(vus),
            iterations: Some(iterations),
            ..Default::default()
        }
    }

    pub fn with_exec(mut self, exec: &str) -> Self {
        self.exec = Some(exec.to_string());
        self
    }

    pub fn with_graceful_stop(mut self, graceful_stop: Duration) -> Self {
        self.graceful_stop = Some(graceful_stop);
        self
    }

    pub fn with_start_time(mut self, start_time: Duration) -> Self {
        self.start_time = Some(start_time);
        self
    }

    pub fn with_max_duration(mut self, max_duration: Duration) -> Self {
        self.max_duration = Some(max_duration);
        self
    }

    pub fn with_control_interval(mut self, control_interval: Duration) -> Self {
        self.control_interval = Some(control_interval);
        self
    }

    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = Some(overflow);
        self
    }

    pub fn with_tag(mut self, key: &str, value: &str) -> Self {
        self.tags.insert(key.to_string(), value.to_string());
        self
    }

    /// Check the parameters for the chosen executor and resolve defaults.
    pub fn validate(&self, name: &str) -> Result<Scenario, ConfigError> {
        let executor = match self.executor.as_str() {
            "constant-vus" => self.validate_constant_vus(name)?,
            "ramping-vus" => self.validate_ramping_vus(name)?,
            "ramping-arrival-rate" => self.validate_ramping_arrival_rate(name)?,
            "per-vu-iterations" => self.validate_per_vu_iterations(name)?,
            other => {
                return Err(ConfigError::UnknownExecutor {
                    scenario: name.to_string(),
                    executor: other.to_string(),
                })
            }
        };

        Ok(Scenario {
            name: name.to_string(),
            exec: self.exec.clone().unwrap_or_else(|| DEFAULT_EXEC.to_string()),
            tags: self.tags.clone(),
            start_time: self.start_time.unwrap_or_default(),
            graceful_stop: self.graceful_stop.unwrap_or(DEFAULT_GRACEFUL_STOP),
            executor,
        })
    }

    /// Parameters that are set, by their config file name.
    fn set_parameters(&self) -> Vec<&'static str> {
        let mut set = Vec::new();
        let mut check = |present: bool, parameter: &'static str| {
            if present {
                set.push(parameter);
            }
        };
        check(self.vus.is_some(), "vus");
        check(self.duration.is_some(), "duration");
        check(self.stages.is_some(), "stages");
        check(self.start_vus.is_some(), "startVUs");
        check(self.start_rate.is_some(), "startRate");
        check(self.time_unit.is_some(), "timeUnit");
        check(self.pre_allocated_vus.is_some(), "preAllocatedVUs");
        check(self.max_vus.is_some(), "maxVUs");
        check(self.iterations.is_some(), "iterations");
        check(self.max_duration.is_some(), "maxDuration");
        check(self.control_interval.is_some(), "controlInterval");
        check(self.overflow.is_some(), "overflow");
        set
    }

    fn only_uses(
        &self,
        scenario: &str,
        executor: &'static str,
        allowed: &[&'static str],
    ) -> Result<(), ConfigError> {
        match self
            .set_parameters()
            .into_iter()
            .find(|p| !allowed.contains(p))
        {
            Some(parameter) => Err(ConfigError::UnexpectedParameter {
                scenario: scenario.to_string(),
                executor,
                parameter,
            }),
            None => Ok(()),
        }
    }

    fn validate_constant_vus(&self, scenario: &str) -> Result<ExecutorConfig, ConfigError> {
        const EXECUTOR: &str = "constant-vus";
        self.only_uses(scenario, EXECUTOR, &["vus", "duration"])?;

        let vus = required(scenario, EXECUTOR, "vus", self.vus)?;
        positive(scenario, "vus", vus)?;
        let duration = required(scenario, EXECUTOR, "duration", self.duration)?;
        non_zero_duration(scenario, "duration", duration)?;

        Ok(ExecutorConfig::ConstantVus(ConstantVus { vus, duration }))
    }

    fn validate_ramping_vus(&self, scenario: &str) -> Result<ExecutorConfig, ConfigError> {
        const EXECUTOR: &str = "ramping-vus";
        self.only_uses(
            scenario,
            EXECUTOR,
            &["stages", "startVUs", "controlInterval"],
        )?;

        let start_vus = self.start_vus.unwrap_or(0);
        let stages = self.stages(scenario, EXECUTOR, start_vus as f64)?;
        let control_interval = self.control_interval.unwrap_or(DEFAULT_CONTROL_INTERVAL);
        non_zero_duration(scenario, "controlInterval", control_interval)?;

        Ok(ExecutorConfig::RampingVus(RampingVus {
            stages,
            control_interval,
        }))
    }

    fn validate_ramping_arrival_rate(&self, scenario: &str) -> Result<ExecutorConfig, ConfigError> {
        const EXECUTOR: &str = "ramping-arrival-rate";
        self.only_uses(
            scenario,
            EXECUTOR,
            &[
                "stages",
                "startRate",
                "timeUnit",
                "preAllocatedVUs",
                "maxVUs",
                "overflow",
            ],
        )?;

        let start_rate = self.start_rate.unwrap_or(0.0);
        if !start_rate.is_finite() || !(0.0..=MAX_STAGE_TARGET).contains(&start_rate) {
            return Err(ConfigError::InvalidParameter {
                scenario: scenario.to_string(),
                parameter: "startRate",
                reason: format!("must be a number between 0 and {MAX_STAGE_TARGET}"),
            });
        }
        let stages = self.stages(scenario, EXECUTOR, start_rate)?;
        let time_unit = self.time_unit.unwrap_or(DEFAULT_TIME_UNIT);
        non_zero_duration(scenario, "timeUnit", time_unit)?;

        let pre_allocated_vus =
            required(scenario, EXECUTOR, "preAllocatedVUs", self.pre_allocated_vus)?;
        let max_vus = self.max_vus.unwrap_or(pre_allocated_vus);
        if max_vus < pre_allocated_vus {
            return Err(ConfigError::MaxVusBelowPreAllocated {
                scenario: scenario.to_string(),
                max_vus,
                pre_allocated_vus,
            });
        }
        positive(scenario, "maxVUs", max_vus)?;

        Ok(ExecutorConfig::RampingArrivalRate(RampingArrivalRate {
            stages,
            time_unit,
            pre_allocated_vus,
            max_vus,
            overflow: self.overflow.unwrap_or_default(),
        }))
    }

    fn validate_per_vu_iterations(&self, scenario: &str) -> Result<ExecutorConfig, ConfigError> {
        const EXECUTOR: &str = "per-vu-iterations";
        self.only_uses(scenario, EXECUTOR, &["vus", "iterations", "maxDuration"])?;

        let vus = required(scenario, EXECUTOR, "vus", self.vus)?;
        positive(scenario, "vus", vus)?;
        let iterations = required(scenario, EXECUTOR, "iterations", self.iterations)?;
        positive(scenario, "iterations", iterations)?;
        let max_duration = self.max_duration.unwrap_or(DEFAULT_MAX_DURATION);
        non_zero_duration(scenario, "maxDuration", max_duration)?;

        Ok(ExecutorConfig::PerVuIterations(PerVuIterations {
            vus,
            iterations,
            max_duration,
        }))
    }

    fn stages(
        &self,
        scenario: &str,
        executor: &'static str,
        start: f64,
    ) -> Result<Stages, ConfigError> {
        let stages = required(scenario, executor, "stages", self.stages.as_ref())?;
        if stages.is_empty() {
            return Err(ConfigError::EmptyStages {
                scenario: scenario.to_string(),
            });
        }
        if let Some(bad) = stages
            .iter()
            .find(|s| !s.target.is_finite() || s.target < 0.0 || s.target > MAX_STAGE_TARGET)
        {
            return Err(ConfigError::InvalidParameter {
                scenario: scenario.to_string(),
                parameter: "stages",
                reason: format!(
                    "target {} must be a number between 0 and {MAX_STAGE_TARGET}",
                    bad.target
                ),
            });
        }

        Ok(Stages::new(
            start,
            stages
                .iter()
                .map(|s| Stage::new(s.duration, s.target))
                .collect(),
        ))
    }
}

fn required<T>(
    scenario: &str,
    executor: &'static str,
    parameter: &'static str,
    value: Option<T>,
) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingParameter {
        scenario: scenario.to_string(),
        executor,
        parameter,
    })
}

fn positive<T: Default + PartialEq>(
    scenario: &str,
    parameter: &'static str,
    value: T,
) -> Result<(), ConfigError> {
    if value == T::default() {
        return Err(ConfigError::InvalidParameter {
            scenario: scenario.to_string(),
            parameter,
            reason: "must be at least 1".to_string(),
        });
    }
    Ok(())
}

fn non_zero_duration(
    scenario: &str,
    parameter: &'static str,
    value: Duration,
) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidParameter {
            scenario: scenario.to_string(),
            parameter,
            reason: "must be longer than zero".to_string(),
        });
    }
    Ok(())
}

/// A validated scenario. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct Scenario {
    pub name: String,
    /// The name of the iteration function this scenario's VUs run
    pub exec: String,
    pub tags: Tags,
    pub start_time: Duration,
    pub graceful_stop: Duration,
    pub executor: ExecutorConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstantVus {
    pub vus: usize,
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RampingVus {
    pub stages: Stages,
    pub control_interval: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RampingArrivalRate {
    /// Iterations per `time_unit`
    pub stages: Stages,
    pub time_unit: Duration,
    pub pre_allocated_vus: usize,
    pub max_vus: usize,
    pub overflow: OverflowPolicy,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PerVuIterations {
    pub vus: usize,
    pub iterations: u64,
    pub max_duration: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorConfig {
    ConstantVus(ConstantVus),
    RampingVus(RampingVus),
    RampingArrivalRate(RampingArrivalRate),
    PerVuIterations(PerVuIterations),
}

impl ExecutorConfig {
    /// How long the executor plans to run, not counting the graceful stop. For per-vu-iterations
    /// this is the upper bound.
    pub fn planned_duration(&self) -> Duration {
        match self {
            ExecutorConfig::ConstantVus(c) => c.duration,
            ExecutorConfig::RampingVus(c) => c.stages.total_duration(),
            ExecutorConfig::RampingArrivalRate(c) => c.stages.total_duration(),
            ExecutorConfig::PerVuIterations(c) => c.max_duration,
        }
    }

    /// A short human readable description, used in the run summary.
    pub fn describe(&self) -> String {
        match self {
            ExecutorConfig::ConstantVus(c) => format!(
                "constant-vus: {} VUs for {}",
                c.vus,
                humantime::format_duration(c.duration)
            ),
            ExecutorConfig::RampingVus(c) => format!(
                "ramping-vus: {} stages over {}",
                c.stages.stages().len(),
                humantime::format_duration(c.stages.total_duration())
            ),
            ExecutorConfig::RampingArrivalRate(c) => format!(
                "ramping-arrival-rate: {} stages over {}, per {}, {}-{} VUs",
                c.stages.stages().len(),
                humantime::format_duration(c.stages.total_duration()),
                humantime::format_duration(c.time_unit),
                c.pre_allocated_vus,
                c.max_vus
            ),
            ExecutorConfig::PerVuIterations(c) => format!(
                "per-vu-iterations: {} iterations for each of {} VUs, max {}",
                c.iterations,
                c.vus,
                humantime::format_duration(c.max_duration)
            ),
        }
    }
}

/// A threshold as written in a config file, either as a table
///
/// ```toml
/// [[thresholds]]
/// metric = "http_req_duration{name:home}"
/// expressions = ["p(95)<500"]
/// abortOnFail = true
/// delayAbortEval = "10s"
/// ```
///
/// or inline, as `thresholds = ["http_req_duration{name:home}: p(95)<500, avg<200"]`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "ThresholdDeclaration")]
pub struct ThresholdEntry {
    pub metric: String,
    pub expressions: Vec<String>,
    pub abort_on_fail: bool,
    pub delay_abort_eval: Option<Duration>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ThresholdDeclaration {
    Inline(String),
    Table(ThresholdTable),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct ThresholdTable {
    metric: String,
    expressions: Vec<String>,
    #[serde(default)]
    abort_on_fail: bool,
    #[serde(default, deserialize_with = "deserialize_opt_duration")]
    delay_abort_eval: Option<Duration>,
}

impl TryFrom<ThresholdDeclaration> for ThresholdEntry {
    type Error = ThresholdError;

    fn try_from(declaration: ThresholdDeclaration) -> Result<Self, Self::Error> {
        Ok(match declaration {
            ThresholdDeclaration::Inline(line) => {
                let config = line.parse::<ThresholdConfig>()?;
                ThresholdEntry {
                    metric: config.metric,
                    expressions: config.expressions,
                    abort_on_fail: false,
                    delay_abort_eval: None,
                }
            }
            ThresholdDeclaration::Table(table) => ThresholdEntry {
                metric: table.metric,
                expressions: table.expressions,
                abort_on_fail: table.abort_on_fail,
                delay_abort_eval: table.delay_abort_eval,
            },
        })
    }
}

impl From<ThresholdEntry> for ThresholdConfig {
    fn from(entry: ThresholdEntry) -> Self {
        ThresholdConfig {
            metric: entry.metric,
            expressions: entry.expressions,
            abort_on_fail: entry.abort_on_fail,
            delay_abort_eval: entry.delay_abort_eval,
        }
    }
}

/// A run configuration file.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RunConfig {
    #[serde(default)]
    pub scenarios: BTreeMap<String, ScenarioConfig>,
    #[serde(default)]
    pub thresholds: Vec<ThresholdEntry>,
    /// Statistics to show for every Trend in the summary, e.g. `["avg", "p(99)"]`
    #[serde(default)]
    pub summary_trend_stats: Vec<String>,
}

impl RunConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(input)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn trend_stats(&self) -> Result<Vec<Aggregation>, ConfigError> {
        parse_trend_stats(&self.summary_trend_stats)
    }
}

pub(crate) fn parse_trend_stats(stats: &[String]) -> Result<Vec<Aggregation>, ConfigError> {
    Ok(stats
        .iter()
        .map(|s| s.parse::<Aggregation>())
        .collect::<Result<Vec<_>, _>>()?)
}

/// Validate every scenario and check that each one runs an iteration function that exists.
pub fn validate_scenarios<'a>(
    scenarios: impl IntoIterator<Item = (&'a String, &'a ScenarioConfig)>,
    known_execs: &HashSet<String>,
) -> Result<Vec<Scenario>, ConfigError> {
    let mut names = HashSet::new();
    let mut validated = Vec::new();
    for (name, config) in scenarios {
        if !names.insert(name.clone()) {
            return Err(ConfigError::DuplicateScenario(name.clone()));
        }

        let scenario = config.validate(name)?;
        if !known_execs.contains(&scenario.exec) {
            return Err(ConfigError::UnknownExec {
                scenario: name.clone(),
                exec: scenario.exec,
            });
        }
        validated.push(scenario);
    }

    if validated.is_empty() {
        return Err(ConfigError::NoScenarios);
    }

    Ok(validated)
}

/// Durations are written either as a humantime string such as `"30s"` or `"1m 30s"`, or as a
/// whole number of seconds.
#[derive(Deserialize)]
#[serde(untagged)]
enum DurationValue {
    Seconds(u64),
    Text(String),
}

impl DurationValue {
    fn into_duration<E: serde::de::Error>(self) -> Result<Duration, E> {
        match self {
            DurationValue::Seconds(s) => Ok(Duration::from_secs(s)),
            DurationValue::Text(t) => humantime::parse_duration(&t).map_err(E::custom),
        }
    }
}

fn deserialize_duration<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
    DurationValue::deserialize(deserializer)?.into_duration()
}

fn deserialize_opt_duration<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Duration>, D::Error> {
    Option::<DurationValue>::deserialize(deserializer)?
        .map(DurationValue::into_duration::<D::Error>)
        .transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn execs(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    const FULL_CONFIG: &str = r#"
summaryTrendStats = ["avg", "p(99)"]

[scenarios.browse]
executor = "ramping-vus"
startVUs = 2
stages = [
    { duration = "10s", target = 10 },
    { duration = 10, target = 0 },
]
gracefulStop = "5s"
tags = { flow = "browse" }

[scenarios.orders]
executor = "ramping-arrival-rate"
exec = "place_order"
startRate = 5
timeUnit = "1m"
preAllocatedVUs = 2
maxVUs = 20
stages = [{ duration = "30s", target = 60 }]
overflow = { policy = "queue", capacity = 10 }
startTime = "10s"

[[thresholds]]
metric = "http_req_failed"
expressions = ["rate<0.01"]

[[thresholds]]
metric = "http_req_duration{name:home}"
expressions = ["p(95)<500", "avg<200"]
abortOnFail = true
delayAbortEval = "10s"
"#;

    #[test]
    fn parse_full_config() {
        let config = RunConfig::from_toml_str(FULL_CONFIG).unwrap();
        assert_eq!(2, config.scenarios.len());
        assert_eq!(
            vec![Aggregation::Avg, Aggregation::Percentile(99.0)],
            config.trend_stats().unwrap()
        );

        let scenarios =
            validate_scenarios(&config.scenarios, &execs(&["default", "place_order"])).unwrap();
        let browse = &scenarios[0];
        assert_eq!("browse", browse.name);
        assert_eq!("default", browse.exec);
        assert_eq!(Duration::from_secs(5), browse.graceful_stop);
        match &browse.executor {
            ExecutorConfig::RampingVus(r) => {
                assert_eq!(2.0, r.stages.value_at(Duration::ZERO));
                assert_eq!(Duration::from_secs(20), r.stages.total_duration());
                assert_eq!(DEFAULT_CONTROL_INTERVAL, r.control_interval);
            }
            other => panic!("Unexpected executor {other:?}"),
        }

        let orders = &scenarios[1];
        assert_eq!(Duration::from_secs(10), orders.start_time);
        assert_eq!(DEFAULT_GRACEFUL_STOP, orders.graceful_stop);
        match &orders.executor {
            ExecutorConfig::RampingArrivalRate(r) => {
                assert_eq!(Duration::from_secs(60), r.time_unit);
                assert_eq!(20, r.max_vus);
                assert_eq!(OverflowPolicy::Queue { capacity: 10 }, r.overflow);
            }
            other => panic!("Unexpected executor {other:?}"),
        }

        let thresholds: Vec<ThresholdConfig> =
            config.thresholds.into_iter().map(Into::into).collect();
        assert_eq!("http_req_failed", thresholds[0].metric);
        assert!(thresholds[1].abort_on_fail);
        assert_eq!(Some(Duration::from_secs(10)), thresholds[1].delay_abort_eval);
    }

    #[test]
    fn inline_and_table_thresholds_mix() {
        let input = r#"
thresholds = [
    "http_req_duration{group:::login}: p(95)<500, avg<200",
    { metric = "http_req_failed", expressions = ["rate<0.01"], abortOnFail = true },
]
"#;
        let config = RunConfig::from_toml_str(input).unwrap();
        let thresholds: Vec<ThresholdConfig> =
            config.thresholds.into_iter().map(Into::into).collect();

        assert_eq!(
            vec![
                ThresholdConfig::new("http_req_duration{group:::login}", ["p(95)<500", "avg<200"]),
                ThresholdConfig::new("http_req_failed", ["rate<0.01"]).abort_on_fail(None),
            ],
            thresholds
        );
    }

    #[test]
    fn malformed_inline_threshold_is_rejected() {
        let input = r#"thresholds = ["http_req_failed rate<0.01"]"#;
        let err = RunConfig::from_toml_str(input).unwrap_err();
        assert!(
            err.to_string().contains("expected `metric: expression`"),
            "{err}"
        );
    }

    #[test]
    fn unknown_executor() {
        let config = ScenarioConfig {
            executor: "shared-iterations".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::UnknownExecutor { .. })
        ));
    }

    #[test]
    fn missing_and_unexpected_parameters() {
        let mut config = ScenarioConfig::constant_vus(5, Duration::from_secs(10));
        config.duration = None;
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::MissingParameter {
                parameter: "duration",
                ..
            })
        ));

        let mut config = ScenarioConfig::constant_vus(5, Duration::from_secs(10));
        config.iterations = Some(3);
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::UnexpectedParameter {
                parameter: "iterations",
                ..
            })
        ));
    }

    #[test]
    fn empty_stages_are_rejected() {
        let config = ScenarioConfig::ramping_vus(0, vec![]);
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::EmptyStages { .. })
        ));
    }

    #[test]
    fn arrival_rate_pool_limits() {
        let stages = vec![Stage::new(Duration::from_secs(10), 10.0)];
        let config =
            ScenarioConfig::ramping_arrival_rate(0.0, Duration::from_secs(1), stages.clone(), 10, 5);
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::MaxVusBelowPreAllocated { .. })
        ));

        let config = ScenarioConfig::ramping_arrival_rate(0.0, Duration::ZERO, stages, 1, 5);
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::InvalidParameter {
                parameter: "timeUnit",
                ..
            })
        ));
    }

    #[test]
    fn stage_targets_must_be_bounded() {
        for target in [f64::INFINITY, f64::NAN, -1.0, MAX_STAGE_TARGET * 2.0] {
            let stages = vec![Stage::new(Duration::from_secs(10), target)];
            let config = ScenarioConfig::ramping_vus(0, stages.clone());
            assert!(
                matches!(
                    config.validate("s"),
                    Err(ConfigError::InvalidParameter {
                        parameter: "stages",
                        ..
                    })
                ),
                "ramping-vus accepted target {target}"
            );

            let config =
                ScenarioConfig::ramping_arrival_rate(0.0, Duration::from_secs(1), stages, 1, 5);
            assert!(
                matches!(
                    config.validate("s"),
                    Err(ConfigError::InvalidParameter {
                        parameter: "stages",
                        ..
                    })
                ),
                "ramping-arrival-rate accepted target {target}"
            );
        }

        let stages = vec![Stage::new(Duration::from_secs(10), MAX_STAGE_TARGET)];
        assert!(ScenarioConfig::ramping_vus(0, stages).validate("s").is_ok());
    }

    #[test]
    fn zero_iterations_are_rejected() {
        let config = ScenarioConfig::per_vu_iterations(1, 0);
        assert!(matches!(
            config.validate("s"),
            Err(ConfigError::InvalidParameter {
                parameter: "iterations",
                ..
            })
        ));

        // Would truncate to zero on 32-bit targets if narrowed to usize
        let config = ScenarioConfig::per_vu_iterations(1, 1 << 32);
        assert!(config.validate("s").is_ok());
    }

    #[test]
    fn exec_must_exist() {
        let scenarios = BTreeMap::from([(
            "s".to_string(),
            ScenarioConfig::per_vu_iterations(1, 1).with_exec("missing"),
        )]);
        assert!(matches!(
            validate_scenarios(&scenarios, &execs(&["default"])),
            Err(ConfigError::UnknownExec { .. })
        ));
    }

    #[test]
    fn duplicate_scenarios_are_rejected() {
        let a = "a".to_string();
        let config = ScenarioConfig::per_vu_iterations(1, 1);
        let scenarios = vec![(&a, &config), (&a, &config)];
        assert!(matches!(
            validate_scenarios(scenarios, &execs(&["default"])),
            Err(ConfigError::DuplicateScenario(_))
        ));
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let input = r#"
[scenarios.s]
executor = "constant-vus"
vus = 1
duration = "1s"
rampUp = "1s"
"#;
        assert!(matches!(
            RunConfig::from_toml_str(input),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn no_scenarios_is_an_error() {
        let scenarios: BTreeMap<String, ScenarioConfig> = BTreeMap::new();
        assert!(matches!(
            validate_scenarios(&scenarios, &execs(&["default"])),
            Err(ConfigError::NoScenarios)
        ));
    }
}
