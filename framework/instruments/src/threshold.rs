mod expression;

use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::time::Duration;

use squall_summary_model::ThresholdVerdict;

use crate::aggregation::Aggregation;
use crate::metrics::{MetricKind, MetricRef, MetricsError, MetricsRegistry};

pub use expression::{Comparator, ThresholdExpression};

#[derive(Debug, thiserror::Error)]
pub enum ThresholdError {
    #[error("Invalid threshold expression `{expression}`: {reason}")]
    Parse { expression: String, reason: String },
    #[error("Threshold references unknown metric `{0}`")]
    UnknownMetric(String),
    #[error("Aggregation `{aggregation}` cannot be used with {kind} metric `{metric}`")]
    InvalidAggregation {
        metric: String,
        aggregation: Aggregation,
        kind: MetricKind,
    },
    #[error(transparent)]
    Metrics(#[from] MetricsError),
}

/// A threshold as declared by a test definition or a configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdConfig {
    /// Metric name, optionally with a tag selector, e.g. `http_req_duration{name:home}`
    pub metric: String,
    pub expressions: Vec<String>,
    /// Stop the whole run as soon as this threshold fails at a checkpoint
    pub abort_on_fail: bool,
    /// Don't abort before this much of the run has elapsed, so that a metric has time to settle
    pub delay_abort_eval: Option<Duration>,
}

impl ThresholdConfig {
    pub fn new<I, S>(metric: impl Into<String>, expressions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            metric: metric.into(),
            expressions: expressions.into_iter().map(Into::into).collect(),
            abort_on_fail: false,
            delay_abort_eval: None,
        }
    }

    pub fn abort_on_fail(mut self, delay: Option<Duration>) -> Self {
        self.abort_on_fail = true;
        self.delay_abort_eval = delay;
        self
    }
}

/// Parses the inline form `metric{selector}: expression, expression`.
///
/// The selector may itself contain colons, so the separator is the first colon after the closing
/// brace. Every expression is checked here so that a malformed line is reported with its source.
impl FromStr for ThresholdConfig {
    type Err = ThresholdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let source = s.trim();
        let err = |reason: &str| ThresholdError::Parse {
            expression: source.to_string(),
            reason: reason.to_string(),
        };

        let search_from = match source.find('{') {
            Some(open) => source[open..]
                .find('}')
                .map(|close| open + close)
                .ok_or_else(|| err("unterminated tag selector"))?,
            None => 0,
        };
        let (metric, expressions) = source[search_from..]
            .find(':')
            .map(|at| source.split_at(search_from + at))
            .ok_or_else(|| err("expected `metric: expression`"))?;

        let metric = metric.trim();
        if metric.is_empty() {
            return Err(err("missing metric name"));
        }

        let expressions = expressions[1..]
            .split(',')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(|e| e.parse::<ThresholdExpression>().map(|_| e.to_string()))
            .collect::<Result<Vec<_>, _>>()?;
        if expressions.is_empty() {
            return Err(err("no expressions"));
        }

        Ok(Self::new(metric, expressions))
    }
}

impl Display for ThresholdConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.metric, self.expressions.join(", "))
    }
}

#[derive(Debug)]
struct Threshold {
    metric: MetricRef,
    expressions: Vec<ThresholdExpression>,
    abort_on_fail: bool,
    delay_abort_eval: Duration,
}

/// Turns aggregated metrics into pass or fail verdicts.
///
/// Expressions are parsed up front by [ThresholdEvaluator::new] and checked against the registry
/// by [ThresholdEvaluator::validate], so that a typo is reported before any VU starts rather than
/// at the end of the run.
#[derive(Debug, Default)]
pub struct ThresholdEvaluator {
    thresholds: Vec<Threshold>,
}

impl ThresholdEvaluator {
    pub fn new(configs: &[ThresholdConfig]) -> Result<Self, ThresholdError> {
        let thresholds = configs
            .iter()
            .map(|config| -> Result<Threshold, ThresholdError> {
                let metric = MetricRef::parse(&config.metric)?;
                let expressions = config
                    .expressions
                    .iter()
                    .map(|e| e.parse::<ThresholdExpression>())
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Threshold {
                    metric,
                    expressions,
                    abort_on_fail: config.abort_on_fail,
                    delay_abort_eval: config.delay_abort_eval.unwrap_or_default(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { thresholds })
    }

    pub fn is_empty(&self) -> bool {
        self.thresholds.is_empty()
    }

    /// Whether any threshold could stop the run early, which is what makes checkpoints worthwhile.
    pub fn has_abort_on_fail(&self) -> bool {
        self.thresholds.iter().any(|t| t.abort_on_fail)
    }

    /// Check that every referenced metric exists with a kind that supports the requested
    /// aggregations, and start tracking any sub-metrics.
    pub fn validate(&self, registry: &MetricsRegistry) -> Result<(), ThresholdError> {
        for threshold in &self.thresholds {
            let kind = registry
                .kind(&threshold.metric.name)
                .ok_or_else(|| ThresholdError::UnknownMetric(threshold.metric.to_string()))?;

            for expression in &threshold.expressions {
                if !expression.aggregation.valid_for(kind) {
                    return Err(ThresholdError::InvalidAggregation {
                        metric: threshold.metric.to_string(),
                        aggregation: expression.aggregation,
                        kind,
                    });
                }
            }

            registry.add_submetric(&threshold.metric)?;
        }

        Ok(())
    }

    /// Evaluate every expression against the current state of the registry.
    ///
    /// Verdicts are returned in declaration order. A metric that has disappeared or was never
    /// registered is an error, never a pass.
    pub fn evaluate(
        &self,
        registry: &MetricsRegistry,
        elapsed: Duration,
    ) -> Result<Vec<ThresholdVerdict>, ThresholdError> {
        let mut verdicts = Vec::with_capacity(self.thresholds.len());
        for threshold in &self.thresholds {
            let value = registry
                .value(&threshold.metric)
                .ok_or_else(|| ThresholdError::UnknownMetric(threshold.metric.to_string()))?;

            for expression in &threshold.expressions {
                let observed = value.aggregate(&expression.aggregation, elapsed).ok_or_else(|| {
                    ThresholdError::InvalidAggregation {
                        metric: threshold.metric.to_string(),
                        aggregation: expression.aggregation,
                        kind: value.kind(),
                    }
                })?;

                verdicts.push(ThresholdVerdict {
                    metric: threshold.metric.to_string(),
                    expression: expression.source().to_string(),
                    observed,
                    passed: expression.holds(observed),
                    abort_on_fail: threshold.abort_on_fail,
                });
            }
        }

        Ok(verdicts)
    }

    /// The first failed verdict that should stop the run, if any.
    ///
    /// `verdicts` must come from [ThresholdEvaluator::evaluate] on this evaluator.
    pub fn should_abort<'a>(
        &self,
        verdicts: &'a [ThresholdVerdict],
        elapsed: Duration,
    ) -> Option<&'a ThresholdVerdict> {
        let mut verdicts = verdicts.iter();
        for threshold in &self.thresholds {
            for _ in &threshold.expressions {
                let verdict = verdicts.next()?;
                if threshold.abort_on_fail
                    && !verdict.passed
                    && elapsed >= threshold.delay_abort_eval
                {
                    return Some(verdict);
                }
            }
        }
        None
    }
}
