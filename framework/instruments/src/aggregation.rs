use std::fmt::{Display, Formatter};
use std::str::FromStr;

use crate::metrics::MetricKind;

/// A statistic that can be read from an aggregated metric.
///
/// The string form is the one used in threshold expressions and in the summary, e.g. `p(95)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Aggregation {
    Count,
    Rate,
    Value,
    Avg,
    Min,
    Max,
    Med,
    /// A percentile in the range `[0, 100]`
    Percentile(f64),
}

impl Aggregation {
    /// Whether this statistic can be read from a metric of the given kind.
    pub fn valid_for(&self, kind: MetricKind) -> bool {
        match kind {
            MetricKind::Counter => matches!(self, Aggregation::Count | Aggregation::Rate),
            MetricKind::Rate => matches!(self, Aggregation::Rate),
            MetricKind::Gauge => matches!(
                self,
                Aggregation::Value | Aggregation::Min | Aggregation::Max
            ),
            MetricKind::Trend => matches!(
                self,
                Aggregation::Count
                    | Aggregation::Avg
                    | Aggregation::Min
                    | Aggregation::Max
                    | Aggregation::Med
                    | Aggregation::Percentile(_)
            ),
        }
    }

    /// The statistics shown in the summary for a Trend when nothing else has been configured.
    pub fn default_trend_stats() -> Vec<Aggregation> {
        vec![
            Aggregation::Avg,
            Aggregation::Min,
            Aggregation::Med,
            Aggregation::Max,
            Aggregation::Percentile(90.0),
            Aggregation::Percentile(95.0),
        ]
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid aggregation `{input}`: {reason}")]
pub struct ParseAggregationError {
    pub input: String,
    pub reason: String,
}

impl FromStr for Aggregation {
    type Err = ParseAggregationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let err = |reason: &str| ParseAggregationError {
            input: s.to_string(),
            reason: reason.to_string(),
        };

        match s {
            "count" => return Ok(Aggregation::Count),
            "rate" => return Ok(Aggregation::Rate),
            "value" => return Ok(Aggregation::Value),
            "avg" => return Ok(Aggregation::Avg),
            "min" => return Ok(Aggregation::Min),
            "max" => return Ok(Aggregation::Max),
            "med" => return Ok(Aggregation::Med),
            _ => {}
        }

        // Both `p(95)` and `p95` are accepted
        let percentile = if let Some(inner) = s.strip_prefix("p(") {
            inner
                .strip_suffix(')')
                .ok_or_else(|| err("missing closing parenthesis"))?
        } else if let Some(inner) = s.strip_prefix('p') {
            inner
        } else {
            return Err(err("unknown aggregation"));
        };

        let percentile = percentile
            .trim()
            .parse::<f64>()
            .map_err(|_| err("percentile is not a number"))?;
        if !(0.0..=100.0).contains(&percentile) {
            return Err(err("percentile must be between 0 and 100"));
        }

        Ok(Aggregation::Percentile(percentile))
    }
}

impl Display for Aggregation {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Aggregation::Count => write!(f, "count"),
            Aggregation::Rate => write!(f, "rate"),
            Aggregation::Value => write!(f, "value"),
            Aggregation::Avg => write!(f, "avg"),
            Aggregation::Min => write!(f, "min"),
            Aggregation::Max => write!(f, "max"),
            Aggregation::Med => write!(f, "med"),
            Aggregation::Percentile(p) => write!(f, "p({p})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_percentiles() {
        assert_eq!(Aggregation::Percentile(95.0), "p(95)".parse().unwrap());
        assert_eq!(Aggregation::Percentile(99.9), "p(99.9)".parse().unwrap());
        assert_eq!(Aggregation::Percentile(90.0), "p90".parse().unwrap());
        assert!("p(101)".parse::<Aggregation>().is_err());
        assert!("p(95".parse::<Aggregation>().is_err());
        assert!("median".parse::<Aggregation>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for agg in Aggregation::default_trend_stats() {
            assert_eq!(agg, agg.to_string().parse().unwrap());
        }
    }

    #[test]
    fn validity_per_kind() {
        assert!(Aggregation::Rate.valid_for(MetricKind::Rate));
        assert!(Aggregation::Rate.valid_for(MetricKind::Counter));
        assert!(!Aggregation::Avg.valid_for(MetricKind::Rate));
        assert!(!Aggregation::Percentile(95.0).valid_for(MetricKind::Gauge));
        assert!(Aggregation::Percentile(95.0).valid_for(MetricKind::Trend));
        assert!(Aggregation::Value.valid_for(MetricKind::Gauge));
    }
}
