use std::time::Duration;

use hdrhistogram::Histogram;

use crate::aggregation::Aggregation;
use crate::metrics::{MetricKind, MetricsError};

/// Trend samples are stored in the histogram as integers with this many steps per unit. For
/// durations recorded in milliseconds this keeps microsecond resolution.
const TREND_SCALE: f64 = 1000.0;

/// Significant figures kept by the trend histogram. Three gives a worst case relative error of
/// 0.1% on any percentile, at a fixed memory cost that doesn't depend on the number of samples.
const TREND_SIGFIG: u8 = 3;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterValue {
    pub sum: f64,
    pub samples: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateValue {
    pub trues: u64,
    pub total: u64,
}

impl RateValue {
    pub fn rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.trues as f64 / self.total as f64
        }
    }
}

/// Streaming summary of a distribution.
///
/// Count, sum, min and max are exact. Percentiles come from auto-resizing HDR histograms whose
/// size depends on the range of values seen, not on how many were recorded. HDR histograms only
/// hold non-negative integers, so negative samples are recorded by magnitude in a second one.
#[derive(Debug, Clone)]
pub struct TrendValue {
    positive: Histogram<u64>,
    negative: Histogram<u64>,
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl TrendValue {
    fn new() -> Result<Self, MetricsError> {
        let histogram = || {
            Histogram::<u64>::new(TREND_SIGFIG)
                .map_err(|e| MetricsError::Histogram(format!("{e:?}")))
        };
        Ok(Self {
            positive: histogram()?,
            negative: histogram()?,
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        })
    }

    fn add(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);

        let histogram = if value < 0.0 {
            &mut self.negative
        } else {
            &mut self.positive
        };
        let scaled = (value.abs() * TREND_SCALE).round() as u64;
        if let Err(e) = histogram.record(scaled) {
            log::warn!("Trend sample {value} out of histogram range, saturating: {e:?}");
            histogram.saturating_record(scaled);
        }
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn avg(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    pub fn min(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.min
        }
    }

    pub fn max(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.max
        }
    }

    pub fn med(&self) -> f64 {
        self.percentile(50.0)
    }

    /// The value at the given percentile, clamped into `[min, max]` so that the histogram's
    /// bucket rounding can never put a percentile outside the range of recorded samples.
    pub fn percentile(&self, percentile: f64) -> f64 {
        if self.count == 0 {
            return 0.0;
        }
        let quantile = (percentile / 100.0).clamp(0.0, 1.0);
        let rank = ((quantile * self.count as f64).ceil() as u64).clamp(1, self.count);

        // Negatives sort before every non-negative sample, largest magnitude first. Both sides
        // round towards positive infinity within a bucket.
        let negatives = self.negative.len();
        let value = if rank <= negatives {
            let magnitude = value_at_rank(&self.negative, negatives - rank + 1);
            -(self.negative.lowest_equivalent(magnitude) as f64)
        } else {
            let value = value_at_rank(&self.positive, rank - negatives);
            self.positive.highest_equivalent(value) as f64
        };
        (value / TREND_SCALE).clamp(self.min, self.max)
    }
}

/// The `rank`th smallest recorded value, counting from 1.
fn value_at_rank(histogram: &Histogram<u64>, rank: u64) -> u64 {
    let mut seen = 0;
    for bucket in histogram.iter_recorded() {
        seen += bucket.count_at_value();
        if seen >= rank {
            return bucket.value_iterated_to();
        }
    }
    histogram.max()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GaugeValue {
    pub value: f64,
    pub min: f64,
    pub max: f64,
    pub writes: u64,
}

/// The accumulated state of one metric.
#[derive(Debug, Clone)]
pub enum MetricValue {
    Counter(CounterValue),
    Rate(RateValue),
    Trend(TrendValue),
    Gauge(GaugeValue),
}

impl MetricValue {
    pub(crate) fn new(kind: MetricKind) -> Result<Self, MetricsError> {
        Ok(match kind {
            MetricKind::Counter => MetricValue::Counter(CounterValue::default()),
            MetricKind::Rate => MetricValue::Rate(RateValue::default()),
            MetricKind::Trend => MetricValue::Trend(TrendValue::new()?),
            MetricKind::Gauge => MetricValue::Gauge(GaugeValue::default()),
        })
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            MetricValue::Counter(_) => MetricKind::Counter,
            MetricValue::Rate(_) => MetricKind::Rate,
            MetricValue::Trend(_) => MetricKind::Trend,
            MetricValue::Gauge(_) => MetricKind::Gauge,
        }
    }

    /// Check a contribution before any accumulator is touched, so that a rejected sample is
    /// rejected everywhere rather than half applied.
    pub(crate) fn validate(kind: MetricKind, name: &str, value: f64) -> Result<(), MetricsError> {
        let invalid = |reason: &str| MetricsError::InvalidValue {
            name: name.to_string(),
            value,
            reason: reason.to_string(),
        };

        if !value.is_finite() {
            return Err(invalid("value must be finite"));
        }
        if kind == MetricKind::Counter && value < 0.0 {
            return Err(invalid("counters only accept non-negative contributions"));
        }

        Ok(())
    }

    pub(crate) fn add(&mut self, value: f64) {
        match self {
            MetricValue::Counter(c) => {
                c.sum += value;
                c.samples += 1;
            }
            MetricValue::Rate(r) => {
                if value != 0.0 {
                    r.trues += 1;
                }
                r.total += 1;
            }
            MetricValue::Trend(t) => t.add(value),
            MetricValue::Gauge(g) => {
                if g.writes == 0 {
                    g.min = value;
                    g.max = value;
                } else {
                    g.min = g.min.min(value);
                    g.max = g.max.max(value);
                }
                g.value = value;
                g.writes += 1;
            }
        }
    }

    /// Read a statistic from this metric. Returns `None` when the statistic doesn't apply to this
    /// kind of metric.
    ///
    /// `elapsed` is the run time used to turn a counter into a per-second rate.
    pub fn aggregate(&self, aggregation: &Aggregation, elapsed: Duration) -> Option<f64> {
        if !aggregation.valid_for(self.kind()) {
            return None;
        }

        let value = match (self, aggregation) {
            (MetricValue::Counter(c), Aggregation::Count) => c.sum,
            (MetricValue::Counter(c), Aggregation::Rate) => {
                let secs = elapsed.as_secs_f64();
                if secs > 0.0 {
                    c.sum / secs
                } else {
                    0.0
                }
            }
            (MetricValue::Rate(r), Aggregation::Rate) => r.rate(),
            (MetricValue::Gauge(g), Aggregation::Value) => g.value,
            (MetricValue::Gauge(g), Aggregation::Min) => g.min,
            (MetricValue::Gauge(g), Aggregation::Max) => g.max,
            (MetricValue::Trend(t), Aggregation::Count) => t.count() as f64,
            (MetricValue::Trend(t), Aggregation::Avg) => t.avg(),
            (MetricValue::Trend(t), Aggregation::Min) => t.min(),
            (MetricValue::Trend(t), Aggregation::Max) => t.max(),
            (MetricValue::Trend(t), Aggregation::Med) => t.med(),
            (MetricValue::Trend(t), Aggregation::Percentile(p)) => t.percentile(*p),
            _ => return None,
        };

        Some(value)
    }
}
