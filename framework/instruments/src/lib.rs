mod aggregation;
pub mod builtin;
mod metrics;
mod report;
mod threshold;

pub use aggregation::{Aggregation, ParseAggregationError};
pub use metrics::{
    Counter, CounterValue, Gauge, GaugeValue, MetricKind, MetricRef, MetricValue, MetricsError,
    MetricsRegistry, Rate, RateValue, TagSelector, Tags, Trend, TrendValue,
};
pub use report::SummaryReporter;
pub use threshold::{
    Comparator, ThresholdConfig, ThresholdError, ThresholdEvaluator, ThresholdExpression,
};

pub mod prelude {
    pub use crate::builtin;
    pub use crate::{
        Aggregation, Counter, Gauge, MetricKind, MetricRef, MetricsError, MetricsRegistry, Rate,
        SummaryReporter, Tags, ThresholdConfig, ThresholdError, ThresholdEvaluator, Trend,
    };
}
