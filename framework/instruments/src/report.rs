mod metrics_table;
mod thresholds_table;

use std::collections::BTreeMap;
use std::time::Duration;

use squall_summary_model::{MetricSummary, RunSummary};
use tabled::settings::Style;
use tabled::Table;

use crate::aggregation::Aggregation;
use crate::metrics::{MetricValue, MetricsError, MetricsRegistry};
use crate::report::metrics_table::MetricRow;
use crate::report::thresholds_table::ThresholdRow;

/// Builds the final metric values for a [RunSummary] and prints the summary at the end of a run.
pub struct SummaryReporter {
    trend_stats: Vec<Aggregation>,
}

impl Default for SummaryReporter {
    fn default() -> Self {
        Self::new(Aggregation::default_trend_stats())
    }
}

impl SummaryReporter {
    /// `trend_stats` are the statistics reported for every Trend. An empty list falls back to the
    /// defaults.
    pub fn new(trend_stats: Vec<Aggregation>) -> Self {
        let trend_stats = if trend_stats.is_empty() {
            Aggregation::default_trend_stats()
        } else {
            trend_stats
        };
        Self { trend_stats }
    }

    /// Final value of every metric in the registry, sorted by name.
    ///
    /// The registry has to be frozen first so that the summary can't change after it was read.
    pub fn summarise_metrics(
        &self,
        registry: &MetricsRegistry,
        elapsed: Duration,
    ) -> Result<BTreeMap<String, MetricSummary>, MetricsError> {
        if !registry.is_frozen() {
            return Err(MetricsError::NotFrozen);
        }

        Ok(registry
            .snapshot()
            .into_iter()
            .map(|(name, value)| (name, self.summarise(&value, elapsed)))
            .collect())
    }

    fn summarise(&self, value: &MetricValue, elapsed: Duration) -> MetricSummary {
        let read = |aggregation: Aggregation| value.aggregate(&aggregation, elapsed).unwrap_or(0.0);

        match value {
            MetricValue::Counter(_) => MetricSummary::Counter {
                count: read(Aggregation::Count),
                rate: read(Aggregation::Rate),
            },
            MetricValue::Rate(r) => MetricSummary::Rate {
                rate: r.rate(),
                passes: r.trues,
                fails: r.total - r.trues,
            },
            MetricValue::Trend(t) => MetricSummary::Trend {
                count: t.count(),
                values: self
                    .trend_stats
                    .iter()
                    .filter_map(|stat| {
                        value
                            .aggregate(stat, elapsed)
                            .map(|v| (stat.to_string(), v))
                    })
                    .collect(),
            },
            MetricValue::Gauge(g) => MetricSummary::Gauge {
                value: g.value,
                min: g.min,
                max: g.max,
            },
        }
    }

    /// Print the run summary to stdout.
    pub fn print(&self, summary: &RunSummary) {
        println!("\nRun {} ({})", summary.run_id, summary.name);
        for (scenario, executor) in &summary.scenarios {
            println!("  scenario {scenario}: {executor}");
        }
        println!(
            "  duration {:.2}s, {} iterations, {} aborted, {} dropped, {} VUs spawned, {} max",
            summary.run_duration_ms as f64 / 1000.0,
            summary.total_iterations,
            summary.aborted_iterations,
            summary.dropped_iterations,
            summary.vus_spawned,
            summary.vus_max,
        );
        if summary.aborted_by_threshold {
            println!("  run was stopped early by a failing threshold");
        }

        println!("\nMetrics");
        let rows = summary
            .metrics
            .iter()
            .map(|(name, metric)| MetricRow::new(name, metric))
            .collect::<Vec<_>>();
        let mut table = Table::new(rows);
        table.with(Style::modern());
        println!("{table}");

        if summary.thresholds.is_empty() {
            return;
        }

        println!("\nThresholds");
        let rows = summary
            .thresholds
            .iter()
            .map(ThresholdRow::from)
            .collect::<Vec<_>>();
        let mut table = Table::new(rows);
        table.with(Style::modern());
        println!("{table}");
    }
}
