use squall_summary_model::MetricSummary;
use tabled::Tabled;

#[derive(Tabled)]
pub struct MetricRow {
    pub metric: String,
    #[tabled(rename = "type")]
    pub kind: &'static str,
    pub values: String,
}

impl MetricRow {
    pub fn new(metric: &str, summary: &MetricSummary) -> Self {
        let (kind, values) = match summary {
            MetricSummary::Counter { count, rate } => {
                ("counter", format!("{} ({}/s)", float2(count), float2(rate)))
            }
            MetricSummary::Rate {
                rate,
                passes,
                fails,
            } => (
                "rate",
                format!("{:.2}% ({passes} of {})", rate * 100.0, passes + fails),
            ),
            MetricSummary::Trend { values, .. } => (
                "trend",
                values
                    .iter()
                    .map(|(stat, v)| format!("{stat}={}", float2(v)))
                    .collect::<Vec<_>>()
                    .join(" "),
            ),
            MetricSummary::Gauge { value, min, max } => (
                "gauge",
                format!("{} min={} max={}", float2(value), float2(min), float2(max)),
            ),
        };

        Self {
            metric: metric.to_string(),
            kind,
            values,
        }
    }
}

pub(crate) fn float2(n: &f64) -> String {
    format!("{:.2}", n)
}
