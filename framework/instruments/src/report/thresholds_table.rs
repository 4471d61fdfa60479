use squall_summary_model::ThresholdVerdict;
use tabled::Tabled;

use crate::report::metrics_table::float2;

#[derive(Tabled)]
pub struct ThresholdRow {
    pub metric: String,
    pub expression: String,
    #[tabled(display = "float2")]
    pub observed: f64,
    pub result: &'static str,
    pub abort_on_fail: bool,
}

impl From<&ThresholdVerdict> for ThresholdRow {
    fn from(verdict: &ThresholdVerdict) -> Self {
        Self {
            metric: verdict.metric.clone(),
            expression: verdict.expression.clone(),
            observed: verdict.observed,
            result: if verdict.passed { "pass" } else { "FAIL" },
            abort_on_fail: verdict.abort_on_fail,
        }
    }
}
