use serde::{Deserialize, Serialize};
use sha3::Digest;
use std::collections::BTreeMap;
use std::io::{BufRead, Read, Write};
use std::path::PathBuf;

/// Summary of a run
///
/// Produced once per run, after every VU has stopped and the metrics registry has been frozen.
/// Nothing in here changes after it has been built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSummary {
    /// The unique run id
    ///
    /// Chosen by the runner. Unique for each run.
    pub run_id: String,
    /// The name of the test definition that was run
    pub name: String,
    /// The scenarios that were run, keyed by scenario name, with a short description of the
    /// executor that drove each one.
    pub scenarios: BTreeMap<String, String>,
    /// The time the run started
    ///
    /// This is a Unix timestamp in seconds.
    pub started_at: i64,
    /// The time the run finished, after drain and teardown
    ///
    /// This is a Unix timestamp in seconds.
    pub ended_at: i64,
    /// Wall clock time between the first VU starting and the last VU stopping, in milliseconds
    pub run_duration_ms: u64,
    /// Iterations that ran to completion, whether they succeeded or not
    pub total_iterations: u64,
    /// Iterations that were interrupted by the hard stop at the end of the graceful stop period
    pub aborted_iterations: u64,
    /// Arrival-rate tickets that could not be served because no VU was free
    pub dropped_iterations: u64,
    /// Total number of VUs spawned over the whole run
    pub vus_spawned: u64,
    /// Highest number of VUs that were alive at the same time
    pub vus_max: u64,
    /// Set when a threshold configured with `abortOnFail` ended the run early
    pub aborted_by_threshold: bool,
    /// Final values for every metric, keyed by metric name
    ///
    /// Sub-metrics appear under their full selector name, for example
    /// `http_req_duration{name:home_page}`.
    pub metrics: BTreeMap<String, MetricSummary>,
    /// Threshold verdicts, in the order the thresholds were declared
    pub thresholds: Vec<ThresholdVerdict>,
    /// Environment variables set for the run
    ///
    /// This won't capture all environment variables. Just the ones that the runner is aware of or
    /// that are included by the scenario itself.
    pub env: BTreeMap<String, String>,
    /// The version of Squall that was used for this run
    pub squall_version: String,
    /// Identifies the resolved configuration of the run, see [RunSummary::compute_fingerprint]
    ///
    /// Two runs with the same fingerprint were configured identically and can be compared.
    #[serde(default)]
    pub fingerprint: String,
}

/// The final value of a single metric.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetricSummary {
    Counter {
        count: f64,
        /// Count per second of run time
        rate: f64,
    },
    Rate {
        rate: f64,
        passes: u64,
        fails: u64,
    },
    Trend {
        count: u64,
        /// The requested summary statistics, keyed by name, e.g. `avg`, `p(95)`
        values: BTreeMap<String, f64>,
    },
    Gauge {
        value: f64,
        min: f64,
        max: f64,
    },
}

/// The outcome of evaluating one threshold expression.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ThresholdVerdict {
    /// The metric reference, including any tag selector
    pub metric: String,
    /// The expression as written, e.g. `p(95)<500`
    pub expression: String,
    /// The aggregated value the expression was compared against
    pub observed: f64,
    pub passed: bool,
    pub abort_on_fail: bool,
}

impl RunSummary {
    /// Create a new run summary with empty results
    pub fn new(
        run_id: String,
        name: String,
        scenarios: BTreeMap<String, String>,
        started_at: i64,
        squall_version: String,
    ) -> Self {
        Self {
            run_id,
            name,
            scenarios,
            started_at,
            ended_at: started_at,
            run_duration_ms: 0,
            total_iterations: 0,
            aborted_iterations: 0,
            dropped_iterations: 0,
            vus_spawned: 0,
            vus_max: 0,
            aborted_by_threshold: false,
            metrics: BTreeMap::new(),
            thresholds: Vec::new(),
            env: BTreeMap::new(),
            squall_version,
            fingerprint: String::new(),
        }
    }

    /// Add an environment variable
    pub fn add_env(&mut self, key: String, value: String) {
        self.env.insert(key, value);
    }

    /// True when every threshold passed. A run without thresholds passes.
    pub fn thresholds_passed(&self) -> bool {
        self.thresholds.iter().all(|t| t.passed)
    }

    /// Thresholds that did not pass
    pub fn failed_thresholds(&self) -> impl Iterator<Item = &ThresholdVerdict> {
        self.thresholds.iter().filter(|t| !t.passed)
    }

    /// Compute a fingerprint for this run summary
    ///
    /// The fingerprint is intended to uniquely identify the configuration used for the run. It uses
    /// the
    ///     - Definition name
    ///     - Scenarios and their executors
    ///     - The resolved configuration, one entry per scenario, threshold and setting
    ///     - Selected environment variables
    ///     - Squall version
    ///
    /// Results and the run id are not included. The fingerprint is computed using
    /// [sha3::Sha3_256].
    pub fn compute_fingerprint(&self, resolved_config: &[String]) -> String {
        let mut hasher = sha3::Sha3_256::new();
        Digest::update(&mut hasher, self.name.as_bytes());
        // BTreeMap iteration is already ordered
        self.scenarios.iter().for_each(|(k, v)| {
            Digest::update(&mut hasher, k.as_bytes());
            Digest::update(&mut hasher, v.as_bytes());
        });
        resolved_config.iter().for_each(|line| {
            Digest::update(&mut hasher, line.as_bytes());
            Digest::update(&mut hasher, [0u8]);
        });
        self.env.iter().for_each(|(k, v)| {
            Digest::update(&mut hasher, k.as_bytes());
            Digest::update(&mut hasher, v.as_bytes());
        });
        Digest::update(&mut hasher, self.squall_version.as_bytes());

        format!("{:x}", hasher.finalize())
    }
}

/// Append the run summary to a file
///
/// The summary will be serialized to JSON and output as a single line followed by a newline. The
/// recommended file extension is `.jsonl`.
pub fn append_run_summary(run_summary: &RunSummary, path: PathBuf) -> anyhow::Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)?;
    store_run_summary(run_summary, &mut file)?;
    file.write_all("\n".as_bytes())?;
    Ok(())
}

/// Write the run summary to a file as a single pretty-printed JSON document, replacing any
/// existing content.
pub fn export_run_summary(run_summary: &RunSummary, path: PathBuf) -> anyhow::Result<()> {
    let file = std::fs::File::create(path)?;
    serde_json::to_writer_pretty(file, run_summary)?;
    Ok(())
}

/// Serialize the run summary to a writer
pub fn store_run_summary<W: Write>(run_summary: &RunSummary, writer: &mut W) -> anyhow::Result<()> {
    serde_json::to_writer(writer, run_summary)?;
    Ok(())
}

/// Load a run summary from a reader
pub fn load_run_summary<R: Read>(reader: R) -> anyhow::Result<RunSummary> {
    let reader = std::io::BufReader::new(reader);
    let run_summary: RunSummary = serde_json::from_reader(reader)?;
    Ok(run_summary)
}

/// Load run summaries from a file
///
/// The file should contain one JSON object per line. This is the format produced by
/// [append_run_summary].
pub fn load_summary_runs(path: PathBuf) -> anyhow::Result<Vec<RunSummary>> {
    let file = std::fs::File::open(path)?;
    let reader = std::io::BufReader::new(file);
    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let run: RunSummary = serde_json::from_str(&line)?;
        runs.push(run);
    }
    Ok(runs)
}
