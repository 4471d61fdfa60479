use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None)]
pub struct SquallCli {
    /// A TOML run configuration. Scenarios declared in the file replace the ones declared in
    /// code, thresholds are added to them.
    #[clap(short, long)]
    pub config: Option<PathBuf>,

    /// Run a single constant-vus scenario with this many VUs, replacing any configured scenarios.
    ///
    /// Defaults to 1 VU when only `--duration` is given.
    #[clap(long)]
    pub vus: Option<usize>,

    /// Run a single constant-vus scenario for this long, e.g. `30s` or `5m`, replacing any
    /// configured scenarios.
    ///
    /// Defaults to 10s when only `--vus` is given.
    #[clap(long, value_parser = humantime::parse_duration)]
    pub duration: Option<Duration>,

    /// Do not show a progress bar on the CLI.
    ///
    /// This is recommended for CI/CD environments where the progress bar isn't being looked at by anyone and is just adding noise to the logs.
    #[clap(long, default_value = "false")]
    pub no_progress: bool,

    /// Write the run summary as JSON to this path. A path ending in `.jsonl` is appended to as
    /// JSON lines instead of being overwritten.
    #[clap(long)]
    pub summary_export: Option<PathBuf>,

    /// Use this run id instead of a generated one.
    #[clap(long)]
    pub run_id: Option<String>,

    /// Skip threshold evaluation. The run always exits with success unless it fails to start.
    #[clap(long, default_value = "false")]
    pub no_thresholds: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_overrides() {
        let cli = SquallCli::parse_from([
            "squall",
            "--vus",
            "5",
            "--duration",
            "1m 30s",
            "--summary-export",
            "out.jsonl",
            "--no-progress",
        ]);
        assert_eq!(Some(5), cli.vus);
        assert_eq!(Some(Duration::from_secs(90)), cli.duration);
        assert_eq!(Some(PathBuf::from("out.jsonl")), cli.summary_export);
        assert!(cli.no_progress);
        assert!(!cli.no_thresholds);
        assert!(cli.config.is_none());
    }
}
