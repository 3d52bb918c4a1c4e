use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;

use stepwise_cache::Config;

mod logging;
mod stresstest;
mod workloads;

use stresstest::perform_stresstest;
use workloads::WorkloadsConfig;

/// Runs workloads against a computation cache for a fixed amount of time and reports
/// throughput and latencies.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Path to the workload definition file.
    #[arg(long, short, value_name = "FILE")]
    workloads: PathBuf,

    /// Duration of the stresstest.
    #[arg(long, short, value_parser = humantime::parse_duration)]
    duration: Duration,

    /// Directory serving `dataset` workloads, laid out as `<DIR>/<bucket>/<key>`.
    #[arg(long, value_name = "DIR")]
    data: Option<PathBuf>,

    /// Enable production-like logging, with all output discarded.
    #[arg(long)]
    tracing: bool,

    /// Report metrics to the configured statsd, or to a local sink if there is none.
    #[arg(long)]
    metrics: bool,

    /// Report to the configured sentry DSN.
    #[arg(long)]
    sentry: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // parse configs
    let workloads_file =
        std::fs::File::open(&cli.workloads).context("failed to open workloads file")?;
    let workloads: WorkloadsConfig =
        serde_yaml::from_reader(workloads_file).context("failed to parse workloads YAML")?;

    let config = Config::get(cli.config.as_deref())?;

    let _guard = logging::init(
        &config,
        logging::Config {
            backtraces: config.logging.enable_backtraces,
            sentry: cli.sentry,
            tracing: cli.tracing,
            metrics: cli.metrics,
        },
    )?;

    perform_stresstest(config, cli.data, workloads, cli.duration)
}
