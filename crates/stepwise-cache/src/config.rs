use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level, unless overridden by `RUST_LOG`.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "stepwise".into(),
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the computation cache and its surroundings.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of worker threads stepping computations. Zero is treated as one.
    pub workers: usize,

    /// How long an idle worker waits on the queue before running maintenance.
    #[serde(with = "humantime_serde")]
    pub worker_wakeup_interval: Duration,

    /// How long a computation has to run before it is asked to split.
    #[serde(with = "humantime_serde")]
    pub min_split_interval: Duration,

    /// Never split computations, regardless of how long they run.
    pub disable_splitting: bool,

    /// Upper bound of a single request to the external loader, in bytes.
    pub max_fetch_chunk_size: u64,

    /// Size of the vector chunks a dataset is cut into, in bytes.
    pub dataset_chunk_size: u64,

    /// Number of threads running external data fetches.
    pub io_threads: usize,

    /// Capacity of the in-memory page store, in bytes.
    pub page_store_capacity: u64,

    /// Logging configuration.
    pub logging: Logging,

    /// Metrics configuration.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<Dsn>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            workers: thread::available_parallelism()
                .map(NonZeroUsize::get)
                .unwrap_or(4),
            worker_wakeup_interval: Duration::from_millis(10),
            min_split_interval: Duration::from_millis(50),
            disable_splitting: false,
            max_fetch_chunk_size: 10 * 1024 * 1024,
            dataset_chunk_size: 10 * 1024 * 1024,
            io_threads: 4,
            page_store_capacity: 1024 * 1024 * 1024,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    pub fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // serde_yaml parses an empty document into the defaults
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

/// Accepts the level names understood by `RUST_LOG`, case-insensitively.
fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    level
        .parse()
        .map_err(|_| de::Error::invalid_value(de::Unexpected::Str(&level), &"a log level"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = Config::get(None).unwrap();
        assert!(cfg.workers >= 1);
        assert_eq!(cfg.worker_wakeup_interval, Duration::from_millis(10));
        assert_eq!(cfg.min_split_interval, Duration::from_millis(50));
        assert_eq!(cfg.max_fetch_chunk_size, 10 << 20);
        assert_eq!(cfg.dataset_chunk_size, 10 << 20);
        assert!(!cfg.disable_splitting);
    }

    #[test]
    fn test_durations_and_partial_sections() {
        // Setting a single knob keeps the defaults of everything else.
        let yaml = r#"
            workers: 3
            min_split_interval: 5ms
            logging:
              level: debug
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.workers, 3);
        assert_eq!(cfg.min_split_interval, Duration::from_millis(5));
        assert_eq!(cfg.worker_wakeup_interval, Duration::from_millis(10));
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Auto);
        assert_eq!(cfg.metrics.prefix, "stepwise");
    }

    #[test]
    fn test_bad_level() {
        let yaml = r#"
            logging:
              level: loud
        "#;
        assert!(Config::from_reader(yaml.as_bytes()).is_err());
    }

    #[test]
    fn test_unknown_fields() {
        // knobs of other versions are ignored
        let yaml = r#"
            workers: 2
            not_a_knob: true
        "#;
        let cfg = Config::from_reader(yaml.as_bytes());
        assert!(cfg.is_ok());
    }

    #[test]
    fn test_empty_file() {
        // empty files are rejected
        let yaml = r#""#;
        let result = Config::from_reader(yaml.as_bytes());
        assert!(result.is_err());
    }
}
