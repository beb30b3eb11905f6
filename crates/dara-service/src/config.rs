use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use sentry::types::Dsn;
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

/// Output format of log lines written to `stderr`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// `Pretty` when `stderr` is a terminal, `Simplified` otherwise.
    Auto,
    Pretty,
    /// One line per event, without colors.
    Simplified,
    /// One JSON object per line.
    Json,
}

/// Logging of the owning process and its workers.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// Level for the dara crates, unless `RUST_LOG` overrides it.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    pub format: LogFormat,
    /// Sets `RUST_BACKTRACE=1` for this process and all workers.
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

/// Statsd reporting.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// `host:port` of the statsd server, taken from `STATSD_SERVER` if unset.
    ///
    /// No metrics are sent without it.
    pub statsd: Option<String>,
    pub prefix: String,
    /// If set, every metric carries the local hostname under this tag.
    pub hostname_tag: Option<String>,
    /// Fixed tags attached to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "dara".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Configuration of the worker process pool.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Whether a task pool is started at all.
    ///
    /// Without a pool, only in-process computations can be cached.
    pub enabled: bool,

    /// The maximum number of worker processes.
    ///
    /// Defaults to one less than the number of CPUs, and at least 1.
    pub max_workers: NonZeroUsize,

    /// How long a worker beyond the desired number of workers may stay idle before it is stopped.
    #[serde(with = "humantime_serde")]
    pub worker_timeout: Duration,

    /// How long `start` waits for the initial workers to come up.
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,

    /// How long a worker gets to exit at every step of its termination.
    #[serde(with = "humantime_serde")]
    pub terminate_timeout: Duration,

    /// The name of the task module the workers load.
    pub task_module: String,

    /// The worker executable.
    ///
    /// Defaults to `dara-worker` next to the current executable, or on the `PATH`.
    pub worker_executable: Option<PathBuf>,

    /// The directory shared memory segments are created in.
    ///
    /// This should be a memory-backed file system, and defaults to `/dev/shm`.
    pub shm_dir: PathBuf,

    /// The maximum size in bytes of encoded task arguments and results.
    pub max_payload_size: u64,
}

/// The default for [`PoolConfig::max_workers`].
pub fn default_max_workers() -> NonZeroUsize {
    std::thread::available_parallelism()
        .ok()
        .and_then(|cpus| NonZeroUsize::new(cpus.get() - 1))
        .unwrap_or(NonZeroUsize::MIN)
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            enabled: false,
            max_workers: default_max_workers(),
            worker_timeout: Duration::from_secs(60),
            startup_timeout: Duration::from_secs(10),
            terminate_timeout: Duration::from_secs(2),
            task_module: "builtin".into(),
            worker_executable: None,
            shm_dir: PathBuf::from("/dev/shm"),
            max_payload_size: 1024 * 1024 * 1024,
        }
    }
}

impl PoolConfig {
    /// Resolves the worker executable to spawn.
    pub fn worker_executable(&self) -> PathBuf {
        if let Some(path) = &self.worker_executable {
            return path.clone();
        }

        let sibling = env::current_exe()
            .ok()
            .and_then(|exe| Some(exe.parent()?.join("dara-worker")));
        match sibling {
            Some(path) if path.is_file() => path,
            _ => PathBuf::from("dara-worker"),
        }
    }
}

/// The configuration of a process hosting [`Services`](crate::services::Services).
///
/// Every section is optional and falls back to its defaults.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: Logging,
    pub metrics: Metrics,
    /// Errors logged at `ERROR` level are sent to this DSN.
    pub sentry_dsn: Option<Dsn>,
    pub pool: PoolConfig,
}

impl Config {
    /// Loads the YAML file at `path`, or the defaults without a path.
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut yaml = String::new();
        reader
            .read_to_string(&mut yaml)
            .context("failed to read configuration file")?;
        // an empty document would silently yield the defaults
        if yaml.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&yaml).context("failed to parse configuration")
    }
}

const LEVELS: &[&str] = &["off", "error", "warn", "info", "debug", "trace"];

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    let level = String::deserialize(deserializer)?;
    let filter = match level.as_str() {
        "off" => LevelFilter::OFF,
        "error" => LevelFilter::ERROR,
        "warn" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        "trace" => LevelFilter::TRACE,
        _ => return Err(de::Error::unknown_variant(&level, LEVELS)),
    };
    Ok(filter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = Config::get(None).unwrap();
        assert!(!cfg.pool.enabled);
        assert_eq!(cfg.pool.task_module, "builtin");
        assert_eq!(cfg.logging.level, LevelFilter::INFO);
    }

    #[test]
    fn test_pool_config() {
        // Setting individual fields keeps the defaults of the others.
        let yaml = r#"
            pool:
              enabled: true
              max_workers: 3
              worker_timeout: 500ms
              task_module: reports
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(
            cfg.pool,
            PoolConfig {
                enabled: true,
                max_workers: NonZeroUsize::new(3).unwrap(),
                worker_timeout: Duration::from_millis(500),
                task_module: "reports".into(),
                ..Default::default()
            }
        );
    }

    #[test]
    fn test_pool_without_workers() {
        // a pool without workers would never run a task
        let err = Config::from_reader("pool:\n  max_workers: 0".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("nonzero"), "{err:#}");
    }

    #[test]
    fn test_logging_config() {
        let yaml = r#"
            logging:
              level: debug
              format: json
        "#;
        let cfg = Config::from_reader(yaml.as_bytes()).unwrap();
        assert_eq!(cfg.logging.level, LevelFilter::DEBUG);
        assert_eq!(cfg.logging.format, LogFormat::Json);

        let err = Config::from_reader("logging:\n  level: loud".as_bytes()).unwrap_err();
        assert!(format!("{err:#}").contains("unknown variant `loud`"));
    }

    #[test]
    fn test_empty_file() {
        let result = Config::from_reader("  \n".as_bytes());
        assert_eq!(result.unwrap_err().to_string(), "config file empty");
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let cfg = Config::from_reader("cache_dir: /tmp\nmetrics:\n  prefix: test".as_bytes());
        assert_eq!(cfg.unwrap().metrics.prefix, "test");
    }
}
