//! Harness configuration.
//!
//! Precedence, lowest first: [`HarnessConfig::default`], an optional `bundletest.toml`, `BUNDLETEST_*`
//! environment variables, then CLI flags (applied by the CLI through the `with_*` setters).
//!
//! ```toml
//! build_timeout_ms = 30000
//! update_timeout_ms = 10000
//! rebuild_debounce_ms = 50
//! step_fuel = 2000000
//! jobs = 4
//! retry_errored_within_load = false
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// File name looked up in the suite root when no explicit config path is given.
pub const CONFIG_FILE_NAME: &str = "bundletest.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("could not parse '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid value '{value}' for {key}")]
    InvalidEnv { key: String, value: String },
}

/// Limits and switches shared by every case of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct HarnessConfig {
    /// Upper bound for one compilation.
    pub build_timeout: Duration,
    /// Upper bound for applying one hot update (including accept/dispose callbacks).
    pub update_timeout: Duration,
    /// Upper bound for waiting on a watch rebuild.
    pub rebuild_timeout: Duration,
    /// How long the watched tree must stay unchanged before a rebuild starts.
    pub rebuild_debounce: Duration,
    /// Poll period of the fingerprint watcher.
    pub poll_interval: Duration,
    /// Interpreter steps allowed per execution segment.
    pub step_fuel: u64,
    /// Wall-clock bound per execution segment.
    pub execution_deadline: Duration,
    /// Timer callbacks allowed per drain.
    pub max_timer_runs: usize,
    /// Cases run concurrently.
    pub jobs: usize,
    pub update_snapshots: bool,
    pub retry_errored_within_load: bool,
    /// Directory for shared caches; a temporary directory when unset.
    pub work_root: Option<PathBuf>,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(30),
            update_timeout: Duration::from_secs(10),
            rebuild_timeout: Duration::from_secs(30),
            rebuild_debounce: Duration::from_millis(50),
            poll_interval: Duration::from_millis(10),
            step_fuel: 2_000_000,
            execution_deadline: Duration::from_secs(10),
            max_timer_runs: 10_000,
            jobs: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
            update_snapshots: false,
            retry_errored_within_load: false,
            work_root: None,
        }
    }
}

/// On-disk shape of `bundletest.toml`; every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    build_timeout_ms: Option<u64>,
    update_timeout_ms: Option<u64>,
    rebuild_timeout_ms: Option<u64>,
    rebuild_debounce_ms: Option<u64>,
    poll_interval_ms: Option<u64>,
    step_fuel: Option<u64>,
    execution_deadline_ms: Option<u64>,
    max_timer_runs: Option<usize>,
    jobs: Option<usize>,
    update_snapshots: Option<bool>,
    retry_errored_within_load: Option<bool>,
    work_root: Option<PathBuf>,
}

impl HarnessConfig {
    /// Load `path` on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        let file: ConfigFile = toml::from_str(content)?;
        let mut config = Self::default();
        config.merge(file);
        Ok(config)
    }

    /// Load `<dir>/bundletest.toml` if present, otherwise return the defaults.
    pub fn discover(dir: &Path) -> Result<Self, ConfigError> {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            Self::from_file(&candidate)
        } else {
            Ok(Self::default())
        }
    }

    fn merge(&mut self, file: ConfigFile) {
        let ms = Duration::from_millis;
        if let Some(v) = file.build_timeout_ms {
            self.build_timeout = ms(v);
        }
        if let Some(v) = file.update_timeout_ms {
            self.update_timeout = ms(v);
        }
        if let Some(v) = file.rebuild_timeout_ms {
            self.rebuild_timeout = ms(v);
        }
        if let Some(v) = file.rebuild_debounce_ms {
            self.rebuild_debounce = ms(v);
        }
        if let Some(v) = file.poll_interval_ms {
            self.poll_interval = ms(v);
        }
        if let Some(v) = file.step_fuel {
            self.step_fuel = v;
        }
        if let Some(v) = file.execution_deadline_ms {
            self.execution_deadline = ms(v);
        }
        if let Some(v) = file.max_timer_runs {
            self.max_timer_runs = v;
        }
        if let Some(v) = file.jobs {
            self.jobs = v.max(1);
        }
        if let Some(v) = file.update_snapshots {
            self.update_snapshots = v;
        }
        if let Some(v) = file.retry_errored_within_load {
            self.retry_errored_within_load = v;
        }
        if file.work_root.is_some() {
            self.work_root = file.work_root;
        }
    }

    /// Apply `BUNDLETEST_*` overrides.
    ///
    /// Takes the variables as an iterator so callers (and tests) decide where they come from;
    /// the binary passes `std::env::vars()`. Unrelated variables are ignored.
    pub fn apply_env<I, K, V>(mut self, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let (key, value) = (key.as_ref(), value.as_ref());
            let Some(name) = key.strip_prefix("BUNDLETEST_") else {
                continue;
            };
            let invalid = || ConfigError::InvalidEnv {
                key: key.to_string(),
                value: value.to_string(),
            };
            let millis = || value.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid());
            match name {
                "BUILD_TIMEOUT_MS" => self.build_timeout = millis()?,
                "UPDATE_TIMEOUT_MS" => self.update_timeout = millis()?,
                "REBUILD_TIMEOUT_MS" => self.rebuild_timeout = millis()?,
                "REBUILD_DEBOUNCE_MS" => self.rebuild_debounce = millis()?,
                "POLL_INTERVAL_MS" => self.poll_interval = millis()?,
                "EXECUTION_DEADLINE_MS" => self.execution_deadline = millis()?,
                "STEP_FUEL" => self.step_fuel = value.parse().map_err(|_| invalid())?,
                "MAX_TIMER_RUNS" => self.max_timer_runs = value.parse().map_err(|_| invalid())?,
                "JOBS" => self.jobs = value.parse::<usize>().map_err(|_| invalid())?.max(1),
                "UPDATE_SNAPSHOTS" => self.update_snapshots = parse_bool(value).ok_or_else(invalid)?,
                "RETRY_ERRORED_WITHIN_LOAD" => {
                    self.retry_errored_within_load = parse_bool(value).ok_or_else(invalid)?
                }
                "WORK_ROOT" => self.work_root = Some(PathBuf::from(value)),
                other => tracing::warn!(variable = other, "ignoring unknown BUNDLETEST_ variable"),
            }
        }
        Ok(self)
    }

    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    pub fn with_update_snapshots(mut self, update: bool) -> Self {
        self.update_snapshots = update;
        self
    }

    pub fn with_build_timeout(mut self, timeout: Duration) -> Self {
        self.build_timeout = timeout;
        self
    }

    pub fn with_update_timeout(mut self, timeout: Duration) -> Self {
        self.update_timeout = timeout;
        self
    }

    pub fn with_rebuild_debounce(mut self, debounce: Duration) -> Self {
        self.rebuild_debounce = debounce;
        self
    }

    pub fn with_step_fuel(mut self, fuel: u64) -> Self {
        self.step_fuel = fuel;
        self
    }

    pub fn with_max_timer_runs(mut self, runs: usize) -> Self {
        self.max_timer_runs = runs;
        self
    }

    pub fn with_retry_errored_within_load(mut self, retry: bool) -> Self {
        self.retry_errored_within_load = retry;
        self
    }

    pub fn with_work_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.work_root = Some(root.into());
        self
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toml_overrides_defaults() {
        let config = HarnessConfig::from_toml_str("build_timeout_ms = 500\njobs = 0\nupdate_snapshots = true\n").unwrap();
        assert_eq!(config.build_timeout, Duration::from_millis(500));
        assert_eq!(config.jobs, 1);
        assert!(config.update_snapshots);
        assert_eq!(config.update_timeout, HarnessConfig::default().update_timeout);
    }

    #[test]
    fn test_unknown_toml_key_is_rejected() {
        assert!(HarnessConfig::from_toml_str("rebuild_debounce = 5\n").is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let config = HarnessConfig::from_toml_str("step_fuel = 10\n")
            .unwrap()
            .apply_env([
                ("BUNDLETEST_STEP_FUEL", "99"),
                ("BUNDLETEST_REBUILD_DEBOUNCE_MS", "5"),
                ("BUNDLETEST_RETRY_ERRORED_WITHIN_LOAD", "yes"),
                ("PATH", "/usr/bin"),
            ])
            .unwrap();
        assert_eq!(config.step_fuel, 99);
        assert_eq!(config.rebuild_debounce, Duration::from_millis(5));
        assert!(config.retry_errored_within_load);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = HarnessConfig::default()
            .apply_env([("BUNDLETEST_JOBS", "many")])
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid value 'many' for BUNDLETEST_JOBS");
    }
}
