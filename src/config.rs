// src/config.rs
//
// Runtime configuration: a YAML file (all sections optional) overlaid by
// command-line flags. Durations are humantime strings ("5s", "500ms").

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::*;
use crate::error::{CbError, CbResult};
use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub cluster: ClusterConfig,
    pub run: RunConfig,
    pub retry: RetryConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct ClusterConfig {
    /// Hostname, IP, or DNS name carrying `_couchbase._tcp` SRV records
    pub host: String,
    pub username: String,
    pub password: String,
    pub tls: bool,
    /// Dial nodes by their alternate (external) addresses
    pub external_network: bool,
    #[serde(with = "humantime_serde")]
    pub kv_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub query_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            username: "Administrator".to_string(),
            password: "password".to_string(),
            tls: false,
            external_network: false,
            kv_timeout: DEFAULT_KV_TIMEOUT,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RunConfig {
    /// Workers for the fixed-threads launch
    pub threads: usize,
    /// Hard cap on workers for ramp runs (also sizes the per-worker TPS table)
    pub thread_max: usize,
    pub record_count: u64,
    /// Operations per worker batch
    pub batch_size: u64,
    /// Percentage of operations that are writes, 0..=100
    pub write_percent: u32,
    pub replicas: u32,
    /// Pick record numbers uniformly at random instead of sequentially
    pub random_keys: bool,
    /// Issue a batch's operations concurrently rather than one by one
    pub parallel_batches: bool,
    /// Size batches from a bandwidth probe before loading
    pub bandwidth_probe: bool,

    /// Batch wall time at or above this raises the stop flag
    #[serde(with = "humantime_serde")]
    pub latency_limit: Duration,
    #[serde(with = "humantime_serde")]
    pub throttle_interval: Duration,
    pub throttle_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub ramp_pause: Duration,
    #[serde(with = "humantime_serde")]
    pub ramp_accelerate_every: Duration,
    /// Wait before ramp workers are aborted at shutdown
    #[serde(with = "humantime_serde")]
    pub ramp_grace: Duration,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            threads: DEFAULT_THREADS,
            thread_max: DEFAULT_THREAD_MAX,
            record_count: DEFAULT_RECORD_COUNT,
            batch_size: DEFAULT_BATCH_SIZE,
            write_percent: DEFAULT_WRITE_PERCENT,
            replicas: DEFAULT_REPLICAS,
            random_keys: false,
            parallel_batches: true,
            bandwidth_probe: true,
            latency_limit: DEFAULT_LATENCY_LIMIT,
            throttle_interval: THROTTLE_INTERVAL,
            throttle_attempts: THROTTLE_ATTEMPTS,
            ramp_pause: RAMP_COHORT_PAUSE,
            ramp_accelerate_every: RAMP_ACCELERATE_EVERY,
            ramp_grace: RAMP_TERMINATE_GRACE,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct RetryConfig {
    pub retries: u32,
    /// Base wait in seconds; attempt n waits `factor * 2^(n+1)`
    pub factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retries: DEFAULT_RETRY_COUNT,
            factor: DEFAULT_RETRY_FACTOR,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, self.factor)
    }
}

/// Values given on the command line; `None` keeps the file/default value.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub host: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub tls: bool,
    pub external: bool,
    pub threads: Option<usize>,
    pub thread_max: Option<usize>,
    pub record_count: Option<u64>,
    pub batch_size: Option<u64>,
    pub write_percent: Option<u32>,
    pub replicas: Option<u32>,
    pub random_keys: bool,
    pub serial_batches: bool,
    pub skip_probe: bool,
}

impl Config {
    /// Read the config file from `path`, else `CBPERF_CONFIG_FILE`, else
    /// `$HOME/.cbperf/config.yaml`. A missing default file yields defaults;
    /// a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> CbResult<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(ENV_CONFIG_FILE).ok().filter(|p| !p.is_empty()).map(PathBuf::from));
        match explicit {
            Some(p) => Self::from_file(&p),
            None => match default_path() {
                Some(p) if p.exists() => Self::from_file(&p),
                _ => Ok(Self::default()),
            },
        }
    }

    pub fn from_file(path: &Path) -> CbResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CbError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let cfg = Self::from_yaml(&text).map_err(|e| CbError::Config(format!("{}: {}", path.display(), e)))?;
        debug!("loaded configuration from {}", path.display());
        Ok(cfg)
    }

    pub fn from_yaml(text: &str) -> CbResult<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(text).map_err(|e| CbError::Config(e.to_string()))
    }

    pub fn apply(&mut self, o: &Overrides) {
        let c = &mut self.cluster;
        if let Some(v) = &o.host {
            c.host = v.clone();
        }
        if let Some(v) = &o.username {
            c.username = v.clone();
        }
        if let Some(v) = &o.password {
            c.password = v.clone();
        }
        c.tls |= o.tls;
        c.external_network |= o.external;

        let r = &mut self.run;
        if let Some(v) = o.threads {
            r.threads = v;
        }
        if let Some(v) = o.thread_max {
            r.thread_max = v;
        }
        if let Some(v) = o.record_count {
            r.record_count = v;
        }
        if let Some(v) = o.batch_size {
            r.batch_size = v;
        }
        if let Some(v) = o.write_percent {
            r.write_percent = v;
        }
        if let Some(v) = o.replicas {
            r.replicas = v;
        }
        r.random_keys |= o.random_keys;
        if o.serial_batches {
            r.parallel_batches = false;
        }
        if o.skip_probe {
            r.bandwidth_probe = false;
        }
    }

    pub fn validate(&self) -> CbResult<()> {
        let r = &self.run;
        if self.cluster.host.trim().is_empty() {
            return Err(CbError::Config("cluster host is empty".into()));
        }
        if r.threads == 0 {
            return Err(CbError::Config("threads must be at least 1".into()));
        }
        if r.thread_max < r.threads {
            return Err(CbError::Config(format!(
                "thread_max ({}) is below threads ({})",
                r.thread_max, r.threads
            )));
        }
        if r.batch_size == 0 {
            return Err(CbError::Config("batch_size must be at least 1".into()));
        }
        if r.write_percent > 100 {
            return Err(CbError::Config(format!("write_percent {} is above 100", r.write_percent)));
        }
        if self.retry.factor < 0.0 {
            return Err(CbError::Config("retry factor must not be negative".into()));
        }
        Ok(())
    }
}

fn default_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".cbperf").join("config.yaml"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg = Config::from_yaml(
            r#"
cluster:
  host: cb.example.com
  tls: true
run:
  threads: 4
  latency_limit: 2s
retry:
  retries: 3
"#,
        )
        .unwrap();
        assert_eq!(cfg.cluster.host, "cb.example.com");
        assert!(cfg.cluster.tls);
        assert_eq!(cfg.cluster.username, "Administrator");
        assert_eq!(cfg.run.threads, 4);
        assert_eq!(cfg.run.latency_limit, Duration::from_secs(2));
        assert_eq!(cfg.run.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.retry.retries, 3);
        assert_eq!(cfg.retry.factor, DEFAULT_RETRY_FACTOR);
        cfg.validate().unwrap();
    }

    #[test]
    fn test_overrides_and_validation() {
        let mut cfg = Config::default();
        cfg.apply(&Overrides {
            host: Some("10.0.0.5".into()),
            threads: Some(8),
            write_percent: Some(150),
            serial_batches: true,
            ..Default::default()
        });
        assert_eq!(cfg.cluster.host, "10.0.0.5");
        assert_eq!(cfg.run.threads, 8);
        assert!(!cfg.run.parallel_batches);
        assert!(cfg.validate().is_err());

        cfg.run.write_percent = 100;
        cfg.run.thread_max = 4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Config::load(Some(&dir.path().join("nope.yaml"))).is_err());

        let p = dir.path().join("cfg.yaml");
        std::fs::write(&p, "run:\n  record_count: 30\n").unwrap();
        assert_eq!(Config::load(Some(&p)).unwrap().run.record_count, 30);
    }
}
