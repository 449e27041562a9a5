// src/logging.rs
//
// Tracing subscriber set-up. Verbosity comes from the -v count, or from
// CB_PERF_DEBUG_LEVEL when no -v is given:
//   0: cbperf=warn   1: cbperf=info   2: cbperf=debug   3+: cbperf=trace
// HTTP_DEBUG_LEVEL uses the same scale for the reqwest/hyper targets.
// Output goes to stderr unless CB_PERF_DEBUG_FILE or CB_PERF_LOGFILE names a
// file to append to; stdout is kept for documents and reports.

use std::fs::OpenOptions;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use crate::constants::{ENV_DEBUG_FILE, ENV_DEBUG_LEVEL, ENV_HTTP_DEBUG_LEVEL, ENV_LOGFILE};
use crate::error::{CbError, CbResult};

fn level_name(level: u8) -> &'static str {
    match level {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

fn env_level(name: &str) -> Option<u8> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

/// Filter directive for a given crate and HTTP verbosity.
pub fn filter_directive(verbose: u8, http_level: u8) -> String {
    let http = level_name(http_level);
    format!(
        "cbperf={},reqwest={},hyper={},hyper_util={}",
        level_name(verbose),
        http,
        http,
        http
    )
}

/// Install the global subscriber. Call once from `main`.
pub fn init(verbose: u8) -> CbResult<()> {
    let level = if verbose > 0 {
        verbose
    } else {
        env_level(ENV_DEBUG_LEVEL).unwrap_or(0)
    };
    let http = env_level(ENV_HTTP_DEBUG_LEVEL).unwrap_or(0);
    let filter = EnvFilter::new(filter_directive(level, http));

    let log_file = std::env::var(ENV_DEBUG_FILE)
        .ok()
        .or_else(|| std::env::var(ENV_LOGFILE).ok())
        .filter(|p| !p.is_empty());

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| CbError::Config(format!("cannot open log file {}: {}", path, e)))?;
            fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(Arc::new(file))
                .try_init()
                .map_err(|e| CbError::Config(e.to_string()))
        }
        None => fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
            .map_err(|e| CbError::Config(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directive_levels() {
        assert_eq!(
            filter_directive(0, 0),
            "cbperf=warn,reqwest=warn,hyper=warn,hyper_util=warn"
        );
        assert!(filter_directive(2, 3).starts_with("cbperf=debug,reqwest=trace"));
        assert!(filter_directive(9, 0).starts_with("cbperf=trace"));
    }
}
