// src/constants.rs
//
// Central location for the tunables used throughout cbperf.
// Anything a user can override in the config file has its default here.

use std::time::Duration;

// =============================================================================
// Retry policy
// =============================================================================

/// Attempts made by the retry wrapper before the last failure is propagated
pub const DEFAULT_RETRY_COUNT: u32 = 10;

/// Base factor in seconds; wait before attempt n is `factor * 2^(n+1)`
pub const DEFAULT_RETRY_FACTOR: f64 = 0.01;

// =============================================================================
// Cluster connection
// =============================================================================

pub const MGMT_PORT: u16 = 8091;
pub const MGMT_PORT_TLS: u16 = 18091;
pub const VIEW_PORT: u16 = 8092;
pub const VIEW_PORT_TLS: u16 = 18092;
pub const QUERY_PORT: u16 = 8093;
pub const QUERY_PORT_TLS: u16 = 18093;
pub const KV_PORT: u16 = 11210;
pub const KV_PORT_TLS: u16 = 11207;
pub const INDEX_PORT: u16 = 9102;
pub const INDEX_PORT_TLS: u16 = 19102;

/// SRV lookup per-query timeout
pub const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// SRV lookup total lifetime
pub const DNS_LIFETIME: Duration = Duration::from_secs(10);

/// TCP reachability probe against the management port
pub const TCP_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// HTTP timeout for admin REST calls
pub const HTTP_TIMEOUT: Duration = Duration::from_secs(15);

/// Retries for transient 5xx answers from the admin REST API
pub const HTTP_RETRIES: u32 = 60;
pub const HTTP_RETRY_DELAY: Duration = Duration::from_millis(100);

pub const DEFAULT_KV_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for waiting on KV/query/management readiness after connect
pub const SERVICE_READY_BUDGET: Duration = Duration::from_secs(3);

/// Name this client announces in the KV HELLO
pub const KV_CLIENT_NAME: &str = "cbperf/0.4";

// =============================================================================
// Provisioning
// =============================================================================

/// Smallest bucket memory quota the cluster accepts (MiB)
pub const MIN_BUCKET_QUOTA_MB: u64 = 256;

/// Timeout for secondary index builds
pub const INDEX_CREATE_TIMEOUT: Duration = Duration::from_secs(480);

/// Longest pause between index state polls
pub const INDEX_WATCH_MAX_DELAY: Duration = Duration::from_secs(5);

/// Attempts when waiting for a bucket/scope/collection to become visible
pub const VISIBILITY_RETRIES: u32 = 15;

pub const DEFAULT_REPLICAS: u32 = 1;

pub const DEFAULT_SCOPE: &str = "_default";
pub const DEFAULT_COLLECTION: &str = "_default";
pub const PRIMARY_INDEX_NAME: &str = "#primary";

// =============================================================================
// Workload execution
// =============================================================================

pub const DEFAULT_THREADS: usize = 32;
pub const DEFAULT_THREAD_MAX: usize = 512;
pub const DEFAULT_RECORD_COUNT: u64 = 1_000_000;
pub const DEFAULT_BATCH_SIZE: u64 = 100;
pub const DEFAULT_WRITE_PERCENT: u32 = 50;

/// Batch wall-clock bound that raises the stop flag
pub const DEFAULT_LATENCY_LIMIT: Duration = Duration::from_secs(5);

/// Admission throttle: sleep between checks and number of checks
pub const THROTTLE_INTERVAL: Duration = Duration::from_millis(500);
pub const THROTTLE_ATTEMPTS: u32 = 30;

/// Ramp pacing: pause between cohorts, and how often the cohort size doubles
pub const RAMP_COHORT_PAUSE: Duration = Duration::from_secs(5);
pub const RAMP_ACCELERATE_EVERY: Duration = Duration::from_secs(60);
pub const RAMP_INITIAL_ACCELERATOR: usize = 1;

/// Grace period before ramp workers are aborted at shutdown
pub const RAMP_TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Bound of the telemetry channel between workers and the aggregator
pub const TELEMETRY_QUEUE_DEPTH: usize = 4096;

// =============================================================================
// Status aggregation
// =============================================================================

/// Samples kept for the TPS trend regression
pub const TREND_WINDOW: usize = 100;

/// Aggregator gives up after this many empty polls of `DATA_WAIT_POLL`
pub const DATA_WAIT_ITERATIONS: u32 = 100;
pub const DATA_WAIT_POLL: Duration = Duration::from_millis(200);

// =============================================================================
// Bandwidth probe
// =============================================================================

pub const BANDWIDTH_COLLECTION: &str = "bandwidth";
pub const BANDWIDTH_START_SIZE: usize = 1024;
pub const BANDWIDTH_MAX_SIZE: usize = 16 * 1024 * 1024;
pub const BANDWIDTH_MAX_PASSES: usize = 5;
pub const BANDWIDTH_STABLE_RATIO: f64 = 0.9;

/// Fraction of measured throughput a batch is allowed to consume
pub const BANDWIDTH_HEADROOM: f64 = 0.7;

// =============================================================================
// Entry points
// =============================================================================

/// Sliding buffer for the streaming JSON reader
pub const STREAM_BUFFER_SIZE: usize = 128 * 1024;

/// Placeholder in `get -k` keys replaced by an incrementing counter
pub const KEY_COUNTER_TOKEN: &str = "%N";

/// Import producer backoff bounds while the executor queue is full
pub const IMPORT_BACKOFF_START: Duration = Duration::from_millis(10);
pub const IMPORT_BACKOFF_MAX: Duration = Duration::from_secs(2);

// =============================================================================
// Environment
// =============================================================================

pub const ENV_CONFIG_FILE: &str = "CBPERF_CONFIG_FILE";
pub const ENV_SCHEMA_FILE: &str = "CBPERF_SCHEMA_FILE";
pub const ENV_DEBUG_LEVEL: &str = "CB_PERF_DEBUG_LEVEL";
pub const ENV_DEBUG_FILE: &str = "CB_PERF_DEBUG_FILE";
pub const ENV_LOGFILE: &str = "CB_PERF_LOGFILE";
pub const ENV_HTTP_DEBUG_LEVEL: &str = "HTTP_DEBUG_LEVEL";
