//! Tunables for the sync pipeline, loaded from the environment.
//!
//! Mirrors the teacher's `runtimes::runtime_config::RuntimeConfig` pattern:
//! a `Default` impl that resolves values from `dotenvy`-loaded environment
//! variables with typed fallbacks, plus builder-style `with_*` methods for
//! programmatic overrides.

use std::time::Duration;

/// Tunables governing the sync stream orchestrator (component G) and the
/// bucket parameter resolver (component E).
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    /// Global cap on concurrent bucket-data fetches in flight (§4.7).
    pub max_active_connections: usize,
    /// Timeout waiting for a data-fetch semaphore slot (§4.7, §5).
    pub semaphore_timeout: Duration,
    /// Buckets a single connection may request at once (§4.6).
    pub max_buckets_per_connection: usize,
    /// Rows a single parameter query may return (§4.5).
    pub max_parameter_query_results: usize,
    /// Ops sent within the current checkpoint before preemption becomes
    /// eligible (§4.7, §9 open question — exposed as a tunable rather than
    /// hardcoded).
    pub preemption_ops_threshold: u64,
    /// Yield duration after a full priority scan, to avoid hot spinning
    /// (§4.7).
    pub post_scan_yield: Duration,
    /// Row serialization size ceiling before `ROW_TOO_LARGE` applies (§4.1).
    pub row_size_limit_bytes: usize,
    /// Batch size for `TRUNCATE` scans over `current_data` (§4.1).
    pub truncate_scan_batch: usize,
    /// Retry budget for transient replication-transaction conflicts (§4.1, §5).
    pub max_tx_retries: u32,
    pub max_tx_retry_window: Duration,
    /// Frame size above which a flush-hint sentinel is also emitted (§4.7).
    pub flush_hint_threshold_bytes: usize,
    /// Clock skew tolerance applied to JWT `exp` when scheduling the
    /// token-expiry stream (component H, §4.7).
    pub jwt_expiry_skew: Duration,
    /// Default max token lifetime enforced by the auth key store unless a
    /// key overrides it (§4.8).
    pub jwt_max_lifetime: Duration,
}

impl PipelineConfig {
    fn env_usize(key: &str, default: usize) -> usize {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn env_u64(key: &str, default: u64) -> u64 {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn env_secs(key: &str, default: Duration) -> Duration {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs_f64)
            .unwrap_or(default)
    }

    /// Load configuration from the environment (via `dotenvy`), falling back
    /// to the spec's literal defaults for any variable that is unset.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self {
            max_active_connections: Self::env_usize("SYNC_MAX_ACTIVE_CONNECTIONS", 10),
            semaphore_timeout: Self::env_secs("SYNC_SEMAPHORE_TIMEOUT_SECS", Duration::from_secs(30)),
            max_buckets_per_connection: Self::env_usize("SYNC_MAX_BUCKETS_PER_CONNECTION", 1_000_000),
            max_parameter_query_results: Self::env_usize("SYNC_MAX_PARAMETER_QUERY_RESULTS", 1_000),
            preemption_ops_threshold: Self::env_u64("SYNC_PREEMPTION_OPS_THRESHOLD", 1_000),
            post_scan_yield: Self::env_secs("SYNC_POST_SCAN_YIELD_SECS", Duration::from_millis(10)),
            row_size_limit_bytes: Self::env_usize("SYNC_ROW_SIZE_LIMIT_BYTES", 15 * 1024 * 1024),
            truncate_scan_batch: Self::env_usize("SYNC_TRUNCATE_SCAN_BATCH", 2_000),
            max_tx_retries: Self::env_usize("SYNC_MAX_TX_RETRIES", 20) as u32,
            max_tx_retry_window: Self::env_secs("SYNC_MAX_TX_RETRY_WINDOW_SECS", Duration::from_secs(90)),
            flush_hint_threshold_bytes: Self::env_usize("SYNC_FLUSH_HINT_THRESHOLD_BYTES", 50 * 1024),
            jwt_expiry_skew: Self::env_secs("SYNC_JWT_EXPIRY_SKEW_SECS", Duration::from_secs(0)),
            jwt_max_lifetime: Self::env_secs("SYNC_JWT_MAX_LIFETIME_SECS", Duration::from_secs(24 * 60 * 60)),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_env()
    }
}
