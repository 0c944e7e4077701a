//! Crate-wide error taxonomy.
//!
//! Each component has its own error enum (mirroring the teacher's pattern of
//! one `thiserror::Error` per module — `ReducerError`, `CheckpointerError`,
//! `SQLiteCheckpointerError`, ...) and converts into [`PipelineError`] via
//! `#[from]`. [`PipelineError::error_code`] returns the exact wire-facing
//! string constants from the error taxonomy so transports can build the
//! `{ error_code, message, hint? }` envelope without re-deriving it.

use thiserror::Error;

#[cfg(feature = "diagnostics")]
use miette::Diagnostic;

/// Authentication / key-store errors (component H).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum AuthError {
    #[error("token audience does not overlap configured audience list")]
    AudMismatch,

    #[error("token expired at {exp}")]
    TokenExpired { exp: i64 },

    #[error("key {kid:?} uses algorithm family incompatible with the token header")]
    AlgMismatch { kid: Option<String> },

    #[error("no configured key matches kid={kid:?}")]
    KeyNotFound {
        kid: Option<String>,
        /// Set when the issuer looks like `*.supabase.co`, to surface the
        /// project-specific hint the spec calls for.
        supabase_hint: bool,
    },

    #[error("token lifetime {lifetime_secs}s exceeds the configured maximum {max_secs}s")]
    MaxLifetimeExceeded { lifetime_secs: i64, max_secs: i64 },

    #[error("token is missing required claim {claim:?}")]
    MissingRequiredClaim { claim: &'static str },

    #[error("failed to fetch JWKS from {url}: {message}")]
    JwksFetchFailed { url: String, message: String },
}

/// Replication batch-writer errors (component B).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum ReplicationError {
    #[error("row for {table} exceeds the {limit_bytes} byte ceiling and was replaced with a placeholder")]
    RowTooLarge { table: String, limit_bytes: usize },

    #[error("replication slot for group {group_id} is missing upstream")]
    ReplicationSlotMissing { group_id: String },

    #[error("transaction retry budget exhausted after {tries} tries / {elapsed_secs}s")]
    MaxTxRetries { tries: u32, elapsed_secs: f64 },

    #[error("invariant violated: {message}")]
    Assertion { message: String },
}

/// Sync-stream / connection-level errors (components E, F, G).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum SyncStreamError {
    #[error("connection requested {requested} buckets, exceeding the limit of {limit}")]
    TooManyBuckets { requested: usize, limit: usize },

    #[error("parameter query returned {returned} rows, exceeding the limit of {limit}")]
    TooManyParameterResults { returned: usize, limit: usize },

    #[error("timed out after {timeout_secs}s waiting for a data-fetch semaphore slot")]
    SyncTimeout { timeout_secs: f64 },

    #[error("no active sync rules are available for group {group_id}")]
    NoActiveSyncRules { group_id: String },

    #[error("cannot determine the migration state of the last run")]
    LastRunMigrationUnknown,
}

/// Storage-adapter errors surfaced through the boundary the pipeline consumes
/// (component A/B's dependency on the external storage engine, §4.2/§6).
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum StorageError {
    #[error("checkpoint {checkpoint} not found")]
    CheckpointNotFound { checkpoint: u64 },

    #[error("fatal storage error: {message}")]
    FatalStorageError { message: String },
}

/// Top-level error type threading every component error into one enum so
/// callers at the orchestrator boundary can match on a single type.
#[derive(Debug, Error)]
#[cfg_attr(feature = "diagnostics", derive(Diagnostic))]
pub enum PipelineError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Replication(#[from] ReplicationError),

    #[error(transparent)]
    Sync(#[from] SyncStreamError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl PipelineError {
    /// The `error_code` string from §7's taxonomy, used verbatim in the
    /// wire-facing `{ error_code, message, hint? }` envelope.
    pub fn error_code(&self) -> &'static str {
        match self {
            PipelineError::Auth(e) => match e {
                AuthError::AudMismatch => "AUD_MISMATCH",
                AuthError::TokenExpired { .. } => "TOKEN_EXPIRED",
                AuthError::AlgMismatch { .. } => "ALG_MISMATCH",
                AuthError::KeyNotFound { .. } => "KEY_NOT_FOUND",
                AuthError::MaxLifetimeExceeded { .. } => "MAX_LIFETIME_EXCEEDED",
                AuthError::MissingRequiredClaim { .. } => "MISSING_REQUIRED_CLAIM",
                AuthError::JwksFetchFailed { .. } => "JWKS_FETCH_FAILED",
            },
            PipelineError::Replication(e) => match e {
                ReplicationError::RowTooLarge { .. } => "ROW_TOO_LARGE",
                ReplicationError::ReplicationSlotMissing { .. } => "REPLICATION_SLOT_MISSING",
                ReplicationError::MaxTxRetries { .. } => "MAX_TX_RETRIES",
                ReplicationError::Assertion { .. } => "ASSERTION",
            },
            PipelineError::Sync(e) => match e {
                SyncStreamError::TooManyBuckets { .. } => "TOO_MANY_BUCKETS",
                SyncStreamError::TooManyParameterResults { .. } => "TOO_MANY_PARAMETER_RESULTS",
                SyncStreamError::SyncTimeout { .. } => "SYNC_LOCK_TIMEOUT",
                SyncStreamError::NoActiveSyncRules { .. } => "NO_ACTIVE_SYNC_RULES",
                SyncStreamError::LastRunMigrationUnknown => "LAST_RUN_MIGRATION_UNKNOWN",
            },
            PipelineError::Storage(e) => match e {
                StorageError::CheckpointNotFound { .. } => "CHECKPOINT_NOT_FOUND",
                StorageError::FatalStorageError { .. } => "FATAL_STORAGE_ERROR",
            },
        }
    }

    /// Whether the spec treats this as an invariant breach that should abort
    /// the process rather than fail one connection (§7 propagation policy).
    pub fn is_fatal_invariant_breach(&self) -> bool {
        matches!(self, PipelineError::Replication(ReplicationError::Assertion { .. }))
    }

    /// The wire-facing `{ error_code, message, hint? }` triple (§6).
    pub fn to_wire(&self) -> WireError {
        WireError {
            error_code: self.error_code().to_string(),
            message: self.to_string(),
            hint: self.hint(),
        }
    }

    fn hint(&self) -> Option<String> {
        match self {
            PipelineError::Auth(AuthError::KeyNotFound {
                supabase_hint: true,
                ..
            }) => Some(
                "This issuer looks like a Supabase project; verify the JWT secret or JWKS URL \
                 configured for Supabase auth."
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// Serializable error envelope sent to clients in place of a terminal frame.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WireError {
    pub error_code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

pub type Result<T, E = PipelineError> = std::result::Result<T, E>;
