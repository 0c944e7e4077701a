//! Component A: the operation log & id sequence.
//!
//! Grounded on the teacher's `runtimes::checkpointer` trio (`Checkpointer`
//! trait + `InMemoryCheckpointer` + sqlite/postgres backends): one async
//! trait describing the storage contract, an in-memory implementation for
//! tests and small deployments, and a durable `sqlx`-backed implementation
//! behind the `sqlite` feature. The operation log differs from a
//! checkpointer in that it is append-only and range-queried rather than
//! latest-value-per-key, so the trait shape diverges accordingly.

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::{BucketOp, ChecksumTotal, Checkpoint, Lsn, OpId};

#[derive(Debug, Clone, Error)]
pub enum OperationLogError {
    #[error("operation log backend error: {message}")]
    Backend { message: String },

    #[error("requested range start {start} is after end {end}")]
    InvalidRange { start: OpId, end: OpId },
}

pub type Result<T> = std::result::Result<T, OperationLogError>;

/// Append-only, gap-free, monotonically increasing per-group operation
/// log (§4.1).
///
/// Implementations must guarantee invariant 1 (op_id is globally
/// monotonic and gap-free within a `group_id`) and invariant 2 (additive
/// checksum composability across any `(start, end]` range) — see
/// [`crate::model::ChecksumTotal::compose`].
#[async_trait]
pub trait OperationLog: Send + Sync {
    /// Allocate the next op_id for `group_id` without reserving it; the
    /// caller must `append` before requesting another.
    async fn next_op_id(&self, group_id: &str) -> Result<OpId>;

    /// Append a batch of bucket operations sharing a single op_id, plus the
    /// source LSN the batch commits at, atomically.
    async fn append(&self, group_id: &str, checkpoint_lsn: Lsn, ops: Vec<BucketOp>) -> Result<()>;

    /// Return ops for `bucket` with `op_id > after`, up to `limit` rows,
    /// in ascending op_id order.
    async fn scan(
        &self,
        group_id: &str,
        bucket: &str,
        after: OpId,
        limit: usize,
    ) -> Result<Vec<BucketOp>>;

    /// Sum the checksum contributions of every op in `bucket` within
    /// `(start, end]`, without materializing the rows (§4.3 relies on this
    /// being cheaper than a full `scan`), plus whether any matched op is a
    /// `CLEAR` (invariant 3: a range containing a `CLEAR` cannot be safely
    /// composed with an older cached prefix — the cache layer must treat it
    /// as a full checksum from 0 instead).
    async fn sum_checksum(
        &self,
        group_id: &str,
        bucket: &str,
        start: OpId,
        end: OpId,
    ) -> Result<(ChecksumTotal, bool)>;

    /// The most recently committed checkpoint for `group_id`, if any.
    async fn latest_checkpoint(&self, group_id: &str) -> Result<Option<Checkpoint>>;

    /// All distinct bucket names that have at least one op at or below
    /// `end`, used by the resolver to intersect requested buckets against
    /// buckets that actually have data (§4.5).
    async fn known_buckets(&self, group_id: &str, end: OpId) -> Result<Vec<String>>;
}
