//! Component F: per-connection checkpoint state.
//!
//! Grounded on the teacher's `runtimes::session::SessionState`: a plain,
//! cloneable struct holding everything needed to resume a unit of work —
//! here a sync connection rather than a graph run — plus an enum
//! (`SessionInit` there, [`ConnectionInit`] here) distinguishing a fresh
//! start from a resumed one.

use rustc_hash::FxHashMap;

use crate::model::{ChecksumTotal, OpId};

/// Indicates whether a connection is starting fresh or resuming from a
/// client-supplied checkpoint cursor (§4.6).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionInit {
    Fresh,
    Resumed { last_checkpoint: OpId },
}

/// Everything the orchestrator needs to compute the next checkpoint line
/// for one connection (§4.6 `build_next_checkpoint_line`).
#[derive(Debug, Clone)]
pub struct ConnectionState {
    /// Identifies this connection in telemetry, independent of any
    /// upstream-assigned session token.
    pub connection_id: String,
    /// Checksum totals the client has already been told about, per bucket.
    pub last_checksums: FxHashMap<String, ChecksumTotal>,
    /// The checkpoint this connection last emitted a complete line for.
    pub previous_checkpoint: Option<OpId>,
    /// Per-bucket read cursor: the op_id each bucket's next `bucketData`
    /// fetch should resume after.
    pub bucket_data_positions: FxHashMap<String, OpId>,
    /// Buckets requested by the client but not yet fully streamed for the
    /// current checkpoint.
    pub pending_bucket_downloads: Vec<String>,
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self {
            connection_id: uuid::Uuid::new_v4().to_string(),
            last_checksums: FxHashMap::default(),
            previous_checkpoint: None,
            bucket_data_positions: FxHashMap::default(),
            pending_bucket_downloads: Vec::new(),
        }
    }
}

impl ConnectionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `bucket` has been fully streamed up to `end`, clearing
    /// it from the pending set and advancing its cursor.
    pub fn mark_bucket_synced(&mut self, bucket: &str, end: OpId, checksum: ChecksumTotal) {
        self.bucket_data_positions.insert(bucket.to_string(), end);
        self.last_checksums.insert(bucket.to_string(), checksum);
        self.pending_bucket_downloads.retain(|b| b != bucket);
    }

    /// Compute the buckets whose checksum changed (or are new) between the
    /// previous checkpoint line and `next`, i.e. the buckets a
    /// `checkpoint_diff` frame must include rather than a full
    /// `checkpoint` (§4.6, §6).
    pub fn diff_against(&self, next: &FxHashMap<String, ChecksumTotal>) -> Vec<String> {
        next.iter()
            .filter(|(bucket, total)| self.last_checksums.get(*bucket) != Some(*total))
            .map(|(bucket, _)| bucket.clone())
            .collect()
    }

    /// Reset pending downloads to `buckets` ahead of streaming a new
    /// checkpoint, enforcing the per-connection bucket cap (§4.6).
    pub fn begin_checkpoint(&mut self, checkpoint: OpId, buckets: Vec<String>, limit: usize) -> crate::Result<()> {
        if buckets.len() > limit {
            return Err(crate::error::SyncStreamError::TooManyBuckets {
                requested: buckets.len(),
                limit,
            }
            .into());
        }
        self.previous_checkpoint = Some(checkpoint);
        self.pending_bucket_downloads = buckets;
        Ok(())
    }

    pub fn is_checkpoint_complete(&self) -> bool {
        self.pending_bucket_downloads.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_against_reports_only_changed_buckets() {
        let mut state = ConnectionState::new();
        state.last_checksums.insert("a".into(), ChecksumTotal { count: 1, checksum: 1 });
        state.last_checksums.insert("b".into(), ChecksumTotal { count: 2, checksum: 2 });

        let mut next = FxHashMap::default();
        next.insert("a".to_string(), ChecksumTotal { count: 1, checksum: 1 });
        next.insert("b".to_string(), ChecksumTotal { count: 3, checksum: 9 });
        next.insert("c".to_string(), ChecksumTotal { count: 1, checksum: 5 });

        let mut changed = state.diff_against(&next);
        changed.sort();
        assert_eq!(changed, vec!["b".to_string(), "c".to_string()]);
    }

    #[test]
    fn begin_checkpoint_rejects_over_limit_bucket_sets() {
        let mut state = ConnectionState::new();
        let buckets = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let err = state.begin_checkpoint(OpId(1), buckets, 2);
        assert!(err.is_err());
    }
}
