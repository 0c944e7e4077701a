//! In-memory `OperationLog`, modeled on the teacher's `InMemoryCheckpointer`
//! (single `RwLock<FxHashMap<..>>`, no history compaction).

use std::sync::RwLock;

use async_trait::async_trait;
use rustc_hash::FxHashMap;

use crate::model::{BucketOp, ChecksumTotal, Checkpoint, Lsn, OpId};

use super::{OperationLog, OperationLogError, Result};

#[derive(Default)]
struct GroupLog {
    next_op_id: u64,
    ops_by_bucket: FxHashMap<String, Vec<BucketOp>>,
    latest_checkpoint: Option<Checkpoint>,
}

/// Dependency-free default backend; suitable for tests and single-process
/// deployments where durability across restarts is not required.
#[derive(Default)]
pub struct InMemoryOperationLog {
    groups: RwLock<FxHashMap<String, GroupLog>>,
}

impl InMemoryOperationLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_read(&self) -> Result<std::sync::RwLockReadGuard<'_, FxHashMap<String, GroupLog>>> {
        self.groups.read().map_err(|e| OperationLogError::Backend {
            message: format!("lock poisoned: {e}"),
        })
    }

    fn lock_write(&self) -> Result<std::sync::RwLockWriteGuard<'_, FxHashMap<String, GroupLog>>> {
        self.groups.write().map_err(|e| OperationLogError::Backend {
            message: format!("lock poisoned: {e}"),
        })
    }
}

#[async_trait]
impl OperationLog for InMemoryOperationLog {
    async fn next_op_id(&self, group_id: &str) -> Result<OpId> {
        let groups = self.lock_read()?;
        Ok(OpId(groups.get(group_id).map(|g| g.next_op_id).unwrap_or(0) + 1))
    }

    async fn append(&self, group_id: &str, checkpoint_lsn: Lsn, ops: Vec<BucketOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let op_id = ops[0].op_id;
        let mut groups = self.lock_write()?;
        let group = groups.entry(group_id.to_string()).or_default();
        if op_id.0 != group.next_op_id + 1 {
            return Err(OperationLogError::Backend {
                message: format!(
                    "non-contiguous append: expected op_id {}, got {}",
                    group.next_op_id + 1,
                    op_id
                ),
            });
        }
        for op in &ops {
            if op.op_id != op_id {
                return Err(OperationLogError::Backend {
                    message: "all ops in one append batch must share an op_id".into(),
                });
            }
            group
                .ops_by_bucket
                .entry(op.bucket.clone())
                .or_default()
                .push(op.clone());
        }
        group.next_op_id = op_id.0;
        group.latest_checkpoint = Some(Checkpoint {
            checkpoint: op_id,
            lsn: checkpoint_lsn,
        });
        Ok(())
    }

    async fn scan(
        &self,
        group_id: &str,
        bucket: &str,
        after: OpId,
        limit: usize,
    ) -> Result<Vec<BucketOp>> {
        let groups = self.lock_read()?;
        let Some(group) = groups.get(group_id) else {
            return Ok(Vec::new());
        };
        let Some(ops) = group.ops_by_bucket.get(bucket) else {
            return Ok(Vec::new());
        };
        Ok(ops
            .iter()
            .filter(|op| op.op_id > after)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn sum_checksum(
        &self,
        group_id: &str,
        bucket: &str,
        start: OpId,
        end: OpId,
    ) -> Result<(ChecksumTotal, bool)> {
        if start > end {
            return Err(OperationLogError::InvalidRange { start, end });
        }
        let groups = self.lock_read()?;
        let Some(group) = groups.get(group_id) else {
            return Ok((ChecksumTotal::default(), false));
        };
        let Some(ops) = group.ops_by_bucket.get(bucket) else {
            return Ok((ChecksumTotal::default(), false));
        };
        let mut total = ChecksumTotal::default();
        let mut has_clear = false;
        for op in ops.iter().filter(|op| op.op_id > start && op.op_id <= end) {
            total = total.compose(ChecksumTotal {
                count: 1,
                checksum: op.checksum,
            });
            has_clear |= op.op == crate::model::OpKind::Clear;
        }
        Ok((total, has_clear))
    }

    async fn latest_checkpoint(&self, group_id: &str) -> Result<Option<Checkpoint>> {
        let groups = self.lock_read()?;
        Ok(groups.get(group_id).and_then(|g| g.latest_checkpoint.clone()))
    }

    async fn known_buckets(&self, group_id: &str, end: OpId) -> Result<Vec<String>> {
        let groups = self.lock_read()?;
        let Some(group) = groups.get(group_id) else {
            return Ok(Vec::new());
        };
        Ok(group
            .ops_by_bucket
            .iter()
            .filter(|(_, ops)| ops.iter().any(|op| op.op_id <= end))
            .map(|(bucket, _)| bucket.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OpKind;

    fn op(bucket: &str, op_id: u64, checksum: i32) -> BucketOp {
        BucketOp {
            group_id: "g1".into(),
            bucket: bucket.into(),
            op_id: OpId(op_id),
            op: OpKind::Put,
            row_id: None,
            checksum,
            data: Some("{}".into()),
            target_op: None,
        }
    }

    #[tokio::test]
    async fn append_then_scan_returns_ops_in_order() {
        let log = InMemoryOperationLog::new();
        log.append("g1", Lsn("0/1".into()), vec![op("b1", 1, 5)]).await.unwrap();
        log.append("g1", Lsn("0/2".into()), vec![op("b1", 2, 7)]).await.unwrap();

        let ops = log.scan("g1", "b1", OpId(0), 10).await.unwrap();
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].op_id, OpId(1));
        assert_eq!(ops[1].op_id, OpId(2));
    }

    #[tokio::test]
    async fn sum_checksum_is_additive_across_split_ranges() {
        let log = InMemoryOperationLog::new();
        for i in 1..=5u64 {
            log.append("g1", Lsn("0/x".into()), vec![op("b1", i, i as i32)])
                .await
                .unwrap();
        }
        let (whole, _) = log.sum_checksum("g1", "b1", OpId(0), OpId(5)).await.unwrap();
        let (first, _) = log.sum_checksum("g1", "b1", OpId(0), OpId(3)).await.unwrap();
        let (second, _) = log.sum_checksum("g1", "b1", OpId(3), OpId(5)).await.unwrap();
        assert_eq!(whole, first.compose(second));
    }

    #[tokio::test]
    async fn non_contiguous_append_is_rejected() {
        let log = InMemoryOperationLog::new();
        log.append("g1", Lsn("0/1".into()), vec![op("b1", 1, 1)]).await.unwrap();
        let err = log.append("g1", Lsn("0/2".into()), vec![op("b1", 3, 1)]).await;
        assert!(err.is_err());
    }
}
