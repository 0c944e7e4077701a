//! Component boundary: the storage adapter the sync pipeline consumes.
//!
//! Only described by the operations the pipeline actually calls (§4.2,
//! §6) — replication-source connectivity, the sync-rules DSL, and query
//! planning are out of scope and left to the embedding service, mirroring
//! how the teacher's `Checkpointer` trait describes a storage contract
//! without implementing the database it's backed by beyond the in-memory
//! and sqlite reference adapters.

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;

use crate::model::CurrentData;

/// Read/write access to the latest committed row snapshots the batch
/// writer diffs bucket membership against, and the resolver's dynamic
/// bucket queries run over (§3 `CurrentData`). Exclusively mutated by the
/// batch writer during a flush (§9); every other caller only reads through
/// the committed view.
#[async_trait]
pub trait CurrentDataStore: Send + Sync {
    async fn get(&self, group_id: &str, source_table: &str, source_key: &str) -> crate::Result<Option<CurrentData>>;

    async fn put(&self, row: CurrentData) -> crate::Result<()>;

    async fn delete(&self, group_id: &str, source_table: &str, source_key: &str) -> crate::Result<()>;

    /// Fetch up to `limit` rows of `source_table` not yet visited in this
    /// scan, keyed after `after_key` (empty string = start of scan), for
    /// `TRUNCATE`'s fixed-size batch sweep (§4.1).
    async fn scan_table(
        &self,
        group_id: &str,
        source_table: &str,
        after_key: &str,
        limit: usize,
    ) -> crate::Result<Vec<CurrentData>>;
}

/// Dependency-free reference `CurrentDataStore`, modeled on
/// [`crate::op_log::memory::InMemoryOperationLog`]'s single
/// `RwLock<FxHashMap<..>>` shape: suitable for tests and single-process
/// deployments, not for durability across restarts.
#[derive(Default)]
pub struct InMemoryCurrentDataStore {
    rows: RwLock<FxHashMap<(String, String, String), CurrentData>>,
}

impl InMemoryCurrentDataStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(group_id: &str, source_table: &str, source_key: &str) -> (String, String, String) {
        (group_id.to_string(), source_table.to_string(), source_key.to_string())
    }
}

#[async_trait]
impl CurrentDataStore for InMemoryCurrentDataStore {
    async fn get(&self, group_id: &str, source_table: &str, source_key: &str) -> crate::Result<Option<CurrentData>> {
        Ok(self.rows.read().await.get(&Self::key(group_id, source_table, source_key)).cloned())
    }

    async fn put(&self, row: CurrentData) -> crate::Result<()> {
        let key = Self::key(&row.group_id, &row.source_table, &row.source_key);
        self.rows.write().await.insert(key, row);
        Ok(())
    }

    async fn delete(&self, group_id: &str, source_table: &str, source_key: &str) -> crate::Result<()> {
        self.rows.write().await.remove(&Self::key(group_id, source_table, source_key));
        Ok(())
    }

    async fn scan_table(
        &self,
        group_id: &str,
        source_table: &str,
        after_key: &str,
        limit: usize,
    ) -> crate::Result<Vec<CurrentData>> {
        let rows = self.rows.read().await;
        let mut matching: Vec<&CurrentData> = rows
            .values()
            .filter(|r| r.group_id == group_id && r.source_table == source_table && r.source_key.as_str() > after_key)
            .collect();
        matching.sort_by(|a, b| a.source_key.cmp(&b.source_key));
        Ok(matching.into_iter().take(limit).cloned().collect())
    }
}
