//! Component G: the sync stream orchestrator.
//!
//! Ties the checkpoint demultiplexer (D), checksum cache (C), bucket
//! parameter resolver (E), and per-connection state (F) into the
//! per-connection fetch loop (§4.7). Grounded on the teacher's
//! `runtimes::runner` + `runtimes::streaming` pair — a central driver type
//! owning the long-running loop, paired with a small helper module for
//! stream teardown bookkeeping (`finalize_event_stream`) — generalized here
//! with `tokio_util::sync::CancellationToken` nesting and a
//! `tokio::sync::Semaphore` gate, neither of which the teacher needs since
//! it drives one in-process graph run rather than many concurrent network
//! connections (§9 design note).

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::checkpoint::{CheckpointSignal, CheckpointSubscription};
use crate::checksum::ChecksumCache;
use crate::config::PipelineConfig;
use crate::connection::ConnectionState;
use crate::error::SyncStreamError;
use crate::model::{BucketChecksum, OpId, Priority};
use crate::op_log::OperationLog;
use crate::wire::{BucketOpFrame, StreamingSyncData, SyncLine};

/// Bucket subscriptions requested for one connection, grouped by priority
/// (§4.7: buckets stream highest priority first within a checkpoint).
#[derive(Clone, Debug)]
pub struct BucketRequest {
    pub bucket: String,
    pub priority: Priority,
}

/// Drives one connection's sync stream: subscribes to checkpoint changes,
/// streams bucket data in priority order, and emits the wire frames an
/// embedding transport forwards to the client.
pub struct SyncStreamOrchestrator {
    op_log: Arc<dyn OperationLog>,
    checksum_cache: Arc<ChecksumCache>,
    semaphore: Arc<tokio::sync::Semaphore>,
    config: PipelineConfig,
}

/// Derives a child of `parent` that is also cancelled when `deadline` is
/// reached, whichever happens first — used to tie a connection's token to
/// its JWT's `exp` claim (component H, §4.7: "token-expiry stream"). Spawns
/// a background task for the deadline race rather than threading a timer
/// through `run_connection`'s `select!`, so callers that don't need token
/// expiry (e.g. tests) can keep using a plain `CancellationToken`.
pub fn cancel_at_deadline(parent: &CancellationToken, deadline: tokio::time::Instant) -> CancellationToken {
    let token = parent.child_token();
    let child = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => child.cancel(),
            _ = child.cancelled() => {}
        }
    });
    token
}

impl SyncStreamOrchestrator {
    #[must_use]
    pub fn new(op_log: Arc<dyn OperationLog>, checksum_cache: Arc<ChecksumCache>, config: PipelineConfig) -> Self {
        let semaphore = Arc::new(tokio::sync::Semaphore::new(config.max_active_connections));
        Self {
            op_log,
            checksum_cache,
            semaphore,
            config,
        }
    }

    /// Run one connection to completion or cancellation, invoking `emit`
    /// for every wire frame produced. `connection_token` cancels the whole
    /// connection (e.g. client disconnect or token expiry); each checkpoint
    /// batch gets its own child token so a mid-stream rules change can tear
    /// down just the in-flight batch without severing the connection
    /// (§4.7 nested cancellation scopes).
    #[instrument(skip(self, group_id, requested, checkpoints, emit, connection_token))]
    pub async fn run_connection(
        &self,
        group_id: &str,
        requested: Vec<BucketRequest>,
        mut checkpoints: CheckpointSubscription<'_>,
        connection_token: CancellationToken,
        mut emit: impl FnMut(SyncLine) -> crate::Result<()>,
    ) -> crate::Result<()> {
        let mut state = ConnectionState::new();

        loop {
            tokio::select! {
                _ = connection_token.cancelled() => return Ok(()),
                signal = checkpoints.recv() => {
                    match signal {
                        None | Some(CheckpointSignal::UpstreamClosed) => return Ok(()),
                        Some(CheckpointSignal::UpstreamError(message)) => {
                            emit(SyncLine::Error(crate::error::WireError {
                                error_code: "UPSTREAM_ERROR".into(),
                                message,
                                hint: None,
                            }))?;
                            return Ok(());
                        }
                        Some(CheckpointSignal::Changed(checkpoint)) => {
                            let batch_token = connection_token.child_token();
                            self.stream_checkpoint(
                                group_id,
                                &requested,
                                checkpoint,
                                &mut state,
                                &batch_token,
                                &checkpoints,
                                &mut emit,
                            )
                            .await?;
                        }
                    }
                }
            }
        }
    }

    async fn stream_checkpoint(
        &self,
        group_id: &str,
        requested: &[BucketRequest],
        checkpoint: crate::model::Checkpoint,
        state: &mut ConnectionState,
        batch_token: &CancellationToken,
        checkpoints: &CheckpointSubscription<'_>,
        emit: &mut impl FnMut(SyncLine) -> crate::Result<()>,
    ) -> crate::Result<()> {
        // Captured before `begin_checkpoint` below, which unconditionally
        // overwrites `previous_checkpoint` — reading it afterwards would
        // always see `Some` and this connection would never emit the
        // `checkpoint_diff` line §4.6 step 4 mandates past its first line.
        let is_first_line = state.previous_checkpoint.is_none();

        let buckets: Vec<String> = requested.iter().map(|b| b.bucket.clone()).collect();
        state.begin_checkpoint(checkpoint.checkpoint, buckets, self.config.max_buckets_per_connection)?;

        let mut totals = rustc_hash::FxHashMap::default();
        for request in requested {
            let total = self
                .checksum_cache
                .get_or_fetch(self.op_log.as_ref(), group_id, &request.bucket, checkpoint.checkpoint)
                .await
                .map_err(|e| crate::error::StorageError::FatalStorageError { message: e.to_string() })?;
            totals.insert(request.bucket.clone(), total);
        }

        let diff = state.diff_against(&totals);
        if is_first_line || diff.len() == totals.len() {
            emit(SyncLine::Checkpoint {
                checkpoint: checkpoint.clone(),
                buckets: requested
                    .iter()
                    .map(|r| BucketChecksum {
                        bucket: r.bucket.clone(),
                        bucket_checksum: totals[&r.bucket],
                        priority: r.priority,
                    })
                    .collect(),
            })?;
        } else if !diff.is_empty() {
            // A bucket the previous line reported but that carries no
            // checksum this time around has dropped out of the requested
            // set entirely (§4.6, §6 `checkpoint_diff.removed_buckets`) —
            // distinct from `diff`, which only lists buckets whose checksum
            // changed but that are still present.
            let removed_buckets: Vec<String> = state
                .last_checksums
                .keys()
                .filter(|bucket| !totals.contains_key(bucket.as_str()))
                .cloned()
                .collect();

            emit(SyncLine::CheckpointDiff {
                checkpoint: checkpoint.clone(),
                updated_buckets: diff
                    .iter()
                    .map(|b| BucketChecksum {
                        bucket: b.clone(),
                        bucket_checksum: totals[b],
                        priority: requested.iter().find(|r| &r.bucket == b).map(|r| r.priority).unwrap_or_default(),
                    })
                    .collect(),
                removed_buckets,
            })?;
        }

        let mut sorted = requested.to_vec();
        sorted.sort_by_key(|b| b.priority);

        let mut synced_ops: u64 = 0;
        let mut current_priority = None;

        for request in &sorted {
            if batch_token.is_cancelled() {
                return Ok(());
            }

            let _permit = tokio::time::timeout(self.config.semaphore_timeout, self.semaphore.acquire())
                .await
                .map_err(|_| SyncStreamError::SyncTimeout {
                    timeout_secs: self.config.semaphore_timeout.as_secs_f64(),
                })?
                .map_err(|_| SyncStreamError::SyncTimeout {
                    timeout_secs: self.config.semaphore_timeout.as_secs_f64(),
                })?;

            self.stream_bucket(group_id, request, checkpoint.checkpoint, state, emit).await?;
            synced_ops += totals[&request.bucket].count;

            if current_priority != Some(request.priority) {
                if let Some(done_priority) = current_priority
                    && synced_ops >= self.config.preemption_ops_threshold
                {
                    emit(SyncLine::PartialCheckpointComplete {
                        checkpoint: checkpoint.clone(),
                        priority: done_priority,
                    })?;

                    // Speculative mid-checkpoint preemption (§4.7): the
                    // checkpoint mailbox already holds whatever the last
                    // publish left behind, so peeking at it costs nothing —
                    // no actual race is needed, since `watch` never loses the
                    // latest value. A newer checkpoint waiting here means
                    // this batch is obsolete; abandon it without emitting a
                    // final `checkpoint_complete` and let the outer loop
                    // pick the newer one up on its next `recv`.
                    if let Some(CheckpointSignal::Changed(newer)) = checkpoints.current()
                        && newer.checkpoint > checkpoint.checkpoint
                    {
                        batch_token.cancel();
                        return Ok(());
                    }
                }
                current_priority = Some(request.priority);
            }
        }

        emit(SyncLine::CheckpointComplete { checkpoint })?;
        Ok(())
    }

    /// Page size for one `op_log` scan within a bucket. Chosen independently
    /// of `truncate_scan_batch` (that batch size governs a different scan —
    /// replication's `current_data` sweep on `TRUNCATE`, not this one).
    const BUCKET_SCAN_PAGE: usize = 1_000;

    async fn stream_bucket(
        &self,
        group_id: &str,
        request: &BucketRequest,
        target: OpId,
        state: &mut ConnectionState,
        emit: &mut impl FnMut(SyncLine) -> crate::Result<()>,
    ) -> crate::Result<()> {
        let mut after = state.bucket_data_positions.get(&request.bucket).copied().unwrap_or(OpId::ZERO);
        let mut pending_bytes = 0usize;

        crate::telemetry::record_checkpoint_event(&crate::telemetry::CheckpointEvent {
            connection_id: state.connection_id.clone(),
            checkpoint: target,
            bucket: request.bucket.clone(),
            priority: request.priority,
        });

        loop {
            let ops = self
                .op_log
                .scan(group_id, &request.bucket, after, Self::BUCKET_SCAN_PAGE)
                .await
                .map_err(|e| crate::error::StorageError::FatalStorageError { message: e.to_string() })?;

            let relevant: Vec<_> = ops.iter().take_while(|op| op.op_id <= target).collect();
            let scanned_all_relevant = relevant.len() == ops.len();
            let next_after = relevant.last().map(|op| op.op_id).unwrap_or(after);
            // Another page remains only if this page was entirely relevant
            // and filled (i.e. there may be more rows past it) and we
            // haven't yet reached `target`.
            let has_more = scanned_all_relevant && ops.len() == Self::BUCKET_SCAN_PAGE && next_after < target;

            let frame = StreamingSyncData {
                bucket: request.bucket.clone(),
                data: relevant
                    .iter()
                    .map(|op| BucketOpFrame {
                        op_id: op.op_id,
                        op: op.op,
                        object_type: op.row_id.as_ref().map(|r| r.object_type.clone()),
                        object_id: op.row_id.as_ref().map(|r| r.object_id.clone()),
                        checksum: op.checksum,
                        data: op
                            .data
                            .as_deref()
                            .and_then(|d| serde_json::value::RawValue::from_string(d.to_string()).ok()),
                    })
                    .collect(),
                has_more,
                after,
                next_after,
            };

            let frame_size = frame.data.iter().map(|f| f.data.as_ref().map_or(0, |d| d.get().len())).sum::<usize>();
            emit(SyncLine::StreamingSyncData(frame))?;

            pending_bytes += frame_size;
            if pending_bytes >= self.config.flush_hint_threshold_bytes {
                emit(SyncLine::FlushHint)?;
                pending_bytes = 0;
            }

            after = next_after;
            if !has_more {
                break;
            }
            tokio::time::sleep(self.config.post_scan_yield).await;
        }

        let checksum = self
            .checksum_cache
            .get_or_fetch(self.op_log.as_ref(), group_id, &request.bucket, target)
            .await
            .map_err(|e| crate::error::StorageError::FatalStorageError { message: e.to_string() })?;

        state.mark_bucket_synced(&request.bucket, after, checksum);
        Ok(())
    }
}
