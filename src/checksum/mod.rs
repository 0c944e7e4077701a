//! Component C: the checksum cache.
//!
//! There is no direct teacher analog (the teacher's `reducers` module
//! composes `NodePartial` updates into `VersionedState`, not numeric
//! checksums), so this module is grounded on the teacher's general
//! `Arc<Mutex<..>>`-guarded shared-state pattern (`event_bus::bus::EventBus`
//! wraps its sink list in `Arc<Mutex<Vec<SinkEntry>>>`) combined with the
//! `lru` crate for bounded eviction — the pack's closest fit for a
//! size-bounded memoization cache. Composition itself reuses
//! [`crate::model::ChecksumTotal::compose`], mirroring the teacher's
//! additive reducer style (`reducers::map_merge`).

use std::collections::HashMap;
use std::sync::Arc;

use lru::LruCache;
use tokio::sync::{Mutex, Notify};

use crate::model::{ChecksumTotal, OpId};
use crate::op_log::{OperationLog, Result as OpLogResult};

/// `(bucket, end)` uniquely determines a cached `(0, end]` checksum total;
/// CLEAR operations invalidate everything below them (poison-to-full, see
/// [`ChecksumCache::note_clear`]), so the cache key never needs a `start`.
type CacheKey = (String, OpId);

/// One outstanding `sum_checksum` fetch, shared by every caller that
/// requests the same `(bucket, end]` range concurrently so the upstream
/// operation log is hit at most once per key (§4.3 dedup rule).
struct InFlight {
    notify: Arc<Notify>,
    result: Mutex<Option<OpLogResult<ChecksumTotal>>>,
}

/// Size-bounded memoizing layer over [`OperationLog::sum_checksum`].
///
/// A cached entry for `(bucket, end)` holds the checksum of the half-open
/// range `(0, end]`. Composing two cached entries with different `end`
/// values via [`ChecksumTotal::compose`] only produces a correct result
/// when no `CLEAR` has landed between them, so every `CLEAR` poisons the
/// whole per-bucket cache rather than being composed around.
///
/// Dedup rules (§4.3): at most one in-flight fetch per `(bucket, start,
/// end]`. A *serial* caller — one that arrives while no other fetch for the
/// same bucket is outstanding — exploits the cache by issuing only the
/// partial lookup `(cached_end, end]` and composing it onto the cached
/// prefix. A *concurrent* caller — one that arrives while a fetch for the
/// same bucket is already outstanding — cannot know whether that fetch will
/// land a usable prefix before it needs an answer, so it always issues a
/// full `(0, end]` fetch instead.
pub struct ChecksumCache {
    entries: Mutex<LruCache<CacheKey, ChecksumTotal>>,
    in_flight: Mutex<HashMap<CacheKey, Arc<InFlight>>>,
    /// Count of outstanding fetches per bucket, used to decide whether an
    /// arriving caller counts as "serial" (count == 0) or "concurrent"
    /// (count > 0) per the dedup rules above.
    bucket_in_flight: Mutex<HashMap<String, usize>>,
    /// Buckets with a `CLEAR` at or above the highest cached `end`; any hit
    /// against a poisoned bucket is treated as a miss until the bucket is
    /// re-primed from a fresh checkpoint.
    poisoned: Mutex<std::collections::HashSet<String>>,
}

impl ChecksumCache {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = std::num::NonZeroUsize::new(capacity.max(1)).expect("capacity > 0");
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            in_flight: Mutex::new(HashMap::new()),
            bucket_in_flight: Mutex::new(HashMap::new()),
            poisoned: Mutex::new(std::collections::HashSet::new()),
        }
    }

    /// Mark `bucket` as having a pending `CLEAR` at `op_id`, poisoning every
    /// cached total for it (§3 `CLEAR` semantics: checksum becomes "full"
    /// from 0, not additive with prior history).
    pub async fn note_clear(&self, bucket: &str) {
        self.poisoned.lock().await.insert(bucket.to_string());
    }

    /// Resolve the checksum of `(0, end]` for `bucket`, serving from cache
    /// when possible, coalescing concurrent identical fetches into one
    /// upstream call, and otherwise fetching only the missing suffix from
    /// `log.sum_checksum` when no concurrent fetch for this bucket is
    /// already outstanding.
    pub async fn get_or_fetch(
        &self,
        log: &dyn OperationLog,
        group_id: &str,
        bucket: &str,
        end: OpId,
    ) -> OpLogResult<ChecksumTotal> {
        let key: CacheKey = (bucket.to_string(), end);

        if !self.poisoned.lock().await.contains(bucket)
            && let Some(total) = self.entries.lock().await.get(&key).copied()
        {
            return Ok(total);
        }

        let (owns_fetch, entry) = {
            let mut in_flight = self.in_flight.lock().await;
            if let Some(existing) = in_flight.get(&key) {
                (false, Arc::clone(existing))
            } else {
                let entry = Arc::new(InFlight {
                    notify: Arc::new(Notify::new()),
                    result: Mutex::new(None),
                });
                in_flight.insert(key.clone(), Arc::clone(&entry));
                (true, entry)
            }
        };

        if !owns_fetch {
            entry.notify.notified().await;
            let result = entry.result.lock().await;
            return result
                .clone()
                .unwrap_or_else(|| Err(crate::op_log::OperationLogError::Backend {
                    message: "in-flight checksum fetch resolved without a result".into(),
                }));
        }

        let outcome = self.fetch_exclusive(log, group_id, bucket, end).await;

        if let Ok(total) = outcome {
            self.entries.lock().await.put(key.clone(), total);
            self.poisoned.lock().await.remove(bucket);
        }
        *entry.result.lock().await = Some(outcome.clone());
        entry.notify.notify_waiters();
        self.in_flight.lock().await.remove(&key);

        outcome
    }

    /// Performs the actual upstream fetch for `(bucket, end]` once this
    /// caller has won the right to do so, choosing a partial or full range
    /// per the serial-vs-concurrent dedup rule (§4.3).
    async fn fetch_exclusive(
        &self,
        log: &dyn OperationLog,
        group_id: &str,
        bucket: &str,
        end: OpId,
    ) -> OpLogResult<ChecksumTotal> {
        let is_serial = {
            let counts = self.bucket_in_flight.lock().await;
            counts.get(bucket).copied().unwrap_or(0) == 0
        };

        let cached_prefix = if is_serial && !self.poisoned.lock().await.contains(bucket) {
            self.highest_cached_prefix(bucket, end).await
        } else {
            None
        };

        *self.bucket_in_flight.lock().await.entry(bucket.to_string()).or_insert(0) += 1;
        let result = match cached_prefix {
            Some((base_end, base_total)) if base_end < end => {
                let (partial, has_clear) = log.sum_checksum(group_id, bucket, base_end, end).await?;
                if has_clear {
                    // A CLEAR landed inside the partial range: the prefix we
                    // had cached is no longer a valid base to compose onto
                    // (invariant 3), so fall back to a full fetch from 0.
                    log.sum_checksum(group_id, bucket, OpId::ZERO, end).await.map(|(total, _)| total)
                } else {
                    Ok(base_total.compose(partial))
                }
            }
            _ => log.sum_checksum(group_id, bucket, OpId::ZERO, end).await.map(|(total, _)| total),
        };

        let mut counts = self.bucket_in_flight.lock().await;
        if let Some(count) = counts.get_mut(bucket) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(bucket);
            }
        }

        result
    }

    /// The cached entry with the greatest `end` strictly below `target` for
    /// `bucket`, if any — the prefix a serial caller's partial fetch
    /// composes onto.
    async fn highest_cached_prefix(&self, bucket: &str, target: OpId) -> Option<(OpId, ChecksumTotal)> {
        let entries = self.entries.lock().await;
        entries
            .iter()
            .filter(|((b, end), _)| b == bucket && *end < target)
            .map(|((_, end), total)| (*end, *total))
            .max_by_key(|(end, _)| *end)
    }

    /// Current number of cached `(bucket, end)` totals, for diagnostics and
    /// the throughput benchmark.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BucketOp, Lsn, OpKind};
    use crate::op_log::memory::InMemoryOperationLog;

    async fn seeded_log() -> InMemoryOperationLog {
        let log = InMemoryOperationLog::new();
        for i in 1..=4u64 {
            log.append(
                "g1",
                Lsn("0/x".into()),
                vec![BucketOp {
                    group_id: "g1".into(),
                    bucket: "b1".into(),
                    op_id: OpId(i),
                    op: OpKind::Put,
                    row_id: None,
                    checksum: i as i32,
                    data: Some("{}".into()),
                    target_op: None,
                }],
            )
            .await
            .unwrap();
        }
        log
    }

    #[tokio::test]
    async fn repeated_fetch_is_served_from_cache() {
        let log = seeded_log().await;
        let cache = ChecksumCache::new(16);

        let first = cache.get_or_fetch(&log, "g1", "b1", OpId(4)).await.unwrap();
        assert_eq!(first.checksum, 10);
        assert_eq!(cache.len().await, 1);

        let second = cache.get_or_fetch(&log, "g1", "b1", OpId(4)).await.unwrap();
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn clear_poisons_and_forces_refetch() {
        let log = seeded_log().await;
        let cache = ChecksumCache::new(16);

        cache.get_or_fetch(&log, "g1", "b1", OpId(4)).await.unwrap();
        cache.note_clear("b1").await;

        // still resolves (log is unchanged), but goes through the fetch path again
        let total = cache.get_or_fetch(&log, "g1", "b1", OpId(4)).await.unwrap();
        assert_eq!(total.checksum, 10);
    }

    /// §4.3: a serial caller (no other fetch for the bucket outstanding)
    /// issuing `end=E1` then `end=E2>E1` exploits the cache, so the second
    /// call only asks the log for the partial `(E1, E2]` range — one full
    /// fetch, one partial fetch, never two fulls.
    #[tokio::test]
    async fn serial_calls_issue_one_full_and_one_partial_fetch() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct RecordingLog {
            inner: InMemoryOperationLog,
            ranges: Mutex<Vec<(OpId, OpId)>>,
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl OperationLog for RecordingLog {
            async fn next_op_id(&self, group_id: &str) -> OpLogResult<OpId> {
                self.inner.next_op_id(group_id).await
            }
            async fn append(&self, group_id: &str, checkpoint_lsn: Lsn, ops: Vec<BucketOp>) -> OpLogResult<()> {
                self.inner.append(group_id, checkpoint_lsn, ops).await
            }
            async fn scan(&self, group_id: &str, bucket: &str, after: OpId, limit: usize) -> OpLogResult<Vec<BucketOp>> {
                self.inner.scan(group_id, bucket, after, limit).await
            }
            async fn sum_checksum(
                &self,
                group_id: &str,
                bucket: &str,
                start: OpId,
                end: OpId,
            ) -> OpLogResult<(ChecksumTotal, bool)> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.ranges.lock().await.push((start, end));
                self.inner.sum_checksum(group_id, bucket, start, end).await
            }
            async fn latest_checkpoint(&self, group_id: &str) -> OpLogResult<Option<crate::model::Checkpoint>> {
                self.inner.latest_checkpoint(group_id).await
            }
            async fn known_buckets(&self, group_id: &str, end: OpId) -> OpLogResult<Vec<String>> {
                self.inner.known_buckets(group_id, end).await
            }
        }

        let log = RecordingLog {
            inner: seeded_log().await,
            ranges: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        };
        let cache = ChecksumCache::new(16);

        let first = cache.get_or_fetch(&log, "g1", "b1", OpId(2)).await.unwrap();
        let second = cache.get_or_fetch(&log, "g1", "b1", OpId(4)).await.unwrap();

        assert_eq!(log.calls.load(Ordering::SeqCst), 2);
        let ranges = log.ranges.lock().await.clone();
        assert_eq!(ranges, vec![(OpId::ZERO, OpId(2)), (OpId(2), OpId(4))]);

        let (whole, _) = log.inner.sum_checksum("g1", "b1", OpId::ZERO, OpId(4)).await.unwrap();
        assert_eq!(second, whole);
        assert_ne!(first, whole);
    }

    #[tokio::test]
    async fn concurrent_identical_fetches_hit_the_log_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingLog {
            inner: InMemoryOperationLog,
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl OperationLog for CountingLog {
            async fn next_op_id(&self, group_id: &str) -> OpLogResult<OpId> {
                self.inner.next_op_id(group_id).await
            }
            async fn append(
                &self,
                group_id: &str,
                checkpoint_lsn: Lsn,
                ops: Vec<BucketOp>,
            ) -> OpLogResult<()> {
                self.inner.append(group_id, checkpoint_lsn, ops).await
            }
            async fn scan(
                &self,
                group_id: &str,
                bucket: &str,
                after: OpId,
                limit: usize,
            ) -> OpLogResult<Vec<BucketOp>> {
                self.inner.scan(group_id, bucket, after, limit).await
            }
            async fn sum_checksum(
                &self,
                group_id: &str,
                bucket: &str,
                start: OpId,
                end: OpId,
            ) -> OpLogResult<(ChecksumTotal, bool)> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                self.inner.sum_checksum(group_id, bucket, start, end).await
            }
            async fn latest_checkpoint(&self, group_id: &str) -> OpLogResult<Option<crate::model::Checkpoint>> {
                self.inner.latest_checkpoint(group_id).await
            }
            async fn known_buckets(&self, group_id: &str, end: OpId) -> OpLogResult<Vec<String>> {
                self.inner.known_buckets(group_id, end).await
            }
        }

        let log = Arc::new(CountingLog {
            inner: seeded_log().await,
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ChecksumCache::new(16));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let log = Arc::clone(&log);
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache.get_or_fetch(log.as_ref(), "g1", "b1", OpId(4)).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
    }

    /// §4.3: two genuinely concurrent callers requesting *different* `end`
    /// values for the same bucket cannot exploit each other's partial
    /// progress, so each issues its own full `(0, end]` fetch.
    #[tokio::test]
    async fn concurrent_distinct_ends_each_issue_a_full_fetch() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct SlowLog {
            inner: InMemoryOperationLog,
            ranges: Mutex<Vec<(OpId, OpId)>>,
            calls: AtomicUsize,
        }

        #[async_trait::async_trait]
        impl OperationLog for SlowLog {
            async fn next_op_id(&self, group_id: &str) -> OpLogResult<OpId> {
                self.inner.next_op_id(group_id).await
            }
            async fn append(&self, group_id: &str, checkpoint_lsn: Lsn, ops: Vec<BucketOp>) -> OpLogResult<()> {
                self.inner.append(group_id, checkpoint_lsn, ops).await
            }
            async fn scan(&self, group_id: &str, bucket: &str, after: OpId, limit: usize) -> OpLogResult<Vec<BucketOp>> {
                self.inner.scan(group_id, bucket, after, limit).await
            }
            async fn sum_checksum(
                &self,
                group_id: &str,
                bucket: &str,
                start: OpId,
                end: OpId,
            ) -> OpLogResult<(ChecksumTotal, bool)> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                self.ranges.lock().await.push((start, end));
                tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                self.inner.sum_checksum(group_id, bucket, start, end).await
            }
            async fn latest_checkpoint(&self, group_id: &str) -> OpLogResult<Option<crate::model::Checkpoint>> {
                self.inner.latest_checkpoint(group_id).await
            }
            async fn known_buckets(&self, group_id: &str, end: OpId) -> OpLogResult<Vec<String>> {
                self.inner.known_buckets(group_id, end).await
            }
        }

        let log = Arc::new(SlowLog {
            inner: seeded_log().await,
            ranges: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        });
        let cache = Arc::new(ChecksumCache::new(16));

        let log_a = Arc::clone(&log);
        let cache_a = Arc::clone(&cache);
        let a = tokio::spawn(async move { cache_a.get_or_fetch(log_a.as_ref(), "g1", "b1", OpId(2)).await.unwrap() });

        // give `a` a head start so it is genuinely in flight when `b` arrives
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        let log_b = Arc::clone(&log);
        let cache_b = Arc::clone(&cache);
        let b = tokio::spawn(async move { cache_b.get_or_fetch(log_b.as_ref(), "g1", "b1", OpId(4)).await.unwrap() });

        let (_a, _b) = (a.await.unwrap(), b.await.unwrap());

        let ranges = log.ranges.lock().await.clone();
        assert_eq!(ranges.len(), 2);
        // Both fetches started from 0 — neither exploited the other's
        // in-flight progress as a prefix.
        assert!(ranges.iter().all(|(start, _)| *start == OpId::ZERO));
    }
}
