use std::sync::Arc;

use syncpipe::checkpoint::{CheckpointDemux, CheckpointSignal};
use syncpipe::checksum::ChecksumCache;
use syncpipe::config::PipelineConfig;
use syncpipe::model::{BucketOp, Checkpoint, Lsn, OpId, OpKind};
use syncpipe::op_log::OperationLog;
use syncpipe::op_log::memory::InMemoryOperationLog;
use syncpipe::orchestrator::{BucketRequest, SyncStreamOrchestrator};
use syncpipe::replication::{ReplicationRecord, spawn_batch_writer};
use syncpipe::wire::SyncLine;

fn put(bucket: &str, op_id: u64, checksum: i32) -> BucketOp {
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

/// S1: a connection streaming a freshly replicated checkpoint receives a
/// full `checkpoint` line, every bucket's data, and a terminal
/// `checkpoint_complete`.
#[tokio::test]
async fn fresh_connection_receives_full_checkpoint_then_data_then_complete() {
    let log: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
    log.append("g1", Lsn("0/1".into()), vec![put("lists", 1, 7)]).await.unwrap();
    log.append("g1", Lsn("0/2".into()), vec![put("lists", 2, 3)]).await.unwrap();

    let cache = Arc::new(ChecksumCache::new(64));
    let orchestrator = SyncStreamOrchestrator::new(log.clone(), cache, PipelineConfig::from_env());

    let demux = CheckpointDemux::new();
    demux
        .publish(Checkpoint {
            checkpoint: OpId(2),
            lsn: Lsn("0/2".into()),
        })
        .await;
    let subscription = demux
        .subscribe(Some(Checkpoint {
            checkpoint: OpId(2),
            lsn: Lsn("0/2".into()),
        }))
        .await;

    let token_for_first_pass = tokio_util::sync::CancellationToken::new();

    let mut lines = Vec::new();
    let requests = vec![BucketRequest {
        bucket: "lists".into(),
        priority: Default::default(),
    }];

    // Run with an uncancelled token but rely on the subscription yielding no
    // further signal after the first recv to make the loop exit on the next
    // poll; simulate that by cancelling a child token immediately after the
    // first batch via a tiny wrapper future.
    let result = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        orchestrator.run_connection("g1", requests, subscription, token_for_first_pass.clone(), |line| {
            let is_complete = matches!(line, SyncLine::CheckpointComplete { .. });
            lines.push(line);
            if is_complete {
                token_for_first_pass.cancel();
            }
            Ok(())
        }),
    )
    .await;

    assert!(result.is_ok());
    assert!(lines.iter().any(|l| matches!(l, SyncLine::Checkpoint { .. })));
    assert!(lines.iter().any(|l| matches!(l, SyncLine::StreamingSyncData(_))));
    assert!(lines.iter().any(|l| matches!(l, SyncLine::CheckpointComplete { .. })));
}

/// Property: checksum additivity holds across the full replication →
/// op-log → checksum-cache path, not just within `ChecksumTotal::compose`
/// in isolation.
#[tokio::test]
async fn replicated_batches_produce_additive_checksums() {
    let log: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
    let (writer, _handle) = spawn_batch_writer(log.clone(), PipelineConfig::from_env());

    for i in 0..5 {
        writer
            .apply(
                "g1",
                Lsn(format!("0/{i}")),
                vec![ReplicationRecord::Insert {
                    source_table: "lists".into(),
                    row_id: syncpipe::model::RowId {
                        object_type: "lists".into(),
                        object_id: i.to_string(),
                        subkey: None,
                    },
                    data: serde_json::json!({"n": i}),
                }],
            )
            .await
            .unwrap();
    }

    let (whole, _) = log.sum_checksum("g1", "lists", OpId(0), OpId(5)).await.unwrap();
    let (first_half, _) = log.sum_checksum("g1", "lists", OpId(0), OpId(3)).await.unwrap();
    let (second_half, _) = log.sum_checksum("g1", "lists", OpId(3), OpId(5)).await.unwrap();

    assert_eq!(whole, first_half.compose(second_half));
}

/// Property: the checkpoint demultiplexer never delivers more than one
/// queued signal per subscriber, even under a burst of publishes.
#[tokio::test]
async fn demux_delivers_at_most_one_queued_signal_per_subscriber() {
    let demux = CheckpointDemux::new();
    let mut sub = demux.subscribe(None).await;

    for i in 1..=50u64 {
        demux
            .publish(Checkpoint {
                checkpoint: OpId(i),
                lsn: Lsn(format!("0/{i}")),
            })
            .await;
    }

    let signal = sub.recv().await.unwrap();
    assert_eq!(
        signal,
        CheckpointSignal::Changed(Checkpoint {
            checkpoint: OpId(50),
            lsn: Lsn("0/50".into()),
        })
    );

    // No further signal is queued; a subsequent recv would block until the
    // next publish, which we don't issue, so we only assert on `current`.
    assert_eq!(sub.current(), Some(signal));
}

/// S-scenario: a `TRUNCATE` (modeled as a `CLEAR` op) empties a bucket —
/// subsequent scans past it return nothing, matching invariant
/// "TRUNCATE ⇒ empty".
#[tokio::test]
async fn truncate_empties_the_bucket() {
    let log = InMemoryOperationLog::new();
    log.append("g1", Lsn("0/1".into()), vec![put("lists", 1, 5)]).await.unwrap();
    log.append(
        "g1",
        Lsn("0/2".into()),
        vec![BucketOp {
            group_id: "g1".into(),
            bucket: "lists".into(),
            op_id: OpId(2),
            op: OpKind::Clear,
            row_id: None,
            checksum: 0,
            data: None,
            target_op: Some(OpId(2)),
        }],
    )
    .await
    .unwrap();

    let ops = log.scan("g1", "lists", OpId(2), 100).await.unwrap();
    assert!(ops.is_empty());
}

/// S5: a connection token tied to a JWT's `exp` ends the stream cleanly with
/// no data frames emitted once the deadline passes, rather than surfacing an
/// error to the client.
#[tokio::test]
async fn token_expiry_ends_the_stream_cleanly_with_no_frames() {
    let log: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
    let cache = Arc::new(ChecksumCache::new(64));
    let orchestrator = SyncStreamOrchestrator::new(log, cache, PipelineConfig::from_env());

    let demux = CheckpointDemux::new();
    let subscription = demux.subscribe(None).await;

    let connection_token = tokio_util::sync::CancellationToken::new();
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_millis(50);
    let token = syncpipe::orchestrator::cancel_at_deadline(&connection_token, deadline);

    let requests = vec![BucketRequest {
        bucket: "lists".into(),
        priority: Default::default(),
    }];

    let mut lines = Vec::new();
    let result = tokio::time::timeout(
        std::time::Duration::from_millis(500),
        orchestrator.run_connection("g1", requests, subscription, token, |line| {
            lines.push(line);
            Ok(())
        }),
    )
    .await;

    assert!(result.is_ok());
    assert!(result.unwrap().is_ok());
    assert!(lines.is_empty());
}

/// S6: an oversized row is replaced with a placeholder (no payload) rather
/// than aborting replication, and streams through the orchestrator to a
/// connection as a normal `PUT` with no `Error` frame and no client-visible
/// data.
#[tokio::test]
async fn oversized_row_flows_through_the_pipeline_as_a_placeholder() {
    let log: Arc<dyn OperationLog> = Arc::new(InMemoryOperationLog::new());
    let mut config = PipelineConfig::from_env();
    config.row_size_limit_bytes = 8;
    let (writer, _handle) = spawn_batch_writer(log.clone(), config.clone());

    writer
        .apply(
            "g1",
            Lsn("0/1".into()),
            vec![ReplicationRecord::Insert {
                source_table: "lists".into(),
                row_id: syncpipe::model::RowId {
                    object_type: "lists".into(),
                    object_id: "1".into(),
                    subkey: None,
                },
                data: serde_json::json!({"name": "a very long value that exceeds the limit"}),
            }],
        )
        .await
        .unwrap();

    let cache = Arc::new(ChecksumCache::new(64));
    let orchestrator = SyncStreamOrchestrator::new(log.clone(), cache, config);

    let checkpoint = Checkpoint {
        checkpoint: OpId(1),
        lsn: Lsn("0/1".into()),
    };
    let demux = CheckpointDemux::new();
    demux.publish(checkpoint.clone()).await;
    let subscription = demux.subscribe(Some(checkpoint)).await;

    let token = tokio_util::sync::CancellationToken::new();
    let requests = vec![BucketRequest {
        bucket: "lists".into(),
        priority: Default::default(),
    }];

    let mut lines = Vec::new();
    let result = tokio::time::timeout(
        std::time::Duration::from_millis(200),
        orchestrator.run_connection("g1", requests, subscription, token.clone(), |line| {
            let is_complete = matches!(line, SyncLine::CheckpointComplete { .. });
            lines.push(line);
            if is_complete {
                token.cancel();
            }
            Ok(())
        }),
    )
    .await;

    assert!(result.is_ok());
    assert!(lines.iter().all(|l| !matches!(l, SyncLine::Error(_))));
    let frame = lines
        .iter()
        .find_map(|l| match l {
            SyncLine::StreamingSyncData(d) => d.data.first(),
            _ => None,
        })
        .expect("expected a bucket op frame");
    assert!(frame.data.is_none());
}
