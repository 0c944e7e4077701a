//! Tracing setup and structured-event helpers.
//!
//! Grounded on the teacher's `init_tracing` pattern repeated across its
//! `examples/*.rs` binaries (`errors_pretty.rs`, `demo3.rs`, ...): a
//! `tracing_subscriber::registry()` layered with `fmt::layer()` and
//! `tracing_error::ErrorLayer`, filtered through `EnvFilter`. Unlike the
//! teacher, which leaves subscriber init to each example binary, this crate
//! exposes [`init`] directly since an embedding service, not a demo, is the
//! expected caller.

use tracing_error::ErrorLayer;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

/// Installs a global `tracing` subscriber: ANSI-formatted output filtered by
/// `RUST_LOG` (defaulting to `info` for this crate), with span-trace capture
/// enabled for error contexts produced via `tracing-error`.
///
/// Idempotent in the sense that a second call is a no-op failure silently
/// ignored, matching embedding contexts (tests, multiple connections) that
/// may call it more than once.
pub fn init() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("syncpipe=info"));

    let _ = tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(true).with_ansi(true).boxed())
        .with(filter)
        .with(ErrorLayer::default())
        .try_init();
}

/// A priority-tagged checkpoint event, emitted by the orchestrator for each
/// bucket scan so operators can correlate a connection's stream with its
/// source checkpoint without re-deriving it from raw op_ids.
#[derive(Clone, Debug)]
pub struct CheckpointEvent {
    pub connection_id: String,
    pub checkpoint: crate::model::OpId,
    pub bucket: String,
    pub priority: crate::model::Priority,
}

impl std::fmt::Display for CheckpointEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "connection={} checkpoint={} bucket={} priority={}",
            self.connection_id, self.checkpoint, self.bucket, self.priority.0
        )
    }
}

/// Emits a `tracing::debug!` event for a checkpoint scan, mirroring the
/// `target:`-qualified events in the teacher's `event_bus::hub`.
pub fn record_checkpoint_event(event: &CheckpointEvent) {
    tracing::debug!(target: "syncpipe::checkpoint", %event, "bucket scan");
}

/// Reports a `ROW_TOO_LARGE` condition for operator visibility (S6): the row
/// itself is never handed to a client, only this event.
pub fn record_row_too_large(table: &str, limit_bytes: usize) {
    tracing::warn!(target: "syncpipe::replication", error_code = "ROW_TOO_LARGE", table, limit_bytes, "row exceeds size limit, replacing with placeholder");
}
