//! Wire frame types exchanged over a sync stream (§6).
//!
//! The teacher has no network wire format of its own (its streaming surface
//! is an in-process `EventStream`), so these types are grounded on the
//! pack's JSON-over-the-wire conventions more broadly and on
//! `serde_json`'s `raw_value` feature, which the default encoder below
//! relies on to preserve large integers (e.g. op_ids embedded in bucket
//! data) exactly as the storage layer produced them rather than round-
//! tripping them through `f64`.

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::error::WireError;
use crate::model::{BucketChecksum, Checkpoint, OpId};

/// One frame of the sync stream protocol (§6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncLine {
    /// A full checkpoint: every bucket's checksum, replacing any prior
    /// checkpoint line the client holds.
    Checkpoint {
        checkpoint: Checkpoint,
        buckets: Vec<BucketChecksum>,
    },
    /// An incremental checkpoint: only buckets whose checksum changed
    /// since the last line (§4.6 `diff_against`).
    CheckpointDiff {
        checkpoint: Checkpoint,
        updated_buckets: Vec<BucketChecksum>,
        removed_buckets: Vec<String>,
    },
    /// All buckets for the current checkpoint have been fully streamed.
    CheckpointComplete { checkpoint: Checkpoint },
    /// A subset of buckets have been fully streamed for the current
    /// checkpoint; more remain (§4.7 priority-ordered partial completion).
    PartialCheckpointComplete {
        checkpoint: Checkpoint,
        priority: crate::model::Priority,
    },
    /// A batch of operations for one bucket.
    StreamingSyncData(StreamingSyncData),
    /// A sentinel suggesting the transport flush buffered frames now
    /// (§4.7, emitted once accumulated frame size crosses
    /// `flush_hint_threshold_bytes`).
    FlushHint,
    /// Terminal error frame in place of any further data (§6, §7).
    Error(WireError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingSyncData {
    pub bucket: String,
    pub data: Vec<BucketOpFrame>,
    /// `true` once this batch reaches `bucket_data_positions`'s target,
    /// i.e. the bucket is fully synced for the requested range.
    pub has_more: bool,
    pub after: OpId,
    pub next_after: OpId,
}

/// One operation as it appears in a `StreamingSyncData` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketOpFrame {
    pub op_id: OpId,
    pub op: crate::model::OpKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
    pub checksum: i32,
    /// Row payload retained verbatim as a `RawValue` so re-serialization
    /// never rewrites the storage layer's own JSON encoding (e.g. its
    /// integer formatting), matching §6's "default" encoding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

/// The three row-payload encodings a connection may request (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PayloadEncoding {
    /// Big-int-preserving JSON via `RawValue` (default).
    #[default]
    Json,
    /// The storage adapter's raw serialized bytes, passed through
    /// unparsed.
    RawData,
    /// BSON-encoded binary payload.
    BinaryData,
}

pub trait Encoder: Send + Sync {
    fn encoding(&self) -> PayloadEncoding;
    fn encode_line(&self, line: &SyncLine) -> crate::Result<Vec<u8>>;
}

/// Default encoder: newline-delimited JSON, one `SyncLine` per line, row
/// payloads preserved as `RawValue`.
#[derive(Default)]
pub struct JsonLinesEncoder;

impl Encoder for JsonLinesEncoder {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::Json
    }

    fn encode_line(&self, line: &SyncLine) -> crate::Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec(line).map_err(|e| {
            crate::error::StorageError::FatalStorageError {
                message: format!("encode sync line: {e}"),
            }
        })?;
        bytes.push(b'\n');
        Ok(bytes)
    }
}

/// `raw_data` encoding (§6): identical framing to [`JsonLinesEncoder`], but a
/// connection requesting this encoding is promising its transport will pass
/// `BucketOpFrame::data` through byte-for-byte rather than re-parsing it —
/// there's nothing this encoder does differently at the JSON layer itself,
/// since the storage adapter's raw bytes are already what `RawValue` carries.
/// Kept as its own type so a connection's requested encoding round-trips
/// through [`Encoder::encoding`] for protocol negotiation.
#[derive(Default)]
pub struct RawDataEncoder;

impl Encoder for RawDataEncoder {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::RawData
    }

    fn encode_line(&self, line: &SyncLine) -> crate::Result<Vec<u8>> {
        JsonLinesEncoder.encode_line(line)
    }
}

/// `binary_data` encoding (§6): each frame is BSON-encoded rather than
/// newline-delimited JSON, length-prefixed so a reader can split the stream
/// without scanning for delimiters — BSON documents self-describe their own
/// length as their first four bytes, so no extra framing is needed beyond
/// emitting the document bytes back to back.
#[derive(Default)]
pub struct BinaryDataEncoder;

impl Encoder for BinaryDataEncoder {
    fn encoding(&self) -> PayloadEncoding {
        PayloadEncoding::BinaryData
    }

    fn encode_line(&self, line: &SyncLine) -> crate::Result<Vec<u8>> {
        bson::to_vec(line).map_err(|e| {
            crate::error::StorageError::FatalStorageError {
                message: format!("bson-encode sync line: {e}"),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Checkpoint, Lsn, OpId};

    fn sample_line() -> SyncLine {
        SyncLine::CheckpointComplete {
            checkpoint: Checkpoint {
                checkpoint: OpId(1),
                lsn: Lsn("0/1".into()),
            },
        }
    }

    #[test]
    fn json_lines_encoder_newline_terminates_each_frame() {
        let bytes = JsonLinesEncoder.encode_line(&sample_line()).unwrap();
        assert_eq!(*bytes.last().unwrap(), b'\n');
    }

    #[test]
    fn raw_data_encoder_reports_its_own_encoding_but_shares_framing() {
        let encoder = RawDataEncoder;
        assert_eq!(encoder.encoding(), PayloadEncoding::RawData);
        assert_eq!(encoder.encode_line(&sample_line()).unwrap(), JsonLinesEncoder.encode_line(&sample_line()).unwrap());
    }

    #[test]
    fn binary_data_encoder_produces_a_valid_bson_document() {
        let bytes = BinaryDataEncoder.encode_line(&sample_line()).unwrap();
        let doc = bson::Document::from_reader(&mut bytes.as_slice()).unwrap();
        assert_eq!(doc.get_str("type").unwrap(), "checkpoint_complete");
    }
}
