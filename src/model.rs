//! Core data-model types shared across components (§3).
//!
//! Every entity derives `Serialize`/`Deserialize` so it can cross the
//! storage-adapter boundary and the wire, mirroring the teacher's convention
//! of deriving serde on all state/event types (`state.rs`, `event_bus::Event`).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Opaque, monotonically increasing 64-bit operation identifier.
///
/// Modeled as a newtype rather than a bare `u64` so the "encode as a decimal
/// string on the wire" requirement (§9 open question) is a property of the
/// type, not a convention every call site has to remember.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct OpId(pub u64);

impl OpId {
    pub const ZERO: OpId = OpId(0);

    #[must_use]
    pub fn next(self) -> OpId {
        OpId(self.0 + 1)
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OpId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(OpId(s.parse()?))
    }
}

impl Serialize for OpId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0.to_string())
    }
}

impl<'de> Deserialize<'de> for OpId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        use serde::de::Error;
        let raw = String::deserialize(deserializer)?;
        raw.parse().map(OpId).map_err(D::Error::custom)
    }
}

/// Opaque, monotonically orderable source-database log position.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub String);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Sync priority. `0` is highest and ships first within a checkpoint (§3, GLOSSARY).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(pub u8);

impl Priority {
    pub const HIGHEST: Priority = Priority(0);
    pub const LOWEST: Priority = Priority(3);

    pub fn is_lowest(self) -> bool {
        self.0 >= Self::LOWEST.0
    }
}

/// Lifecycle state of a `SyncRules` version (§3): a version is compiled
/// (`Processing`) while its initial snapshot streams in, becomes the one
/// connections read from (`Active`) once its first checkpoint commits,
/// and is retired (`Stop` then `Terminated`) when a newer version replaces
/// it (§4.1 commit policy).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncRulesState {
    #[default]
    Processing,
    Active,
    Stop,
    Terminated,
}

/// One kind of bucket operation (§3 `BucketOp`).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OpKind {
    Put,
    Remove,
    Move,
    Clear,
}

/// A single bucket operation, uniquely keyed by `(group_id, bucket_name, op_id)`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BucketOp {
    pub group_id: String,
    pub bucket: String,
    pub op_id: OpId,
    pub op: OpKind,
    /// Present for `PUT`/`REMOVE`; absent for `MOVE`/`CLEAR`.
    pub row_id: Option<RowId>,
    /// 32-bit checksum contribution of this op.
    pub checksum: i32,
    /// Serialized row payload; `None` for `REMOVE`/`MOVE`/`CLEAR`.
    pub data: Option<String>,
    /// For `MOVE`/`CLEAR`, the op_id this operation points past (§4.7
    /// `targetOp`), used to detect a checkpoint invalidated mid-fetch.
    pub target_op: Option<OpId>,
}

/// Identity of a replicated row within one bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RowId {
    pub object_type: String,
    pub object_id: String,
    /// Disambiguates multiple rows mapped to the same `(type, id)` by a
    /// single data query (e.g. a one-to-many fan-out).
    pub subkey: Option<String>,
}

/// Identity of a replicated source table (§3 `SourceTable`).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourceTableId {
    pub group_id: String,
    pub connection_id: String,
    pub relation_id: u32,
    pub schema: String,
    pub name: String,
    pub replica_id_columns: Vec<String>,
}

/// A bucket membership entry recorded in `CurrentData.buckets`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketMembership {
    pub bucket: String,
    pub table: String,
    pub row_id: RowId,
}

/// The latest known serialized form of a replicated row, plus the buckets it
/// currently belongs to and the parameter-lookup keys it produced (§3
/// `CurrentData`). Exclusively owned by the batch writer during a flush
/// (§9); read by the resolver only through the committed storage view.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CurrentData {
    pub group_id: String,
    pub source_table: String,
    pub source_key: String,
    pub data: serde_json::Value,
    pub buckets: Vec<BucketMembership>,
    pub lookups: Vec<Vec<u8>>,
}

/// A resolved parameter-lookup row driving dynamic bucket queries (§3
/// `ParameterRow`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ParameterRow {
    pub lookup: Vec<u8>,
    pub source_table: String,
    pub source_key: String,
    pub bucket_parameters: serde_json::Value,
}

/// `{ checkpoint: op_id, lsn: source_position }` (§3 `Checkpoint`).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub checkpoint: OpId,
    pub lsn: Lsn,
}

/// `{ bucket, count, checksum }`, the unit exchanged by the checksum cache
/// and emitted on the wire (§3 `BucketChecksum`).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumTotal {
    pub count: u64,
    /// Sum mod 2^32 of per-op checksums, stored as the wire's signed i32.
    pub checksum: i32,
}

impl ChecksumTotal {
    /// `checksum(a,c) = checksum(a,b) ⊞ checksum(b,c)` (invariant 2), using
    /// 32-bit two's-complement wraparound addition.
    #[must_use]
    pub fn compose(self, other: ChecksumTotal) -> ChecksumTotal {
        ChecksumTotal {
            count: self.count + other.count,
            checksum: self.checksum.wrapping_add(other.checksum),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketChecksum {
    pub bucket: String,
    pub bucket_checksum: ChecksumTotal,
    pub priority: Priority,
}
