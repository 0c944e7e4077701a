//! SQLite-backed `OperationLog`, grounded on the teacher's
//! `runtimes::checkpointer_sqlite::SQLiteCheckpointer`: a `SqlitePool`
//! wrapped in `Arc`, `#[instrument(skip(...), err)]` on every method, schema
//! applied on connect. Unlike the teacher's checkpointer (one row per
//! session), the log's `ops` table is append-only and indexed by
//! `(group_id, bucket, op_id)` to support range scans.

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{Row, SqlitePool, sqlite::SqliteRow};
use tracing::instrument;

use crate::model::{BucketOp, ChecksumTotal, Checkpoint, Lsn, OpId, OpKind};

use super::{OperationLog, OperationLogError, Result};

pub struct SqliteOperationLog {
    pool: Arc<SqlitePool>,
}

impl std::fmt::Debug for SqliteOperationLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteOperationLog").finish()
    }
}

fn backend_err(context: &str) -> impl Fn(sqlx::Error) -> OperationLogError + '_ {
    move |e| OperationLogError::Backend {
        message: format!("{context}: {e}"),
    }
}

fn encode_op_kind(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Put => "PUT",
        OpKind::Remove => "REMOVE",
        OpKind::Move => "MOVE",
        OpKind::Clear => "CLEAR",
    }
}

fn decode_op_kind(raw: &str) -> OpKind {
    match raw {
        "PUT" => OpKind::Put,
        "REMOVE" => OpKind::Remove,
        "MOVE" => OpKind::Move,
        _ => OpKind::Clear,
    }
}

fn row_to_op(row: &SqliteRow) -> Result<BucketOp> {
    let row_id_json: Option<String> = row.try_get("row_id_json").map_err(backend_err("row_id_json"))?;
    let row_id = row_id_json
        .map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| OperationLogError::Backend {
            message: format!("decode row_id: {e}"),
        })?;
    Ok(BucketOp {
        group_id: row.try_get("group_id").map_err(backend_err("group_id"))?,
        bucket: row.try_get("bucket").map_err(backend_err("bucket"))?,
        op_id: OpId(row.try_get::<i64, _>("op_id").map_err(backend_err("op_id"))? as u64),
        op: decode_op_kind(row.try_get::<String, _>("op_kind").map_err(backend_err("op_kind"))?.as_str()),
        row_id,
        checksum: row.try_get::<i64, _>("checksum").map_err(backend_err("checksum"))? as i32,
        data: row.try_get("data").map_err(backend_err("data"))?,
        target_op: row
            .try_get::<Option<i64>, _>("target_op")
            .map_err(backend_err("target_op"))?
            .map(|v| OpId(v as u64)),
    })
}

impl SqliteOperationLog {
    /// Connect (or create) a SQLite database at `database_url` and apply
    /// the log schema. Example: `sqlite://syncpipe.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> std::result::Result<Self, OperationLogError> {
        let pool = SqlitePool::connect(database_url)
            .await
            .map_err(backend_err("connect"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS op_sequence (
                group_id TEXT PRIMARY KEY,
                next_op_id INTEGER NOT NULL,
                checkpoint_lsn TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(backend_err("create op_sequence"))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ops (
                group_id TEXT NOT NULL,
                bucket TEXT NOT NULL,
                op_id INTEGER NOT NULL,
                op_kind TEXT NOT NULL,
                row_id_json TEXT,
                checksum INTEGER NOT NULL,
                data TEXT,
                target_op INTEGER,
                PRIMARY KEY (group_id, bucket, op_id)
            )
            "#,
        )
        .execute(&pool)
        .await
        .map_err(backend_err("create ops"))?;

        sqlx::query("CREATE INDEX IF NOT EXISTS ops_by_group_bucket ON ops (group_id, bucket, op_id)")
            .execute(&pool)
            .await
            .map_err(backend_err("create index"))?;

        Ok(Self { pool: Arc::new(pool) })
    }
}

#[async_trait]
impl OperationLog for SqliteOperationLog {
    #[instrument(skip(self), err)]
    async fn next_op_id(&self, group_id: &str) -> Result<OpId> {
        let row: Option<SqliteRow> = sqlx::query("SELECT next_op_id FROM op_sequence WHERE group_id = ?1")
            .bind(group_id)
            .fetch_optional(&*self.pool)
            .await
            .map_err(backend_err("select next_op_id"))?;
        let current = row
            .map(|r| r.try_get::<i64, _>("next_op_id"))
            .transpose()
            .map_err(backend_err("read next_op_id"))?
            .unwrap_or(0);
        Ok(OpId(current as u64 + 1))
    }

    #[instrument(skip(self, ops), err)]
    async fn append(&self, group_id: &str, checkpoint_lsn: Lsn, ops: Vec<BucketOp>) -> Result<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let op_id = ops[0].op_id;

        let mut tx = self.pool.begin().await.map_err(backend_err("tx begin"))?;

        for op in &ops {
            let row_id_json = op
                .row_id
                .as_ref()
                .map(serde_json::to_string)
                .transpose()
                .map_err(|e| OperationLogError::Backend {
                    message: format!("encode row_id: {e}"),
                })?;
            sqlx::query(
                r#"
                INSERT INTO ops (group_id, bucket, op_id, op_kind, row_id_json, checksum, data, target_op)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(group_id)
            .bind(&op.bucket)
            .bind(op.op_id.0 as i64)
            .bind(encode_op_kind(op.op))
            .bind(row_id_json)
            .bind(op.checksum as i64)
            .bind(&op.data)
            .bind(op.target_op.map(|o| o.0 as i64))
            .execute(&mut *tx)
            .await
            .map_err(backend_err("insert op"))?;
        }

        sqlx::query(
            r#"
            INSERT INTO op_sequence (group_id, next_op_id, checkpoint_lsn)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(group_id) DO UPDATE SET next_op_id = excluded.next_op_id, checkpoint_lsn = excluded.checkpoint_lsn
            "#,
        )
        .bind(group_id)
        .bind(op_id.0 as i64)
        .bind(&checkpoint_lsn.0)
        .execute(&mut *tx)
        .await
        .map_err(backend_err("upsert op_sequence"))?;

        tx.commit().await.map_err(backend_err("tx commit"))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn scan(
        &self,
        group_id: &str,
        bucket: &str,
        after: OpId,
        limit: usize,
    ) -> Result<Vec<BucketOp>> {
        let rows = sqlx::query(
            r#"
            SELECT group_id, bucket, op_id, op_kind, row_id_json, checksum, data, target_op
            FROM ops
            WHERE group_id = ?1 AND bucket = ?2 AND op_id > ?3
            ORDER BY op_id ASC
            LIMIT ?4
            "#,
        )
        .bind(group_id)
        .bind(bucket)
        .bind(after.0 as i64)
        .bind(limit as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err("scan"))?;

        rows.iter().map(row_to_op).collect()
    }

    #[instrument(skip(self), err)]
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
        let row: SqliteRow = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS cnt,
                COALESCE(SUM(checksum), 0) AS total,
                COALESCE(MAX(CASE WHEN op_kind = 'CLEAR' THEN 1 ELSE 0 END), 0) AS has_clear
            FROM ops
            WHERE group_id = ?1 AND bucket = ?2 AND op_id > ?3 AND op_id <= ?4
            "#,
        )
        .bind(group_id)
        .bind(bucket)
        .bind(start.0 as i64)
        .bind(end.0 as i64)
        .fetch_one(&*self.pool)
        .await
        .map_err(backend_err("sum_checksum"))?;

        let count: i64 = row.try_get("cnt").map_err(backend_err("cnt"))?;
        let total: i64 = row.try_get("total").map_err(backend_err("total"))?;
        let has_clear: i64 = row.try_get("has_clear").map_err(backend_err("has_clear"))?;
        Ok((
            ChecksumTotal {
                count: count as u64,
                checksum: total as i32,
            },
            has_clear != 0,
        ))
    }

    #[instrument(skip(self), err)]
    async fn latest_checkpoint(&self, group_id: &str) -> Result<Option<Checkpoint>> {
        let row: Option<SqliteRow> =
            sqlx::query("SELECT next_op_id, checkpoint_lsn FROM op_sequence WHERE group_id = ?1")
                .bind(group_id)
                .fetch_optional(&*self.pool)
                .await
                .map_err(backend_err("latest_checkpoint"))?;
        Ok(match row {
            Some(row) => Some(Checkpoint {
                checkpoint: OpId(row.try_get::<i64, _>("next_op_id").map_err(backend_err("next_op_id"))? as u64),
                lsn: Lsn(row.try_get("checkpoint_lsn").map_err(backend_err("checkpoint_lsn"))?),
            }),
            None => None,
        })
    }

    #[instrument(skip(self), err)]
    async fn known_buckets(&self, group_id: &str, end: OpId) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT bucket FROM ops WHERE group_id = ?1 AND op_id <= ?2",
        )
        .bind(group_id)
        .bind(end.0 as i64)
        .fetch_all(&*self.pool)
        .await
        .map_err(backend_err("known_buckets"))?;

        rows.iter()
            .map(|row| row.try_get::<String, _>("bucket").map_err(|e| OperationLogError::Backend {
                message: format!("bucket: {e}"),
            }))
            .collect()
    }
}
