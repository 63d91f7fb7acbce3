//! Structural-operation journal.
//!
//! Every operation that changes the shard layout (create, copy, drop) is
//! bracketed by a journal row: inserted with `done = FALSE` before the
//! first DDL statement and marked done after the last. At most one row is
//! in flight at any time because all structural operations are serialized
//! under the maintenance task. On startup the single unfinished row, if
//! any, tells recovery exactly what to undo or finish.

use crate::errors::{Error, Result, ensure};
use crate::shard::Shard;
use crate::storage;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tracing::info;

/// The journaled operation kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum JournalOp {
    /// A new shard's tables are being created.
    AddShard,
    /// Live jobs are being copied into a compaction shard. The sources are
    /// untouched until the separate delete operation.
    MigrateCopy,
    /// Drained source shards are being dropped.
    MigrateDel,
}

impl JournalOp {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            JournalOp::AddShard => "ADD_DS",
            JournalOp::MigrateCopy => "MIGRATE_COPY",
            JournalOp::MigrateDel => "MIGRATE_DEL",
        }
    }

    fn parse(raw: &str) -> Result<JournalOp> {
        match raw {
            "ADD_DS" => Ok(JournalOp::AddShard),
            "MIGRATE_COPY" => Ok(JournalOp::MigrateCopy),
            "MIGRATE_DEL" => Ok(JournalOp::MigrateDel),
            _ => Err(Error::invariant(format!("unknown journal operation {raw:?}"))),
        }
    }
}

/// Shards touched by a journaled operation.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct JournalPayload {
    #[serde(default)]
    pub(crate) from: Vec<Shard>,
    #[serde(default)]
    pub(crate) to: Option<Shard>,
}

fn journal_table(prefix: &str) -> String {
    format!("{prefix}_journal")
}

pub(crate) async fn create_journal(pool: &PgPool, prefix: &str) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {} (\
           id BIGSERIAL PRIMARY KEY, \
           operation VARCHAR(32) NOT NULL, \
           done BOOLEAN, \
           operation_payload JSONB NOT NULL, \
           start_time TIMESTAMP NOT NULL, \
           end_time TIMESTAMP)",
        journal_table(prefix)
    ))
    .execute(pool)
    .await?;
    Ok(())
}

pub(crate) async fn drop_journal(pool: &PgPool, prefix: &str) -> Result<()> {
    sqlx::query(&format!(
        "DROP TABLE IF EXISTS {}",
        journal_table(prefix)
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Record the start of a structural operation; returns the row id to pass
/// to [`mark_done`].
pub(crate) async fn mark_start(
    pool: &PgPool,
    prefix: &str,
    op: JournalOp,
    payload: &JournalPayload,
) -> Result<i64> {
    let payload = serde_json::to_value(payload)
        .map_err(|err| Error::invariant(format!("journal payload serialization: {err}")))?;
    let id: i64 = sqlx::query_scalar(&format!(
        "INSERT INTO {} (operation, done, operation_payload, start_time) \
         VALUES ($1, FALSE, $2, $3) RETURNING id",
        journal_table(prefix)
    ))
    .bind(op.as_str())
    .bind(payload)
    .bind(Utc::now().naive_utc())
    .fetch_one(pool)
    .await?;
    Ok(id)
}

pub(crate) async fn mark_done(pool: &PgPool, prefix: &str, id: i64) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE {} SET done = TRUE, end_time = $2 WHERE id = $1",
        journal_table(prefix)
    ))
    .bind(id)
    .bind(Utc::now().naive_utc())
    .execute(pool)
    .await?;
    Ok(())
}

/// Undo or finish the operation a previous process died in the middle of.
///
/// `ADD_DS` and `MIGRATE_COPY` are undone: the half-created destination is
/// dropped (`IF EXISTS`, since the crash may have preceded the DDL) and the
/// journal row deleted; the sources of an interrupted copy are intact, so
/// the next maintenance pass redoes the migration from scratch. A
/// `MIGRATE_DEL` cannot be undone because the destination is already live,
/// so it is completed instead: every source is dropped and the row marked
/// done. Both actions are idempotent, so crashing during recovery is fine.
pub(crate) async fn recover(pool: &PgPool, prefix: &str) -> Result<()> {
    let pending: Vec<(i64, String, serde_json::Value)> = sqlx::query_as(&format!(
        "SELECT id, operation, operation_payload FROM {} \
         WHERE done = FALSE ORDER BY id",
        journal_table(prefix)
    ))
    .fetch_all(pool)
    .await?;

    ensure!(
        pending.len() <= 1,
        "{} unfinished journal entries, expected at most one",
        pending.len()
    );
    let Some((id, raw_op, raw_payload)) = pending.into_iter().next() else {
        return Ok(());
    };

    let op = JournalOp::parse(&raw_op)?;
    let payload: JournalPayload = serde_json::from_value(raw_payload)
        .map_err(|err| Error::invariant(format!("journal payload for row {id}: {err}")))?;

    match op {
        JournalOp::AddShard | JournalOp::MigrateCopy => {
            let to = payload.to.ok_or_else(|| {
                Error::invariant(format!("{raw_op} journal row {id} has no destination"))
            })?;
            info!(op = raw_op, shard = %to.index, "undoing interrupted operation");
            storage::drop_shard(pool, &to, true).await?;
            sqlx::query(&format!(
                "DELETE FROM {} WHERE id = $1",
                journal_table(prefix)
            ))
            .bind(id)
            .execute(pool)
            .await?;
        }
        JournalOp::MigrateDel => {
            for shard in &payload.from {
                info!(op = raw_op, shard = %shard.index, "finishing interrupted delete");
                storage::drop_shard(pool, shard, true).await?;
            }
            mark_done(pool, prefix, id).await?;
        }
    }
    Ok(())
}
