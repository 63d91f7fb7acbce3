//! Per-shard SQL operations: bulk appends, anti-join and latest-status
//! reads, row-count probes, and DDL.
//!
//! Everything here is scoped to a single shard and carries no locking or
//! caching; the store layer owns both.

use crate::errors::{Result, ensure};
use crate::schema::{Job, JobState, JobStatus, NewJob};
use crate::shard::Shard;
use chrono::{NaiveDateTime, Utc};
use sqlx::{PgPool, QueryBuilder, Row};

/// Rows per `INSERT` statement. Bulk appends stay within one transaction;
/// chunking only keeps each statement under the bind-parameter limit.
const INSERT_CHUNK: usize = 1_000;

/// Append new jobs, letting the shard's sequence assign identifiers.
/// Atomic: either every job is stored or none is.
pub(crate) async fn insert_jobs(pool: &PgPool, shard: &Shard, jobs: &[NewJob]) -> Result<()> {
    if jobs.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for chunk in jobs.chunks(INSERT_CHUNK) {
        let mut query = QueryBuilder::new(format!(
            "INSERT INTO {} (uuid, custom_val, event_payload, created_at, expire_at) ",
            shard.job_table
        ));
        query.push_values(chunk, |mut row, job| {
            row.push_bind(job.uuid)
                .push_bind(&job.custom_val)
                .push_bind(&job.event_payload)
                .push_bind(job.created_at)
                .push_bind(job.expire_at);
        });
        query.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Append jobs carrying their identifiers verbatim. Only the compaction
/// path uses this; preserving ids is what keeps ranges disjoint.
pub(crate) async fn copy_jobs(pool: &PgPool, shard: &Shard, jobs: &[Job]) -> Result<()> {
    if jobs.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for chunk in jobs.chunks(INSERT_CHUNK) {
        let mut query = QueryBuilder::new(format!(
            "INSERT INTO {} (job_id, uuid, custom_val, event_payload, created_at, expire_at) ",
            shard.job_table
        ));
        query.push_values(chunk, |mut row, job| {
            row.push_bind(job.job_id)
                .push_bind(job.uuid)
                .push_bind(&job.custom_val)
                .push_bind(&job.event_payload)
                .push_bind(job.created_at)
                .push_bind(job.expire_at);
        });
        query.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Append status rows in one transaction.
pub(crate) async fn append_statuses(
    pool: &PgPool,
    shard: &Shard,
    statuses: &[JobStatus],
) -> Result<()> {
    if statuses.is_empty() {
        return Ok(());
    }
    let mut tx = pool.begin().await?;
    for chunk in statuses.chunks(INSERT_CHUNK) {
        let mut query = QueryBuilder::new(format!(
            "INSERT INTO {} (job_id, job_state, attempt, exec_time, retry_time, \
             error_code, error_response) ",
            shard.job_status_table
        ));
        query.push_values(chunk, |mut row, status| {
            row.push_bind(status.job_id)
                .push_bind(status.job_state)
                .push_bind(status.attempt)
                .push_bind(status.exec_time)
                .push_bind(status.retry_time)
                .push_bind(&status.error_code)
                .push_bind(&status.error_response);
        });
        query.build().execute(&mut *tx).await?;
    }
    tx.commit().await?;
    Ok(())
}

/// Jobs in this shard with no status row at all, via a left anti-join.
pub(crate) async fn unprocessed_jobs(
    pool: &PgPool,
    shard: &Shard,
    tags: &[String],
    ordered: bool,
    limit: Option<i64>,
) -> Result<Vec<Job>> {
    let mut query = QueryBuilder::new(format!(
        "SELECT j.job_id, j.uuid, j.custom_val, j.event_payload, j.created_at, j.expire_at \
         FROM {jobs} j LEFT JOIN {status} s ON j.job_id = s.job_id \
         WHERE s.job_id IS NULL",
        jobs = shard.job_table,
        status = shard.job_status_table,
    ));
    if !tags.is_empty() {
        query.push(" AND j.custom_val = ANY(");
        query.push_bind(tags.to_vec());
        query.push(")");
    }
    if ordered {
        query.push(" ORDER BY j.job_id");
    }
    if let Some(limit) = limit {
        query.push(" LIMIT ");
        query.push_bind(limit);
    }
    Ok(query.build_query_as().fetch_all(pool).await?)
}

/// Jobs whose latest status matches `states`, each carrying that status.
///
/// "Latest" is the status row with the highest `id` per job. The normal
/// path also requires `retry_time` in the past and applies tag filters;
/// `get_all` bypasses both and exists for the compaction copy, which must
/// see every matching job regardless of retry clocks.
pub(crate) async fn processed_jobs(
    pool: &PgPool,
    shard: &Shard,
    get_all: bool,
    states: &[JobState],
    tags: &[String],
    limit: Option<i64>,
) -> Result<Vec<Job>> {
    if get_all {
        ensure!(
            tags.is_empty() && limit.is_none(),
            "get-all reads take no tag filter or limit"
        );
    }
    let mut query = QueryBuilder::new(format!(
        "SELECT j.job_id, j.uuid, j.custom_val, j.event_payload, j.created_at, j.expire_at, \
                ls.job_state, ls.attempt, ls.exec_time, ls.retry_time, \
                ls.error_code, ls.error_response \
         FROM {jobs} j, \
              (SELECT job_id, job_state, attempt, exec_time, retry_time, \
                      error_code, error_response \
               FROM {status} \
               WHERE id IN (SELECT MAX(id) FROM {status} GROUP BY job_id)",
        jobs = shard.job_table,
        status = shard.job_status_table,
    ));
    if !states.is_empty() {
        query.push(" AND job_state = ANY(");
        query.push_bind(states.to_vec());
        query.push(")");
    }
    query.push(") ls WHERE j.job_id = ls.job_id");
    if !get_all {
        if !tags.is_empty() {
            query.push(" AND j.custom_val = ANY(");
            query.push_bind(tags.to_vec());
            query.push(")");
        }
        query.push(" AND ls.retry_time < ");
        query.push_bind(Utc::now().naive_utc());
        query.push(" ORDER BY j.job_id");
        if let Some(limit) = limit {
            query.push(" LIMIT ");
            query.push_bind(limit);
        }
    }

    let rows = query.build().fetch_all(pool).await?;
    let mut jobs = Vec::with_capacity(rows.len());
    for row in rows {
        let job_id: i64 = row.try_get("job_id")?;
        jobs.push(Job {
            job_id,
            uuid: row.try_get("uuid")?,
            custom_val: row.try_get("custom_val")?,
            event_payload: row.try_get("event_payload")?,
            created_at: row.try_get("created_at")?,
            expire_at: row.try_get("expire_at")?,
            last_status: Some(JobStatus {
                job_id,
                job_state: row.try_get("job_state")?,
                attempt: row.try_get("attempt")?,
                exec_time: row.try_get("exec_time")?,
                retry_time: row.try_get("retry_time")?,
                error_code: row.try_get("error_code")?,
                error_response: row.try_get("error_response")?,
            }),
        });
    }
    Ok(jobs)
}

/// Row counts driving the maintenance decisions for one shard.
#[derive(Debug, Clone, Copy)]
pub(crate) struct ShardCounts {
    /// Jobs in the shard.
    pub(crate) total_jobs: i64,
    /// Jobs whose status log contains a terminal state.
    pub(crate) terminal_jobs: i64,
    /// All status rows, terminal or not.
    pub(crate) status_rows: i64,
}

pub(crate) async fn job_count(pool: &PgPool, shard: &Shard) -> Result<i64> {
    Ok(
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", shard.job_table))
            .fetch_one(pool)
            .await?,
    )
}

pub(crate) async fn shard_counts(pool: &PgPool, shard: &Shard) -> Result<ShardCounts> {
    let total_jobs = job_count(pool, shard).await?;
    let terminal_jobs: i64 = sqlx::query_scalar(&format!(
        "SELECT COUNT(DISTINCT job_id) FROM {} \
         WHERE job_state = 'succeeded' OR job_state = 'aborted'",
        shard.job_status_table
    ))
    .fetch_one(pool)
    .await?;
    let status_rows: i64 =
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", shard.job_status_table))
            .fetch_one(pool)
            .await?;
    Ok(ShardCounts {
        total_jobs,
        terminal_jobs,
        status_rows,
    })
}

/// `MAX(created_at)` over the shard's jobs; `None` when the shard is empty.
pub(crate) async fn newest_created_at(
    pool: &PgPool,
    shard: &Shard,
) -> Result<Option<NaiveDateTime>> {
    Ok(sqlx::query_scalar(&format!(
        "SELECT MAX(created_at) FROM {}",
        shard.job_table
    ))
    .fetch_one(pool)
    .await?)
}

/// Create the table pair for a new shard.
pub(crate) async fn create_shard_tables(pool: &PgPool, shard: &Shard) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE {} (\
           job_id BIGSERIAL PRIMARY KEY, \
           uuid UUID NOT NULL, \
           custom_val VARCHAR(64) NOT NULL, \
           event_payload JSONB NOT NULL, \
           created_at TIMESTAMP NOT NULL, \
           expire_at TIMESTAMP NOT NULL)",
        shard.job_table
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!(
        "CREATE TABLE {} (\
           id BIGSERIAL PRIMARY KEY, \
           job_id BIGINT REFERENCES {}(job_id), \
           job_state job_state_type, \
           attempt SMALLINT, \
           exec_time TIMESTAMP, \
           retry_time TIMESTAMP, \
           error_code VARCHAR(32), \
           error_response JSONB)",
        shard.job_status_table, shard.job_table
    ))
    .execute(pool)
    .await?;
    Ok(())
}

/// Drop a shard's tables, status table first because of the foreign key.
/// `allow_missing` is for journal recovery, where a crash may have removed
/// either table already; everywhere else a missing table is an error.
pub(crate) async fn drop_shard(pool: &PgPool, shard: &Shard, allow_missing: bool) -> Result<()> {
    let if_exists = if allow_missing { "IF EXISTS " } else { "" };
    sqlx::query(&format!(
        "DROP TABLE {if_exists}{}",
        shard.job_status_table
    ))
    .execute(pool)
    .await?;
    sqlx::query(&format!("DROP TABLE {if_exists}{}", shard.job_table))
        .execute(pool)
        .await?;
    Ok(())
}

/// Move the new shard's sequence past the previous shard's maximum, so job
/// identifiers stay monotonic across a roll-over. `setval` leaves the next
/// assigned id at `value + 1`.
pub(crate) async fn set_job_sequence(pool: &PgPool, shard: &Shard, value: i64) -> Result<()> {
    let _: i64 = sqlx::query_scalar(&format!(
        "SELECT setval('{}_job_id_seq', $1)",
        shard.job_table
    ))
    .bind(value)
    .fetch_one(pool)
    .await?;
    Ok(())
}
