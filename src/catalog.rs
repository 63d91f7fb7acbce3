//! Shard catalog: discovery and in-memory ordering of the table pairs
//! owned by one store instance.

use crate::errors::{Error, Result, ensure};
use crate::shard::{Shard, ShardIndex, ShardRange};
use sqlx::PgPool;
use std::collections::HashMap;

/// In-memory view of the shard list and the per-shard job-id ranges,
/// rebuilt from the database after every structural change.
#[derive(Debug, Default)]
pub(crate) struct Catalog {
    pub(crate) shards: Vec<Shard>,
    pub(crate) ranges: Vec<ShardRange>,
}

impl Catalog {
    /// Rebuild both lists from the database.
    pub(crate) async fn refresh(pool: &PgPool, prefix: &str) -> Result<Catalog> {
        let shards = discover_shards(pool, prefix).await?;
        let ranges = discover_ranges(pool, &shards).await?;
        Ok(Catalog { shards, ranges })
    }

    /// The shard currently receiving new jobs.
    pub(crate) fn newest(&self) -> Option<&Shard> {
        self.shards.last()
    }
}

/// List this instance's shards by scanning the table catalog. Each index
/// must have both its jobs and status table; the result is sorted by
/// [`ShardIndex`] order.
pub(crate) async fn discover_shards(pool: &PgPool, prefix: &str) -> Result<Vec<Shard>> {
    let tables: Vec<String> = sqlx::query_scalar(
        "SELECT tablename FROM pg_catalog.pg_tables \
         WHERE schemaname NOT IN ('pg_catalog', 'information_schema')",
    )
    .fetch_all(pool)
    .await?;

    let jobs_prefix = format!("{prefix}_jobs_");
    let status_prefix = format!("{prefix}_job_status_");
    let mut job_tables: HashMap<ShardIndex, String> = HashMap::new();
    let mut status_tables: HashMap<ShardIndex, String> = HashMap::new();

    for table in tables {
        if let Some(suffix) = table.strip_prefix(&jobs_prefix) {
            job_tables.insert(suffix.parse()?, table);
        } else if let Some(suffix) = table.strip_prefix(&status_prefix) {
            status_tables.insert(suffix.parse()?, table);
        }
    }

    let mut indices: Vec<ShardIndex> = job_tables.keys().copied().collect();
    indices.sort();

    let mut shards = Vec::with_capacity(indices.len());
    for index in indices {
        let job_table = job_tables.remove(&index).ok_or_else(|| {
            Error::invariant(format!("jobs table for shard {index} disappeared"))
        })?;
        let job_status_table = status_tables.remove(&index).ok_or_else(|| {
            Error::invariant(format!("shard {index} has a jobs table but no status table"))
        })?;
        shards.push(Shard {
            job_table,
            job_status_table,
            index,
        });
    }
    ensure!(
        status_tables.is_empty(),
        "orphan status tables without a jobs table: {:?}",
        status_tables.values().collect::<Vec<_>>()
    );
    Ok(shards)
}

/// Read the `[min, max]` job-id range of every shard except the newest.
/// The newest shard is skipped on purpose: it is being appended to
/// concurrently, and a partial maximum would break range-based routing.
pub(crate) async fn discover_ranges(pool: &PgPool, shards: &[Shard]) -> Result<Vec<ShardRange>> {
    let mut ranges = Vec::new();
    let mut prev_max: Option<i64> = None;

    for shard in shards.iter().take(shards.len().saturating_sub(1)) {
        let (min, max): (Option<i64>, Option<i64>) = sqlx::query_as(&format!(
            "SELECT MIN(job_id), MAX(job_id) FROM {}",
            shard.job_table
        ))
        .fetch_one(pool)
        .await?;
        let (Some(min_job_id), Some(max_job_id)) = (min, max) else {
            return Err(Error::invariant(format!(
                "non-newest shard {} has no jobs",
                shard.index
            )));
        };
        if let Some(prev) = prev_max {
            ensure!(
                prev < min_job_id,
                "job-id ranges overlap at shard {}: previous max {prev}, own min {min_job_id}",
                shard.index
            );
        }
        prev_max = Some(max_job_id);
        ranges.push(ShardRange {
            min_job_id,
            max_job_id,
            shard: shard.clone(),
        });
    }
    Ok(ranges)
}
