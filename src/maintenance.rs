//! Background maintenance: rolling a new shard when the newest fills up,
//! and compacting old shards once most of their jobs are terminal.
//!
//! A single task wakes every `check_interval` (plus jitter, to keep
//! several stores in one process from probing in lockstep). Structural
//! work happens in two phases with different locks: adding a shard only
//! mutates the list, so it takes the catalog write lock briefly; the
//! compaction phase moves data between shards and holds the migration
//! write lock end to end, while producers keep appending under the
//! catalog read lock.

use crate::catalog::Catalog;
use crate::errors::{Error, Result, ensure};
use crate::journal::{self, JournalOp, JournalPayload};
use crate::schema::{JobStatus, LIVE_STATES};
use crate::shard::{Shard, ShardIndex, level1_index_before};
use crate::store::StoreInner;
use rand::Rng;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// Shard counts beyond this are a sign compaction cannot keep up with the
/// write rate.
const SHARD_COUNT_WATCHDOG: usize = 64;

/// Where a new shard goes: appended as the next level-0 shard, or inserted
/// as a compaction destination directly before an existing level-0 shard.
#[derive(Debug, Clone)]
pub(crate) enum AddPosition {
    Append,
    Before(ShardIndex),
}

impl StoreInner {
    pub(crate) async fn maintenance_loop(
        self: std::sync::Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.sleep_with_jitter()) => {}
                _ = shutdown.changed() => {
                    debug!("maintenance task shutting down");
                    break;
                }
            }
            trace!("maintenance tick");
            if let Err(err) = self.run_maintenance_pass().await {
                self.fatal("maintenance", &err);
            }
        }
    }

    fn sleep_with_jitter(&self) -> Duration {
        if self.config.check_jitter.is_zero() {
            return self.config.check_interval;
        }
        let jitter_millis = u64::try_from(self.config.check_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.check_interval + Duration::from_millis(jitter)
    }

    async fn run_maintenance_pass(&self) -> Result<()> {
        let shard_list = {
            let catalog = self.catalog.read().await;
            catalog.shards.clone()
        };
        let newest = shard_list
            .last()
            .ok_or_else(|| Error::invariant("shard list is empty"))?;
        if shard_list.len() > SHARD_COUNT_WATCHDOG {
            warn!(
                shards = shard_list.len(),
                "shard count keeps growing; compaction is not keeping up"
            );
        }

        if crate::storage::job_count(&self.pool, newest).await? > self.config.max_shard_size {
            let mut catalog = self.catalog.write().await;
            let added = self.add_shard_locked(&mut catalog, AddPosition::Append).await?;
            info!(shard = %added.index, "rolled over to a new shard");
        }

        let _migration = self.migration_lock.write().await;

        // Walk the snapshot left to right; compaction always consumes a
        // prefix, so the first shard that cannot move stops the scan.
        let mut migrate_from: Vec<Shard> = Vec::new();
        let mut insert_before: Option<ShardIndex> = None;
        let mut live_count: i64 = 0;
        for (idx, shard) in shard_list.iter().enumerate() {
            if idx + 1 >= shard_list.len()
                || migrate_from.len() >= self.config.max_migrate_once
                || live_count >= self.config.max_shard_size
            {
                break;
            }
            let (compact, live) = self.check_if_compactable(shard).await?;
            trace!(shard = %shard.index, compact, live, "compaction check");
            if !compact {
                break;
            }
            migrate_from.push(shard.clone());
            insert_before = Some(shard_list[idx + 1].index);
            live_count += live;
        }
        if migrate_from.is_empty() {
            return Ok(());
        }

        if live_count > 0 {
            let before = insert_before
                .ok_or_else(|| Error::invariant("compaction prefix without a successor"))?;
            let dest = {
                let mut catalog = self.catalog.write().await;
                self.add_shard_locked(&mut catalog, AddPosition::Before(before))
                    .await?
            };
            info!(
                sources = migrate_from.len(),
                dest = %dest.index,
                live = live_count,
                "compacting shards"
            );

            let payload = JournalPayload {
                from: migrate_from.clone(),
                to: Some(dest.clone()),
            };
            let op = journal::mark_start(
                &self.pool,
                &self.config.table_prefix,
                JournalOp::MigrateCopy,
                &payload,
            )
            .await?;
            for src in &migrate_from {
                self.migrate_shard(src, &dest).await?;
            }
            journal::mark_done(&self.pool, &self.config.table_prefix, op).await?;
        } else {
            info!(sources = migrate_from.len(), "dropping fully terminal shards");
        }

        let payload = JournalPayload {
            from: migrate_from.clone(),
            to: None,
        };
        let op = journal::mark_start(
            &self.pool,
            &self.config.table_prefix,
            JournalOp::MigrateDel,
            &payload,
        )
        .await?;
        {
            let mut catalog = self.catalog.write().await;
            for src in &migrate_from {
                crate::storage::drop_shard(&self.pool, src, false).await?;
                self.cache().clear_shard(src.index);
            }
            *catalog = Catalog::refresh(&self.pool, &self.config.table_prefix).await?;
        }
        journal::mark_done(&self.pool, &self.config.table_prefix, op).await?;
        Ok(())
    }

    /// Decide whether a shard should be compacted, and how many of its
    /// jobs are still live. A shard moves once most of its jobs are
    /// terminal or once its status log has grown far past its job count
    /// (heavy retrying). Inside the retention window neither threshold
    /// applies: retention exists for callers that keep recent jobs around
    /// to deduplicate against.
    async fn check_if_compactable(&self, shard: &Shard) -> Result<(bool, i64)> {
        let counts = crate::storage::shard_counts(&self.pool, shard).await?;
        if counts.total_jobs == 0 {
            ensure!(
                counts.terminal_jobs == 0 && counts.status_rows == 0,
                "shard {} has status rows but no jobs",
                shard.index
            );
            return Ok((false, 0));
        }
        let live = counts.total_jobs - counts.terminal_jobs;

        if let Some(period) = self.config.retention_period {
            let newest = crate::storage::newest_created_at(&self.pool, shard)
                .await?
                .ok_or_else(|| {
                    Error::invariant(format!("shard {} lost its created_at values", shard.index))
                })?;
            let window = chrono::Duration::from_std(period)
                .map_err(|err| Error::invariant(format!("retention period out of range: {err}")))?;
            if chrono::Utc::now().naive_utc() - newest < window {
                return Ok((false, live));
            }
        }

        let total = counts.total_jobs as f64;
        let compact = counts.terminal_jobs as f64 / total > self.config.job_done_migrate_threshold
            || counts.status_rows as f64 / total > self.config.job_status_migrate_threshold;
        Ok((compact, live))
    }

    /// Create a shard's tables under an `ADD_DS` journal entry. The caller
    /// holds the catalog write lock.
    ///
    /// Appending refreshes the catalog and bumps the new sequence past the
    /// previous shard's maximum job id, keeping identifiers monotonic
    /// across the roll-over. Inserting a compaction destination leaves the
    /// catalog untouched: the new shard becomes visible only after the
    /// sources are dropped and the list is rebuilt.
    pub(crate) async fn add_shard_locked(
        &self,
        catalog: &mut Catalog,
        position: AddPosition,
    ) -> Result<Shard> {
        let prefix = &self.config.table_prefix;
        let current = crate::catalog::discover_shards(&self.pool, prefix).await?;
        let index = match &position {
            AddPosition::Append => match current.last() {
                None => ShardIndex::Level0(1),
                Some(last) => last.index.next_level0()?,
            },
            AddPosition::Before(target) => level1_index_before(&current, target)?,
        };
        let new_shard = Shard::new(prefix, index);

        let payload = JournalPayload {
            from: Vec::new(),
            to: Some(new_shard.clone()),
        };
        let op = journal::mark_start(&self.pool, prefix, JournalOp::AddShard, &payload).await?;
        crate::storage::create_shard_tables(&self.pool, &new_shard).await?;
        journal::mark_done(&self.pool, prefix, op).await?;

        if matches!(position, AddPosition::Append) {
            *catalog = Catalog::refresh(&self.pool, prefix).await?;
            ensure!(
                catalog.shards.len() == catalog.ranges.len() + 1,
                "newest shard unexpectedly has a cached range"
            );
            if let Some(last_range) = catalog.ranges.last() {
                ensure!(
                    last_range.max_job_id > 0,
                    "previous shard's max job id must be positive"
                );
                crate::storage::set_job_sequence(&self.pool, &new_shard, last_range.max_job_id)
                    .await?;
            }
        }
        Ok(new_shard)
    }

    /// Copy one source shard's live jobs into the compaction destination.
    ///
    /// Live means status-less, or latest status non-terminal. Ids are
    /// preserved, and each previously processed job gets exactly one
    /// status row in the destination carrying over its latest state;
    /// terminal jobs and all historical status rows stay behind and die
    /// with the source.
    async fn migrate_shard(&self, src: &Shard, dest: &Shard) -> Result<()> {
        let unprocessed = self.unprocessed_for_shard(src, &[], false, None).await?;
        let live = self
            .processed_for_shard(src, true, &LIVE_STATES, &[], None)
            .await?;
        debug!(
            src = %src.index,
            dest = %dest.index,
            unprocessed = unprocessed.len(),
            live = live.len(),
            "migrating shard"
        );

        let mut jobs = unprocessed;
        jobs.extend(live.iter().cloned());
        crate::storage::copy_jobs(&self.pool, dest, &jobs).await?;
        self.cache().clear_shard(dest.index);

        let mut statuses: Vec<JobStatus> = Vec::with_capacity(live.len());
        for job in &live {
            let status = job.last_status.clone().ok_or_else(|| {
                Error::invariant(format!("processed job {} has no status", job.job_id))
            })?;
            statuses.push(status);
        }
        self.append_statuses_cached(dest, &statuses, &[]).await?;
        Ok(())
    }
}
