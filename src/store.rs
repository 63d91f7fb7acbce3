//! The public store: routing over the shard list with the lock discipline
//! that keeps producers fast while compaction runs.
//!
//! Two reader/writer locks exist on purpose. `catalog` guards the identity
//! and order of the shard list; `migration_lock` guards data movement
//! across shards. [`JobStore::store`] takes only the catalog read lock, so
//! a producer is never queued behind a long compaction, and producer
//! latency is externally visible ACK latency. Readers and status updates take the
//! migration lock first, then the catalog lock; the maintenance task
//! acquires in the same order, which is what rules out deadlock.

use crate::cache::{EmptyResultCache, StatusKey};
use crate::catalog::Catalog;
use crate::config::Config;
use crate::errors::{Error, Result, ensure};
use crate::journal;
use crate::maintenance::AddPosition;
use crate::schema::{Job, JobState, JobStatus, NewJob};
use crate::shard::{Shard, ShardRange};
use crate::storage;
use sqlx::PgPool;
use std::ops::Range;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// A durable, shard-partitioned job queue over one PostgreSQL database.
///
/// One instance owns every table named under its configured prefix. All
/// methods are cheap to call concurrently; a single background task rolls
/// and compacts shards. Database errors and invariant violations are fatal:
/// the store dumps its in-memory state via `tracing` and aborts the
/// process, relying on journal recovery at the next startup.
pub struct JobStore {
    inner: Arc<StoreInner>,
    shutdown: watch::Sender<bool>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct StoreInner {
    pub(crate) pool: PgPool,
    pub(crate) config: Config,
    pub(crate) catalog: RwLock<Catalog>,
    pub(crate) migration_lock: RwLock<()>,
    pub(crate) cache: Mutex<EmptyResultCache>,
}

impl JobStore {
    /// Connect a store to its tables and start the maintenance task.
    ///
    /// With `clear_all` set, every shard table and the journal under the
    /// prefix is dropped first; otherwise the journal is replayed to undo
    /// or finish whatever a previous process died in the middle of. If no
    /// shard exists afterwards, shard `1` is created.
    pub async fn setup(pool: PgPool, config: Config) -> JobStore {
        let inner = Arc::new(StoreInner {
            pool,
            config,
            catalog: RwLock::new(Catalog::default()),
            migration_lock: RwLock::new(()),
            cache: Mutex::new(EmptyResultCache::default()),
        });
        if let Err(err) = inner.initialize().await {
            inner.fatal("setup", &err);
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(Arc::clone(&inner).maintenance_loop(shutdown_rx));
        JobStore {
            inner,
            shutdown,
            maintenance: Mutex::new(Some(handle)),
        }
    }

    /// Stop the maintenance task and release the connection pool.
    ///
    /// If a structural operation is mid-flight the task finishes its
    /// iteration first; an abrupt stop would be safe thanks to the journal
    /// but would leave recovery work for the next startup.
    pub async fn tear_down(self) {
        let _ = self.shutdown.send(true);
        let handle = lock_unpoisoned(&self.maintenance).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.inner.pool.close().await;
    }

    /// Append jobs to the newest shard. Atomic across the whole batch.
    pub async fn store(&self, jobs: &[NewJob]) {
        if jobs.is_empty() {
            return;
        }
        if let Err(err) = self.inner.store_jobs(jobs).await {
            self.inner.fatal("store", &err);
        }
    }

    /// Record a batch of status transitions.
    ///
    /// Each row is routed to the shard owning its job id via the range
    /// index; rows above every known range go to the newest shard. Appends
    /// are atomic per shard, not across shards. `tags` is advisory: it
    /// narrows which empty-result cache entries the write invalidates.
    pub async fn update_job_status(&self, mut statuses: Vec<JobStatus>, tags: &[String]) {
        if statuses.is_empty() {
            return;
        }
        statuses.sort_by_key(|status| status.job_id);
        if let Err(err) = self.inner.update_statuses(&statuses, tags).await {
            self.inner.fatal("update_job_status", &err);
        }
    }

    /// Jobs with no status row yet, oldest shard first, at most `count`.
    /// `tags` restricts to matching `custom_val`s; empty means all.
    pub async fn get_unprocessed(&self, tags: &[String], count: usize) -> Vec<Job> {
        if count == 0 {
            return Vec::new();
        }
        match self.inner.unprocessed(tags, count).await {
            Ok(jobs) => jobs,
            Err(err) => self.inner.fatal("get_unprocessed", &err),
        }
    }

    /// Jobs whose latest status is in `states` and whose retry time has
    /// passed, oldest shard first, at most `count`. Does not change any
    /// state: successive calls return the same jobs until the caller
    /// records a new status for them.
    pub async fn get_processed(
        &self,
        states: &[JobState],
        tags: &[String],
        count: usize,
    ) -> Vec<Job> {
        if count == 0 {
            return Vec::new();
        }
        match self.inner.processed(states, tags, count).await {
            Ok(jobs) => jobs,
            Err(err) => self.inner.fatal("get_processed", &err),
        }
    }

    /// Failed jobs due for a retry.
    pub async fn get_to_retry(&self, tags: &[String], count: usize) -> Vec<Job> {
        self.get_processed(&[JobState::Failed], tags, count).await
    }

    /// Jobs whose latest status is `waiting`.
    pub async fn get_waiting(&self, tags: &[String], count: usize) -> Vec<Job> {
        self.get_processed(&[JobState::Waiting], tags, count).await
    }

    /// Jobs whose latest status is `executing`.
    pub async fn get_executing(&self, tags: &[String], count: usize) -> Vec<Job> {
        self.get_processed(&[JobState::Executing], tags, count).await
    }
}

impl StoreInner {
    async fn initialize(&self) -> Result<()> {
        self.config.validate()?;
        let prefix = &self.config.table_prefix;

        create_state_enum(&self.pool).await?;

        if self.config.clear_all {
            let shards = crate::catalog::discover_shards(&self.pool, prefix).await?;
            for shard in &shards {
                storage::drop_shard(&self.pool, shard, false).await?;
            }
            journal::drop_journal(&self.pool, prefix).await?;
        }
        journal::create_journal(&self.pool, prefix).await?;
        if !self.config.clear_all {
            journal::recover(&self.pool, prefix).await?;
        }

        let mut catalog = self.catalog.write().await;
        *catalog = Catalog::refresh(&self.pool, prefix).await?;
        if catalog.shards.is_empty() {
            self.add_shard_locked(&mut catalog, AddPosition::Append).await?;
        }
        info!(
            prefix,
            shards = catalog.shards.len(),
            "job store initialized"
        );
        Ok(())
    }

    async fn store_jobs(&self, jobs: &[NewJob]) -> Result<()> {
        let catalog = self.catalog.read().await;
        let newest = catalog
            .newest()
            .ok_or_else(|| Error::invariant("shard list is empty"))?;
        storage::insert_jobs(&self.pool, newest, jobs).await?;
        self.cache().clear_shard(newest.index);
        Ok(())
    }

    async fn update_statuses(&self, statuses: &[JobStatus], tags: &[String]) -> Result<()> {
        let _migration = self.migration_lock.read().await;
        let catalog = self.catalog.read().await;

        let (buckets, tail_start) = bucket_by_range(statuses, &catalog.ranges)?;
        for (range_idx, span) in buckets {
            let shard = catalog.ranges[range_idx].shard.clone();
            self.append_statuses_cached(&shard, &statuses[span], tags)
                .await?;
        }
        if tail_start < statuses.len() {
            // Ids above every cached range can only belong to the shard
            // currently being written.
            ensure!(
                catalog.ranges.len() + 1 == catalog.shards.len(),
                "range list out of step with shard list"
            );
            let newest = catalog
                .newest()
                .ok_or_else(|| Error::invariant("shard list is empty"))?
                .clone();
            self.append_statuses_cached(&newest, &statuses[tail_start..], tags)
                .await?;
        }
        Ok(())
    }

    pub(crate) async fn append_statuses_cached(
        &self,
        shard: &Shard,
        statuses: &[JobStatus],
        tags: &[String],
    ) -> Result<()> {
        storage::append_statuses(&self.pool, shard, statuses).await?;
        let mut keys: Vec<StatusKey> = Vec::new();
        for status in statuses {
            let key = StatusKey::InState(status.job_state);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        self.cache().clear(shard.index, &keys, tags);
        Ok(())
    }

    async fn unprocessed(&self, tags: &[String], count: usize) -> Result<Vec<Job>> {
        let _migration = self.migration_lock.read().await;
        let catalog = self.catalog.read().await;
        let mut out = Vec::new();
        let mut remaining = count;
        for shard in &catalog.shards {
            if remaining == 0 {
                break;
            }
            let batch = self
                .unprocessed_for_shard(shard, tags, true, Some(remaining as i64))
                .await?;
            ensure!(
                batch.len() <= remaining,
                "shard {} returned more rows than its limit",
                shard.index
            );
            remaining -= batch.len();
            out.extend(batch);
        }
        Ok(out)
    }

    async fn processed(
        &self,
        states: &[JobState],
        tags: &[String],
        count: usize,
    ) -> Result<Vec<Job>> {
        let _migration = self.migration_lock.read().await;
        let catalog = self.catalog.read().await;
        let mut out = Vec::new();
        let mut remaining = count;
        for shard in &catalog.shards {
            if remaining == 0 {
                break;
            }
            let batch = self
                .processed_for_shard(shard, false, states, tags, Some(remaining as i64))
                .await?;
            ensure!(
                batch.len() <= remaining,
                "shard {} returned more rows than its limit",
                shard.index
            );
            remaining -= batch.len();
            out.extend(batch);
        }
        Ok(out)
    }

    pub(crate) async fn unprocessed_for_shard(
        &self,
        shard: &Shard,
        tags: &[String],
        ordered: bool,
        limit: Option<i64>,
    ) -> Result<Vec<Job>> {
        let keys = [StatusKey::NotProcessed];
        if self.cache().is_known_empty(shard.index, &keys, tags) {
            return Ok(Vec::new());
        }
        let jobs = storage::unprocessed_jobs(&self.pool, shard, tags, ordered, limit).await?;
        if jobs.is_empty() {
            self.cache().mark_empty(shard.index, &keys, tags);
        }
        Ok(jobs)
    }

    pub(crate) async fn processed_for_shard(
        &self,
        shard: &Shard,
        get_all: bool,
        states: &[JobState],
        tags: &[String],
        limit: Option<i64>,
    ) -> Result<Vec<Job>> {
        let keys: Vec<StatusKey> = states.iter().map(|s| StatusKey::InState(*s)).collect();
        if self.cache().is_known_empty(shard.index, &keys, tags) {
            return Ok(Vec::new());
        }
        let jobs = storage::processed_jobs(&self.pool, shard, get_all, states, tags, limit).await?;
        if jobs.is_empty() {
            self.cache().mark_empty(shard.index, &keys, tags);
        }
        Ok(jobs)
    }

    pub(crate) fn cache(&self) -> MutexGuard<'_, EmptyResultCache> {
        lock_unpoisoned(&self.cache)
    }

    /// The single fatal-error channel: dump whatever state is reachable
    /// without blocking, then abort. The in-memory catalog may be ahead of
    /// or behind the database here; restart-time journal recovery is the
    /// only repair path.
    pub(crate) fn fatal(&self, context: &str, err: &Error) -> ! {
        match self.catalog.try_read() {
            Ok(catalog) => {
                error!(shards = ?catalog.shards, ranges = ?catalog.ranges, "catalog at failure")
            }
            Err(_) => error!("catalog lock held at failure; skipping dump"),
        }
        error!(cache = ?*self.cache(), "empty-result cache at failure");
        error!(context, error = %err, "unrecoverable job store failure, aborting");
        std::process::abort();
    }
}

/// Recover a std mutex guard even if a previous holder panicked; the data
/// behind both store mutexes stays consistent across panics.
fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

async fn create_state_enum(pool: &PgPool) -> Result<()> {
    sqlx::query(
        "DO $$ BEGIN \
           CREATE TYPE job_state_type AS ENUM (\
             'waiting', 'executing', 'succeeded', \
             'waiting_retry', 'failed', 'aborted'); \
         EXCEPTION WHEN duplicate_object THEN null; \
         END $$",
    )
    .execute(pool)
    .await?;
    Ok(())
}

/// Split a job-id-sorted status batch along the range index.
///
/// Returns, per range that received rows, the index span of those rows,
/// plus the start of the tail lying above every range (owned by the newest
/// shard). A row below the first range would reference a job that was
/// compacted away, which is a caller contract violation.
fn bucket_by_range(
    statuses: &[JobStatus],
    ranges: &[ShardRange],
) -> Result<(Vec<(usize, Range<usize>)>, usize)> {
    let mut buckets = Vec::new();
    let mut pos = 0;
    for (range_idx, range) in ranges.iter().enumerate() {
        if pos >= statuses.len() {
            break;
        }
        ensure!(
            statuses[pos].job_id >= range.min_job_id,
            "status for job {} lies below every remaining shard range",
            statuses[pos].job_id
        );
        let start = pos;
        while pos < statuses.len() && statuses[pos].job_id <= range.max_job_id {
            pos += 1;
        }
        if pos > start {
            buckets.push((range_idx, start..pos));
        }
    }
    Ok((buckets, pos))
}
