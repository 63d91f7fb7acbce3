#![allow(missing_docs)]
#![allow(clippy::expect_used)]
#![allow(clippy::panic)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::indexing_slicing)]

use chrono::Utc;
use claims::{assert_ge, assert_some};
use jobshard::{Config, JobState, JobStatus, JobStore, NewJob};
use serde_json::json;
use sqlx::PgPool;
use std::time::Duration;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test utilities and common setup
mod test_utils {
    use super::*;
    use testcontainers::runners::AsyncRunner;

    /// Boot a throwaway PostgreSQL and return a pool plus the container
    /// handle (dropping the handle kills the database).
    pub(super) async fn setup_test_db() -> anyhow::Result<(PgPool, ContainerAsync<Postgres>)> {
        let container = Postgres::default().start().await?;
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        let pool = PgPool::connect(&url).await?;
        Ok((pool, container))
    }

    /// A second pool to the same container, for probing after a store has
    /// closed its own pool in `tear_down`.
    pub(super) async fn connect_again(
        container: &ContainerAsync<Postgres>,
    ) -> anyhow::Result<PgPool> {
        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let url = format!("postgresql://postgres:postgres@{host}:{port}/postgres");
        Ok(PgPool::connect(&url).await?)
    }

    pub(super) fn fast_config(prefix: &str, max_shard_size: i64) -> Config {
        let mut config = Config::new(prefix);
        config.clear_all = true;
        config.max_shard_size = max_shard_size;
        config.check_interval = Duration::from_millis(100);
        config.check_jitter = Duration::ZERO;
        config
    }

    pub(super) fn job(tag: &str) -> NewJob {
        let now = Utc::now().naive_utc();
        NewJob {
            uuid: Uuid::new_v4(),
            custom_val: tag.into(),
            event_payload: json!({"event_type": "click"}),
            created_at: now,
            expire_at: now,
        }
    }

    /// A status row whose retry time is already in the past, so processed
    /// reads return the job immediately.
    pub(super) fn status(job_id: i64, state: JobState, attempt: i16) -> JobStatus {
        let now = Utc::now().naive_utc();
        JobStatus {
            job_id,
            job_state: state,
            attempt,
            exec_time: now,
            retry_time: now - chrono::Duration::hours(1),
            error_code: "202".into(),
            error_response: json!({"success": "OK"}),
        }
    }

    pub(super) async fn table_exists(pool: &PgPool, name: &str) -> anyhow::Result<bool> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM pg_catalog.pg_tables WHERE tablename = $1")
                .bind(name)
                .fetch_one(pool)
                .await?;
        Ok(count == 1)
    }

    /// Poll until a table appears or disappears; the maintenance task runs
    /// on its own clock.
    pub(super) async fn wait_for_table(
        pool: &PgPool,
        name: &str,
        present: bool,
    ) -> anyhow::Result<()> {
        for _ in 0..100 {
            if table_exists(pool, name).await? == present {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        anyhow::bail!("timed out waiting for table {name} (present = {present})");
    }
}

#[tokio::test]
async fn stored_jobs_come_back_unprocessed_exactly_once() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::setup(pool, test_utils::fast_config("t_roundtrip", 100_000)).await;

    let batch = vec![
        test_utils::job("click"),
        test_utils::job("click"),
        test_utils::job("pageview"),
    ];
    store.store(&batch).await;

    let all = store.get_unprocessed(&[], 100).await;
    assert_eq!(all.len(), 3);
    // Oldest-first scan returns insertion order within a single shard.
    assert!(all.windows(2).all(|w| w[0].job_id < w[1].job_id));

    let clicks = store.get_unprocessed(&["click".into()], 100).await;
    assert_eq!(clicks.len(), 2);
    assert!(clicks.iter().all(|job| job.custom_val == "click"));

    // count = 0 always short-circuits.
    assert!(store.get_unprocessed(&[], 0).await.is_empty());
    assert!(store.get_processed(&[JobState::Failed], &[], 0).await.is_empty());

    // An empty read marks the combination empty; a subsequent store must
    // invalidate that mark.
    assert!(store.get_unprocessed(&["missing".into()], 100).await.is_empty());
    store.store(&[test_utils::job("missing")]).await;
    assert_eq!(store.get_unprocessed(&["missing".into()], 100).await.len(), 1);

    store.tear_down().await;
    Ok(())
}

#[tokio::test]
async fn status_transitions_drive_the_processed_queries() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let store = JobStore::setup(pool, test_utils::fast_config("t_status", 100_000)).await;

    store
        .store(&[
            test_utils::job("click"),
            test_utils::job("click"),
            test_utils::job("click"),
        ])
        .await;
    let jobs = store.get_unprocessed(&[], 100).await;
    let ids: Vec<i64> = jobs.iter().map(|job| job.job_id).collect();

    let executing: Vec<JobStatus> = ids
        .iter()
        .map(|&id| test_utils::status(id, JobState::Executing, 1))
        .collect();
    store.update_job_status(executing, &["click".into()]).await;

    assert!(store.get_unprocessed(&[], 100).await.is_empty());
    assert_eq!(store.get_executing(&[], 100).await.len(), 3);

    store
        .update_job_status(
            vec![
                test_utils::status(ids[0], JobState::Succeeded, 1),
                test_utils::status(ids[1], JobState::Failed, 2),
                test_utils::status(ids[2], JobState::WaitingRetry, 2),
            ],
            &["click".into()],
        )
        .await;

    let to_retry = store.get_to_retry(&[], 100).await;
    assert_eq!(to_retry.len(), 1);
    assert_eq!(to_retry[0].job_id, ids[1]);
    let last = assert_some!(to_retry[0].last_status.as_ref());
    assert_eq!(last.job_state, JobState::Failed);
    assert_eq!(last.attempt, 2);

    let waiting_retry = store.get_processed(&[JobState::WaitingRetry], &[], 100).await;
    assert_eq!(waiting_retry.len(), 1);
    assert_eq!(waiting_retry[0].job_id, ids[2]);

    // The latest row wins: nothing is still executing.
    assert!(store.get_executing(&[], 100).await.is_empty());

    // A retry time in the future hides the job from processed reads.
    let mut future_retry = test_utils::status(ids[1], JobState::Failed, 3);
    future_retry.retry_time = Utc::now().naive_utc() + chrono::Duration::hours(1);
    store.update_job_status(vec![future_retry], &[]).await;
    assert!(store.get_to_retry(&[], 100).await.is_empty());

    store.tear_down().await;
    Ok(())
}

#[tokio::test]
async fn rollover_keeps_job_ids_monotonic_across_shards() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let probe = pool.clone();
    let store = JobStore::setup(pool, test_utils::fast_config("t_roll", 3)).await;

    // Four jobs push the newest shard over max_shard_size; the background
    // task then rolls shard 2.
    for _ in 0..4 {
        store.store(&[test_utils::job("click")]).await;
    }
    test_utils::wait_for_table(&probe, "t_roll_jobs_2", true).await?;

    store.store(&[test_utils::job("click")]).await;
    let jobs = store.get_unprocessed(&[], 100).await;
    assert_eq!(jobs.len(), 5);
    // Ids keep increasing across the shard boundary thanks to the
    // sequence bump at roll-over.
    assert!(jobs.windows(2).all(|w| w[0].job_id < w[1].job_id));
    let max_in_shard_1: i64 =
        sqlx::query_scalar("SELECT MAX(job_id) FROM t_roll_jobs_1")
            .fetch_one(&probe)
            .await?;
    let min_in_shard_2: i64 =
        sqlx::query_scalar("SELECT MIN(job_id) FROM t_roll_jobs_2")
            .fetch_one(&probe)
            .await?;
    assert!(max_in_shard_1 < min_in_shard_2);

    // A batch spanning both shards commits piecewise, one append per
    // status table.
    store
        .update_job_status(
            vec![
                test_utils::status(jobs[0].job_id, JobState::Executing, 1),
                test_utils::status(jobs[4].job_id, JobState::Executing, 1),
            ],
            &[],
        )
        .await;
    let in_first: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t_roll_job_status_1")
        .fetch_one(&probe)
        .await?;
    let in_second: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t_roll_job_status_2")
        .fetch_one(&probe)
        .await?;
    assert_eq!(in_first, 1);
    assert_eq!(in_second, 1);

    store.tear_down().await;
    Ok(())
}

#[tokio::test]
async fn compaction_migrates_live_jobs_and_drops_the_source() -> anyhow::Result<()> {
    let (pool, _container) = test_utils::setup_test_db().await?;
    let probe = pool.clone();
    let store = JobStore::setup(pool, test_utils::fast_config("t_compact", 6)).await;

    // Seven jobs land in shard 1 before the roll to shard 2.
    let batch: Vec<NewJob> = (0..7).map(|_| test_utils::job("click")).collect();
    store.store(&batch).await;
    test_utils::wait_for_table(&probe, "t_compact_jobs_2", true).await?;

    let jobs = store.get_unprocessed(&[], 100).await;
    assert_eq!(jobs.len(), 7);
    let ids: Vec<i64> = jobs.iter().map(|job| job.job_id).collect();

    // Six of seven terminal crosses the 0.8 threshold; the failed job is
    // the only live one.
    let mut statuses: Vec<JobStatus> = ids[..6]
        .iter()
        .map(|&id| test_utils::status(id, JobState::Succeeded, 1))
        .collect();
    statuses.push(test_utils::status(ids[6], JobState::Failed, 3));
    store.update_job_status(statuses, &[]).await;

    test_utils::wait_for_table(&probe, "t_compact_jobs_1", false).await?;
    assert!(test_utils::table_exists(&probe, "t_compact_jobs_1_1").await?);

    // The live job survived with its id and latest status; the terminal
    // jobs and their history are gone.
    let to_retry = store.get_to_retry(&[], 100).await;
    assert_eq!(to_retry.len(), 1);
    assert_eq!(to_retry[0].job_id, ids[6]);
    let last = assert_some!(to_retry[0].last_status.as_ref());
    assert_eq!(last.job_state, JobState::Failed);
    assert_eq!(last.attempt, 3);
    assert!(store.get_processed(&[JobState::Succeeded], &[], 100).await.is_empty());
    let migrated_rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t_compact_job_status_1_1")
        .fetch_one(&probe)
        .await?;
    assert_eq!(migrated_rows, 1);

    // Status updates route to the compaction shard through the rebuilt
    // range index.
    store
        .update_job_status(
            vec![test_utils::status(ids[6], JobState::Succeeded, 4)],
            &[],
        )
        .await;
    assert!(store.get_to_retry(&[], 100).await.is_empty());

    store.tear_down().await;
    Ok(())
}

#[tokio::test]
async fn jobs_survive_a_restart_without_clear_all() -> anyhow::Result<()> {
    let (pool, container) = test_utils::setup_test_db().await?;
    let store = JobStore::setup(pool, test_utils::fast_config("t_restart", 100_000)).await;
    store.store(&[test_utils::job("click"), test_utils::job("click")]).await;
    store.tear_down().await;

    let pool = test_utils::connect_again(&container).await?;
    let mut config = Config::new("t_restart");
    config.check_interval = Duration::from_millis(100);
    let store = JobStore::setup(pool, config).await;
    assert_eq!(store.get_unprocessed(&[], 100).await.len(), 2);
    store.tear_down().await;

    // clear_all wipes everything under the prefix.
    let pool = test_utils::connect_again(&container).await?;
    let store = JobStore::setup(pool, test_utils::fast_config("t_restart", 100_000)).await;
    assert!(store.get_unprocessed(&[], 100).await.is_empty());
    store.tear_down().await;
    Ok(())
}

#[tokio::test]
async fn recovery_undoes_an_interrupted_shard_add() -> anyhow::Result<()> {
    // The probe pool stays open across the store's tear_down, which closes
    // the store's own pool.
    let (probe, container) = test_utils::setup_test_db().await?;
    let pool = test_utils::connect_again(&container).await?;
    let store = JobStore::setup(pool, test_utils::fast_config("t_rec_add", 100_000)).await;
    store.store(&[test_utils::job("click")]).await;
    store.tear_down().await;

    // Simulate a crash after the journal entry but before the new shard's
    // tables were created.
    let payload = json!({
        "from": [],
        "to": {
            "job_table": "t_rec_add_jobs_5",
            "job_status_table": "t_rec_add_job_status_5",
            "index": "5"
        }
    });
    sqlx::query(
        "INSERT INTO t_rec_add_journal (operation, done, operation_payload, start_time) \
         VALUES ('ADD_DS', FALSE, $1, $2)",
    )
    .bind(&payload)
    .bind(Utc::now().naive_utc())
    .execute(&probe)
    .await?;

    let pool = test_utils::connect_again(&container).await?;
    let mut config = Config::new("t_rec_add");
    config.check_interval = Duration::from_millis(100);
    let store = JobStore::setup(pool, config).await;

    // The undo is a no-op drop plus deleting the journal row; the catalog
    // is exactly as before the crash.
    assert!(!test_utils::table_exists(&probe, "t_rec_add_jobs_5").await?);
    let pending: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM t_rec_add_journal WHERE done = FALSE")
            .fetch_one(&probe)
            .await?;
    assert_eq!(pending, 0);
    assert_eq!(store.get_unprocessed(&[], 100).await.len(), 1);
    store.tear_down().await;
    Ok(())
}

#[tokio::test]
async fn recovery_drops_a_partially_copied_destination() -> anyhow::Result<()> {
    let (probe, container) = test_utils::setup_test_db().await?;
    let pool = test_utils::connect_again(&container).await?;
    let store = JobStore::setup(pool, test_utils::fast_config("t_rec_copy", 100_000)).await;
    store.store(&[test_utils::job("click"), test_utils::job("click")]).await;
    store.tear_down().await;

    // Simulate a crash mid-copy: the destination exists and holds some
    // rows, the journal entry is still open, the source is untouched.
    sqlx::query(
        "CREATE TABLE t_rec_copy_jobs_1_1 (\
           job_id BIGSERIAL PRIMARY KEY, uuid UUID NOT NULL, \
           custom_val VARCHAR(64) NOT NULL, event_payload JSONB NOT NULL, \
           created_at TIMESTAMP NOT NULL, expire_at TIMESTAMP NOT NULL)",
    )
    .execute(&probe)
    .await?;
    sqlx::query(
        "CREATE TABLE t_rec_copy_job_status_1_1 (\
           id BIGSERIAL PRIMARY KEY, \
           job_id BIGINT REFERENCES t_rec_copy_jobs_1_1(job_id), \
           job_state job_state_type, attempt SMALLINT, \
           exec_time TIMESTAMP, retry_time TIMESTAMP, \
           error_code VARCHAR(32), error_response JSONB)",
    )
    .execute(&probe)
    .await?;
    let payload = json!({
        "from": [{
            "job_table": "t_rec_copy_jobs_1",
            "job_status_table": "t_rec_copy_job_status_1",
            "index": "1"
        }],
        "to": {
            "job_table": "t_rec_copy_jobs_1_1",
            "job_status_table": "t_rec_copy_job_status_1_1",
            "index": "1_1"
        }
    });
    sqlx::query(
        "INSERT INTO t_rec_copy_journal (operation, done, operation_payload, start_time) \
         VALUES ('MIGRATE_COPY', FALSE, $1, $2)",
    )
    .bind(&payload)
    .bind(Utc::now().naive_utc())
    .execute(&probe)
    .await?;

    let pool = test_utils::connect_again(&container).await?;
    let mut config = Config::new("t_rec_copy");
    config.check_interval = Duration::from_millis(100);
    let store = JobStore::setup(pool, config).await;

    // The half-copied destination is gone and the sources are intact, so
    // the next maintenance pass can redo the migration from scratch.
    assert!(!test_utils::table_exists(&probe, "t_rec_copy_jobs_1_1").await?);
    assert!(test_utils::table_exists(&probe, "t_rec_copy_jobs_1").await?);
    assert_eq!(store.get_unprocessed(&[], 100).await.len(), 2);
    store.tear_down().await;
    Ok(())
}

#[tokio::test]
async fn recovery_finishes_an_interrupted_delete() -> anyhow::Result<()> {
    let (probe, container) = test_utils::setup_test_db().await?;
    let pool = test_utils::connect_again(&container).await?;
    let store = JobStore::setup(pool, test_utils::fast_config("t_rec_del", 100_000)).await;
    store.store(&[test_utils::job("click")]).await;
    store.tear_down().await;

    // Simulate a crash mid-delete: shard 9 in the payload is already gone,
    // shard 1 is still present.
    let payload = json!({
        "from": [
            {
                "job_table": "t_rec_del_jobs_9",
                "job_status_table": "t_rec_del_job_status_9",
                "index": "9"
            },
            {
                "job_table": "t_rec_del_jobs_1",
                "job_status_table": "t_rec_del_job_status_1",
                "index": "1"
            }
        ]
    });
    sqlx::query(
        "INSERT INTO t_rec_del_journal (operation, done, operation_payload, start_time) \
         VALUES ('MIGRATE_DEL', FALSE, $1, $2)",
    )
    .bind(&payload)
    .bind(Utc::now().naive_utc())
    .execute(&probe)
    .await?;

    let pool = test_utils::connect_again(&container).await?;
    let mut config = Config::new("t_rec_del");
    config.check_interval = Duration::from_millis(100);
    let store = JobStore::setup(pool, config).await;

    // Deletion completed (it cannot be undone), the journal row is closed,
    // and setup re-created an empty shard 1.
    let open: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM t_rec_del_journal WHERE done = FALSE")
        .fetch_one(&probe)
        .await?;
    assert_eq!(open, 0);
    let done: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM t_rec_del_journal WHERE done = TRUE AND operation = 'MIGRATE_DEL'",
    )
    .fetch_one(&probe)
    .await?;
    assert_ge!(done, 1);
    assert!(store.get_unprocessed(&[], 100).await.is_empty());
    store.tear_down().await;
    Ok(())
}
