//! Store configuration.

use crate::errors::{Result, ensure};
use std::time::Duration;

const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_CHECK_JITTER: Duration = Duration::from_millis(100);

/// Configuration for a [`JobStore`](crate::JobStore) instance.
///
/// The defaults match a queue sustaining ~100k jobs per shard with
/// compaction once 80% of a shard's jobs are terminal. A process may host
/// several stores as long as their `table_prefix` values differ.
#[derive(Debug, Clone)]
pub struct Config {
    /// Prefix for every table owned by this instance. Must be a valid SQL
    /// identifier; it is what separates multiple stores sharing a database.
    pub table_prefix: String,
    /// Drop all existing shard tables and the journal at setup instead of
    /// recovering from the journal.
    pub clear_all: bool,
    /// A shard whose newest job is younger than this is never compacted,
    /// regardless of how many of its jobs are terminal. `None` disables the
    /// window.
    pub retention_period: Option<Duration>,
    /// Compact a shard once this fraction of its jobs is terminal.
    pub job_done_migrate_threshold: f64,
    /// Compact a shard once status rows exceed this multiple of its jobs.
    pub job_status_migrate_threshold: f64,
    /// Roll a new shard once the newest one holds more jobs than this. The
    /// check runs in the background, so a shard may overshoot briefly.
    pub max_shard_size: i64,
    /// Maximum number of shards compacted into one destination per pass.
    pub max_migrate_once: usize,
    /// How often the maintenance task wakes up.
    pub check_interval: Duration,
    /// Maximum random jitter added to `check_interval`.
    pub check_jitter: Duration,
}

impl Config {
    /// Create a configuration with the given table prefix and default
    /// tuning knobs.
    pub fn new(table_prefix: impl Into<String>) -> Self {
        Self {
            table_prefix: table_prefix.into(),
            clear_all: false,
            retention_period: None,
            job_done_migrate_threshold: 0.8,
            job_status_migrate_threshold: 5.0,
            max_shard_size: 100_000,
            max_migrate_once: 10,
            check_interval: DEFAULT_CHECK_INTERVAL,
            check_jitter: DEFAULT_CHECK_JITTER,
        }
    }

    pub(crate) fn validate(&self) -> Result<()> {
        ensure!(!self.table_prefix.is_empty(), "table_prefix must not be empty");
        let mut chars = self.table_prefix.chars();
        let head_ok = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
        let tail_ok = chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        ensure!(
            head_ok && tail_ok,
            "table_prefix {:?} is not a valid identifier",
            self.table_prefix
        );
        ensure!(self.max_shard_size > 0, "max_shard_size must be positive");
        ensure!(self.max_migrate_once > 0, "max_migrate_once must be positive");
        ensure!(
            self.job_done_migrate_threshold > 0.0 && self.job_done_migrate_threshold <= 1.0,
            "job_done_migrate_threshold must be in (0, 1]"
        );
        ensure!(
            self.job_status_migrate_threshold > 0.0,
            "job_status_migrate_threshold must be positive"
        );
        Ok(())
    }
}
