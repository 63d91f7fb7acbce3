//! Shard identity and ordering.
//!
//! A shard is a pair of tables, `<prefix>_jobs_<idx>` and
//! `<prefix>_job_status_<idx>`, holding a contiguous range of job ids and
//! their status history. Roll-over shards carry a single integer index
//! (level 0); compaction shards carry an `a_b` index (level 1) and sort
//! strictly between level-0 `a` and `a + 1`. Immediately after a level-1
//! shard is installed everything before it is deleted, so two levels are
//! always enough.

use crate::errors::{Error, Result, ensure};
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Position of a shard in the total order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ShardIndex {
    /// Roll-over shard, e.g. `3`.
    Level0(u32),
    /// Compaction shard, e.g. `3_1`, sorting between `3` and `4`.
    Level1(u32, u32),
}

impl ShardIndex {
    fn sort_key(self) -> (u32, u32) {
        match self {
            ShardIndex::Level0(a) => (a, 0),
            ShardIndex::Level1(a, b) => (a, b),
        }
    }

    /// First index component: `a` for both `a` and `a_b`.
    pub(crate) fn base(self) -> u32 {
        self.sort_key().0
    }

    /// Index for the next roll-over shard. Only a level-0 shard may be the
    /// newest, so appending after a level-1 shard is an invariant violation.
    pub(crate) fn next_level0(self) -> Result<ShardIndex> {
        match self {
            ShardIndex::Level0(a) => Ok(ShardIndex::Level0(a + 1)),
            ShardIndex::Level1(..) => Err(Error::invariant(format!(
                "newest shard must be level-0, found {self}"
            ))),
        }
    }

    /// Index for a compaction shard placed directly after `self`.
    pub(crate) fn level1_successor(self) -> ShardIndex {
        match self {
            ShardIndex::Level0(a) => ShardIndex::Level1(a, 1),
            ShardIndex::Level1(a, b) => ShardIndex::Level1(a, b + 1),
        }
    }
}

impl Ord for ShardIndex {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for ShardIndex {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ShardIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShardIndex::Level0(a) => write!(f, "{a}"),
            ShardIndex::Level1(a, b) => write!(f, "{a}_{b}"),
        }
    }
}

impl FromStr for ShardIndex {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let component = |part: &str| -> Result<u32> {
            part.parse()
                .map_err(|_| Error::invariant(format!("bad shard index component {part:?} in {s:?}")))
        };
        let parts: Vec<&str> = s.split('_').collect();
        match parts.as_slice() {
            [a] => Ok(ShardIndex::Level0(component(a)?)),
            [a, b] => Ok(ShardIndex::Level1(component(a)?, component(b)?)),
            _ => Err(Error::invariant(format!(
                "shard index {s:?} has more than two levels"
            ))),
        }
    }
}

impl Serialize for ShardIndex {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ShardIndex {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(D::Error::custom)
    }
}

/// One table pair. Serialized into journal payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Shard {
    pub(crate) job_table: String,
    pub(crate) job_status_table: String,
    pub(crate) index: ShardIndex,
}

impl Shard {
    pub(crate) fn new(prefix: &str, index: ShardIndex) -> Shard {
        Shard {
            job_table: format!("{prefix}_jobs_{index}"),
            job_status_table: format!("{prefix}_job_status_{index}"),
            index,
        }
    }
}

/// Inclusive job-id range of a non-newest shard. The newest shard has no
/// range entry: it is being appended to, and caching a partial maximum
/// would race with concurrent stores.
#[derive(Debug, Clone)]
pub(crate) struct ShardRange {
    pub(crate) min_job_id: i64,
    pub(crate) max_job_id: i64,
    pub(crate) shard: Shard,
}

/// Validate an insert-before target and produce the new compaction shard's
/// index. `shards` is the current ordered list; inserting before the first
/// shard is forbidden.
pub(crate) fn level1_index_before(shards: &[Shard], before: &ShardIndex) -> Result<ShardIndex> {
    let pos = shards
        .iter()
        .position(|s| s.index == *before)
        .ok_or_else(|| Error::invariant(format!("shard {before} not in the current list")))?;
    ensure!(pos > 0, "cannot insert a compaction shard before the first shard");
    ensure!(
        matches!(before, ShardIndex::Level0(_)),
        "compaction destination must precede a level-0 shard, found {before}"
    );
    let prev = &shards[pos - 1];
    ensure!(
        before.base() == prev.index.base() + 1,
        "shards {} and {before} are not adjacent level-0 numbers",
        prev.index
    );
    Ok(prev.index.level1_successor())
}
