//! Negative cache for per-shard queries.
//!
//! When a query for a (shard, tag, state) combination returns no rows, the
//! combination is marked empty and later queries asking only for marked
//! combinations return `[]` without touching the database. Any write to the
//! shard clears the affected marks. The cache is a pure optimization:
//! correctness must hold with it disabled.

use crate::schema::JobState;
use crate::shard::ShardIndex;
use std::collections::HashMap;

/// Cache-side view of a job's status: either a concrete state or "has no
/// status row yet". The latter never appears in the database or public API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum StatusKey {
    NotProcessed,
    InState(JobState),
}

#[derive(Debug, Default)]
pub(crate) struct EmptyResultCache {
    marks: HashMap<(ShardIndex, String, StatusKey), bool>,
}

impl EmptyResultCache {
    /// Record that a query for every (tag, key) combination returned no
    /// rows. Empty filter sets mean "everything" and cannot be cached, so
    /// they are ignored.
    pub(crate) fn mark_empty(&mut self, shard: ShardIndex, keys: &[StatusKey], tags: &[String]) {
        if keys.is_empty() || tags.is_empty() {
            return;
        }
        for tag in tags {
            for key in keys {
                self.marks.insert((shard, tag.clone(), *key), true);
            }
        }
    }

    /// Clear marks after a write. With empty filter sets the write's reach
    /// is unknown, so every mark for the shard is dropped.
    pub(crate) fn clear(&mut self, shard: ShardIndex, keys: &[StatusKey], tags: &[String]) {
        if keys.is_empty() || tags.is_empty() {
            self.clear_shard(shard);
            return;
        }
        for tag in tags {
            for key in keys {
                self.marks.insert((shard, tag.clone(), *key), false);
            }
        }
    }

    /// Drop every mark for a shard. Used after job inserts and when a shard
    /// is deleted.
    pub(crate) fn clear_shard(&mut self, shard: ShardIndex) {
        self.marks.retain(|(s, _, _), _| *s != shard);
    }

    /// A query may be short-circuited only if every (tag, key) combination
    /// it asks about is marked empty. Empty filter sets never short-circuit.
    pub(crate) fn is_known_empty(
        &self,
        shard: ShardIndex,
        keys: &[StatusKey],
        tags: &[String],
    ) -> bool {
        if keys.is_empty() || tags.is_empty() {
            return false;
        }
        tags.iter().all(|tag| {
            keys.iter().all(|key| {
                self.marks
                    .get(&(shard, tag.clone(), *key))
                    .copied()
                    .unwrap_or(false)
            })
        })
    }
}
