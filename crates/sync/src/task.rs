//! Per-shard unit of sync work: a list of contiguous sub-tasks plus a
//! heal-task of individually-retried indices.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;
use std::time::{Duration, Instant};

use shardsync_core::{KvIndex, ShardKey};
use shardsync_storage::{PersistedSubTask, PersistedTask};

/// A contiguous range `[first, last]` with a drain cursor `next`.
/// `next > last` means the sub-task is fully drained. Accepted indices that
/// arrive ahead of `next` (out-of-order responses) are buffered in
/// `confirmed_ahead` until `next` can catch up to them.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubTask {
    pub first: KvIndex,
    pub last: KvIndex,
    pub next: KvIndex,
    confirmed_ahead: BTreeSet<KvIndex>,
}

impl SubTask {
    pub fn new(first: KvIndex, last: KvIndex) -> Self {
        Self {
            first,
            last,
            next: first,
            confirmed_ahead: BTreeSet::new(),
        }
    }

    pub fn is_drained(&self) -> bool {
        self.next > self.last
    }

    /// The next half-open range of at most `batch` indices still pending,
    /// or `None` if the sub-task is drained.
    pub fn pending_range(&self, batch: u64) -> Option<Range<KvIndex>> {
        if self.is_drained() || batch == 0 {
            return None;
        }
        let end = self.next.saturating_add(batch).min(self.last + 1);
        if end <= self.next {
            return None;
        }
        Some(self.next..end)
    }

    /// Marks `index` as written. Advances `next` only when `index` equals
    /// the current cursor; otherwise the index is recorded and compacted in
    /// once `next` reaches it.
    pub fn confirm(&mut self, index: KvIndex) {
        if index < self.first || index > self.last {
            return;
        }
        if index == self.next {
            self.next += 1;
            while self.confirmed_ahead.remove(&self.next) {
                self.next += 1;
            }
        } else if index > self.next {
            self.confirmed_ahead.insert(index);
        }
    }
}

/// One heal-task entry: a retry deadline plus an attempt count used to grow
/// the back-off on repeated failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct HealEntry {
    deadline: Instant,
    attempts: u32,
}

/// Set of individual indices scheduled for retry via list-requests.
#[derive(Clone, Debug, Default)]
pub struct HealTask {
    items: HashMap<KvIndex, HealEntry>,
}

impl HealTask {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn contains(&self, index: KvIndex) -> bool {
        self.items.contains_key(&index)
    }

    /// Inserts `index` with an immediately-due deadline (used for fresh
    /// tasks and for indices reloaded from persisted state, whose deadlines
    /// reset to "now" rather than being carried across restarts).
    pub fn insert_due_now(&mut self, index: KvIndex) {
        self.items.insert(
            index,
            HealEntry {
                deadline: Instant::now(),
                attempts: 0,
            },
        );
    }

    /// Inserts or refreshes `index` with a back-off deadline that grows
    /// exponentially with the number of prior attempts, capped so a single
    /// failing index can't starve retries indefinitely.
    pub fn insert_with_backoff(&mut self, index: KvIndex, base: Duration, cap: Duration) {
        let attempts = self
            .items
            .get(&index)
            .map(|e| e.attempts.saturating_add(1))
            .unwrap_or(0);
        let backoff = base.saturating_mul(1u32 << attempts.min(16)).min(cap);
        self.items.insert(
            index,
            HealEntry {
                deadline: Instant::now() + backoff,
                attempts,
            },
        );
    }

    pub fn remove(&mut self, index: KvIndex) {
        self.items.remove(&index);
    }

    /// Indices whose deadline has passed, oldest-deadline first, capped at
    /// `batch`.
    pub fn due(&self, now: Instant, batch: usize) -> Vec<KvIndex> {
        let mut due: Vec<_> = self
            .items
            .iter()
            .filter(|(_, e)| e.deadline <= now)
            .map(|(idx, e)| (*idx, e.deadline))
            .collect();
        due.sort_by_key(|(_, deadline)| *deadline);
        due.truncate(batch);
        due.into_iter().map(|(idx, _)| idx).collect()
    }

    pub fn indices(&self) -> Vec<KvIndex> {
        self.items.keys().copied().collect()
    }
}

/// Per-shard sync progress: the range work (sub-tasks), the retry work
/// (heal-task), and whether the shard's range+heal+empty-fill phases have
/// all completed.
#[derive(Clone, Debug)]
pub struct Task {
    pub shard: ShardKey,
    pub sub_tasks: Vec<SubTask>,
    pub heal: HealTask,
    pub done: bool,
}

impl Task {
    /// Builds a fresh task covering the on-chain-assigned prefix of the
    /// shard's range, `[S*E, min((S+1)*E, lastKvIndex))`, split into
    /// sub-tasks of at most `max_span` entries each. Indices at or beyond
    /// `lastKvIndex` are not yet assigned on chain; they are the empty-fill
    /// pass's responsibility, not a fetch target, so they are excluded here
    /// (the union of sub-task ranges, heal indices and the fill pass's
    /// range together still cover the shard's full index range).
    pub fn fresh(shard: ShardKey, entries_per_shard: u64, max_span: u64, last_kv_index: KvIndex) -> Self {
        let range = shard.index_range(entries_per_shard);
        let assigned_end = range.end.min(last_kv_index.max(range.start));
        let mut sub_tasks = Vec::new();
        let mut cursor = range.start;
        let span = max_span.max(1);
        while cursor < assigned_end {
            let last = (cursor + span - 1).min(assigned_end - 1);
            sub_tasks.push(SubTask::new(cursor, last));
            cursor = last + 1;
        }
        Self {
            shard,
            sub_tasks,
            heal: HealTask::new(),
            done: false,
        }
    }

    /// Reconstructs from persisted state, immediately eligible for retry
    /// (heal deadlines reset to zero on load, per the resolved open
    /// question on restart behavior).
    pub fn from_persisted(shard: ShardKey, persisted: PersistedTask) -> Self {
        let sub_tasks = persisted
            .sub_tasks
            .into_iter()
            .map(|p| {
                let mut st = SubTask::new(p.first, p.last);
                st.next = p.next;
                st
            })
            .collect();
        let mut heal = HealTask::new();
        for idx in persisted.heal_indices {
            heal.insert_due_now(idx);
        }
        Self {
            shard,
            sub_tasks,
            heal,
            done: persisted.done,
        }
    }

    /// Removes drained sub-tasks and recomputes `done` from whether any
    /// range or heal work remains. `empty_fill_done` folds in the
    /// empty-fill phase, which this type does not itself track.
    pub fn clean(&mut self, empty_fill_done: bool) {
        self.sub_tasks.retain(|st| !st.is_drained());
        self.done = self.sub_tasks.is_empty() && self.heal.is_empty() && empty_fill_done;
    }

    pub fn to_persisted(&self) -> PersistedTask {
        PersistedTask {
            sub_tasks: self
                .sub_tasks
                .iter()
                .map(|st| PersistedSubTask {
                    first: st.first,
                    last: st.last,
                    next: st.next,
                })
                .collect(),
            heal_indices: self.heal.indices(),
            done: self.done,
        }
    }

    /// True once every sub-task is drained (the heal-task may still hold
    /// work); this is the SYNCING -> HEALING transition point.
    pub fn ranges_drained(&self) -> bool {
        self.sub_tasks.iter().all(SubTask::is_drained)
    }

    /// The sub-task owning `index`, if any is still tracking it.
    pub fn sub_task_containing_mut(&mut self, index: KvIndex) -> Option<&mut SubTask> {
        self.sub_tasks
            .iter_mut()
            .find(|st| index >= st.first && index <= st.last)
    }
}
