//! Per-shard sync state: [`Task`], [`SubTask`], and [`HealTask`].
//!
//! Within one task, subtask ranges never overlap and never re-cover an
//! index that is already resolved or sitting in the heal set: every index
//! of the shard is accounted for by exactly one of {resolved,
//! pending-in-a-subtask, pending-in-heal}. Subtasks are kept sorted by
//! `first` so task comparison and snapshots are deterministic.

use std::collections::BTreeSet;

use reef_types::Contract;
use serde::{Deserialize, Serialize};

/// A contiguous deficit range `[first, last)` being range-synced.
///
/// `next` marks the first unfetched index; it only ever advances, and only
/// past indices whose outcome (verified or healed) has been recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubTask {
    /// First index of the range. Immutable; identifies the subtask.
    pub first: u64,
    /// Next unfetched index, `first <= next <= last`.
    pub next: u64,
    /// One past the last index of the range.
    pub last: u64,
    /// Set while a batch starting at `next` is outstanding.
    pub(crate) in_flight: bool,
}

impl SubTask {
    /// A fresh subtask covering `[first, last)`.
    pub fn new(first: u64, last: u64) -> Self {
        debug_assert!(first < last);
        Self {
            first,
            next: first,
            last,
            in_flight: false,
        }
    }

    /// Whether every index of the range has been accounted for.
    pub fn is_resolved(&self) -> bool {
        self.next == self.last
    }
}

/// Individually deficit indices needing point re-fetch.
///
/// Entries land here when a peer reported them absent, when their payload
/// failed commitment verification, or when they were found stale.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealTask {
    /// Indices waiting to be fetched.
    pub indices: BTreeSet<u64>,
    /// Indices currently being fetched; disjoint from `indices` so no
    /// index ever has two requests in flight.
    pub(crate) in_flight: BTreeSet<u64>,
}

impl HealTask {
    /// Whether nothing is pending and nothing is outstanding.
    pub fn is_empty(&self) -> bool {
        self.indices.is_empty() && self.in_flight.is_empty()
    }

    /// Total pending indices, outstanding included.
    pub fn len(&self) -> usize {
        self.indices.len() + self.in_flight.len()
    }

    /// Move up to `cap` indices into the in-flight set and return them.
    pub(crate) fn drain_batch(&mut self, cap: usize) -> Vec<u64> {
        let batch: Vec<u64> = self.indices.iter().take(cap).copied().collect();
        for idx in &batch {
            self.indices.remove(idx);
            self.in_flight.insert(*idx);
        }
        batch
    }

    /// Record the outcome of an in-flight index.
    pub(crate) fn settle(&mut self, idx: u64, resolved: bool) {
        self.in_flight.remove(&idx);
        if !resolved {
            self.indices.insert(idx);
        }
    }
}

/// Observable lifecycle of a shard sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    /// Querying metadata and computing the deficit.
    Initializing,
    /// Range-syncing subtasks (heal may already be accumulating).
    RangeSyncing,
    /// All subtasks resolved, heal entries outstanding.
    Healing,
    /// Shard content matches the authoritative metadata.
    Done,
}

/// Sync state for one `(contract, shard_index)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Contract the shard belongs to.
    pub contract: Contract,
    /// The shard being synced.
    pub shard_index: u64,
    /// Pending ranges, sorted by `first`, pairwise disjoint.
    pub subtasks: Vec<SubTask>,
    /// Indices needing point re-fetch.
    pub heal: HealTask,
    /// Observable lifecycle state.
    pub state: SyncState,
}

impl Task {
    /// An empty task in the `Initializing` state.
    pub fn new(contract: Contract, shard_index: u64) -> Self {
        Self {
            contract,
            shard_index,
            subtasks: Vec::new(),
            heal: HealTask::default(),
            state: SyncState::Initializing,
        }
    }

    /// Collapse sorted deficit indices into contiguous subtask ranges.
    ///
    /// Indices already in the heal set are skipped so no index is covered
    /// twice.
    pub fn add_deficit(&mut self, sorted_deficit: &[u64]) {
        let mut run_start: Option<u64> = None;
        let mut prev = 0u64;

        for &idx in sorted_deficit {
            if self.heal.indices.contains(&idx) || self.heal.in_flight.contains(&idx) {
                continue;
            }
            match run_start {
                None => {
                    run_start = Some(idx);
                }
                Some(_) if idx == prev + 1 => {}
                Some(start) => {
                    self.subtasks.push(SubTask::new(start, prev + 1));
                    run_start = Some(idx);
                }
            }
            prev = idx;
        }
        if let Some(start) = run_start {
            self.subtasks.push(SubTask::new(start, prev + 1));
        }
        self.subtasks.sort_by_key(|st| st.first);
    }

    /// Whether all subtasks are resolved and the heal set is empty.
    pub fn is_done(&self) -> bool {
        self.subtasks.iter().all(SubTask::is_resolved) && self.heal.is_empty()
    }

    /// Recompute the observable state from the pending work.
    pub fn update_state(&mut self) {
        self.state = if self.is_done() {
            SyncState::Done
        } else if self.subtasks.iter().all(SubTask::is_resolved) {
            SyncState::Healing
        } else {
            SyncState::RangeSyncing
        };
    }

    /// Indices not yet fetched by any subtask.
    pub fn pending_range_indices(&self) -> u64 {
        self.subtasks.iter().map(|st| st.last - st.next).sum()
    }

    /// Persistable snapshot of this task.
    pub fn snapshot(&self) -> TaskSnapshot {
        TaskSnapshot {
            subtasks: self
                .subtasks
                .iter()
                .map(|st| (st.first, st.next, st.last))
                .collect(),
            heal: self
                .heal
                .indices
                .iter()
                .chain(self.heal.in_flight.iter())
                .copied()
                .collect(),
            done: self.is_done(),
        }
    }
}

/// Durable snapshot of a [`Task`], stored in the progress store.
///
/// In-flight markers are deliberately not persisted; a restart has no
/// outstanding requests.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    /// `(first, next, last)` per subtask, sorted by `first`.
    pub subtasks: Vec<(u64, u64, u64)>,
    /// Pending heal indices, ascending.
    pub heal: Vec<u64>,
    /// Whether the shard had finished syncing.
    pub done: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> Contract {
        Contract::from([0x33u8; 20])
    }

    #[test]
    fn test_deficit_runs_collapse_into_subtasks() {
        let mut task = Task::new(contract(), 0);
        task.add_deficit(&[0, 1, 2, 5, 6, 9]);

        assert_eq!(task.subtasks.len(), 3);
        assert_eq!((task.subtasks[0].first, task.subtasks[0].last), (0, 3));
        assert_eq!((task.subtasks[1].first, task.subtasks[1].last), (5, 7));
        assert_eq!((task.subtasks[2].first, task.subtasks[2].last), (9, 10));
        for st in &task.subtasks {
            assert_eq!(st.next, st.first);
        }
    }

    #[test]
    fn test_deficit_skips_heal_indices() {
        let mut task = Task::new(contract(), 0);
        task.heal.indices.insert(5);
        task.add_deficit(&[4, 5, 6]);

        // 5 is already accounted for by the heal set; the run splits.
        assert_eq!(task.subtasks.len(), 2);
        assert_eq!((task.subtasks[0].first, task.subtasks[0].last), (4, 5));
        assert_eq!((task.subtasks[1].first, task.subtasks[1].last), (6, 7));
    }

    #[test]
    fn test_subtasks_sorted_by_first() {
        let mut task = Task::new(contract(), 0);
        task.add_deficit(&[8]);
        task.add_deficit(&[2]);
        assert_eq!(task.subtasks[0].first, 2);
        assert_eq!(task.subtasks[1].first, 8);
    }

    #[test]
    fn test_done_requires_resolved_and_empty_heal() {
        let mut task = Task::new(contract(), 0);
        assert!(task.is_done());

        task.add_deficit(&[0, 1]);
        assert!(!task.is_done());

        task.subtasks[0].next = task.subtasks[0].last;
        assert!(task.is_done());

        task.heal.indices.insert(7);
        assert!(!task.is_done());
        task.update_state();
        assert_eq!(task.state, SyncState::Healing);

        task.heal.settle(7, false);
        // settle() on a non-in-flight index leaves it pending.
        assert!(!task.is_done());
    }

    #[test]
    fn test_heal_drain_moves_to_in_flight() {
        let mut heal = HealTask::default();
        heal.indices.extend([1, 2, 3, 4]);

        let batch = heal.drain_batch(3);
        assert_eq!(batch, vec![1, 2, 3]);
        assert_eq!(heal.indices.len(), 1);
        assert_eq!(heal.in_flight.len(), 3);
        assert!(!heal.is_empty());

        heal.settle(1, true);
        heal.settle(2, false);
        heal.settle(3, true);
        assert_eq!(heal.indices, BTreeSet::from([2, 4]));
        assert!(heal.in_flight.is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip_postcard() {
        let mut task = Task::new(contract(), 1);
        task.add_deficit(&[0, 1, 2, 8]);
        task.subtasks[0].next = 2;
        task.heal.indices.insert(5);
        task.heal.in_flight.insert(6);

        let snapshot = task.snapshot();
        assert_eq!(snapshot.subtasks, vec![(0, 2, 3), (8, 8, 9)]);
        assert_eq!(snapshot.heal, vec![5, 6]);
        assert!(!snapshot.done);

        let encoded = postcard::to_allocvec(&snapshot).unwrap();
        let decoded: TaskSnapshot = postcard::from_bytes(&encoded).unwrap();
        assert_eq!(snapshot, decoded);
    }

    #[test]
    fn test_state_progression() {
        let mut task = Task::new(contract(), 0);
        assert_eq!(task.state, SyncState::Initializing);

        task.add_deficit(&[0, 1]);
        task.update_state();
        assert_eq!(task.state, SyncState::RangeSyncing);

        task.subtasks[0].next = task.subtasks[0].last;
        task.heal.indices.insert(0);
        task.update_state();
        assert_eq!(task.state, SyncState::Healing);

        task.heal.indices.clear();
        task.update_state();
        assert_eq!(task.state, SyncState::Done);
    }
}
