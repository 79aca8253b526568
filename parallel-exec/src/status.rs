//! Dependency and status tracking for a window of in-flight tasks.
//!
//! Tasks are identified by their index in the window (`tx_num - first_tx_num`).
//! Each index is in at most one of three sorted sets: pending, in-progress and
//! complete. Indices in none of them are blocked on a discovered dependency.
//! Edges are only recorded when an abort named a lower task, so releasing
//! dependents on commit touches just the recorded ones.

use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Default)]
pub struct StatusManager {
    pending: Vec<usize>,
    in_progress: Vec<usize>,
    complete: Vec<usize>,
    /// blocker -> dependents
    dependency: HashMap<usize, BTreeSet<usize>>,
    /// dependent -> blockers
    blocker: HashMap<usize, BTreeSet<usize>>,
}

fn insert_in_list(list: &mut Vec<usize>, v: usize) {
    match list.last() {
        Some(&last) if v > last => list.push(v),
        None => list.push(v),
        _ => {
            if let Err(pos) = list.binary_search(&v) {
                list.insert(pos, v);
            }
        }
    }
}

fn remove_from_list(list: &mut Vec<usize>, v: usize) -> bool {
    match list.binary_search(&v) {
        Ok(pos) => {
            list.remove(pos);
            true
        }
        Err(_) => false,
    }
}

fn contains(list: &[usize], v: usize) -> bool {
    list.binary_search(&v).is_ok()
}

impl StatusManager {
    /// Creates a manager with every index in `0..num_tasks` pending.
    pub fn new(num_tasks: usize) -> Self {
        Self {
            pending: (0..num_tasks).collect(),
            ..Default::default()
        }
    }

    /// Moves the lowest pending index to in-progress.
    pub fn take_next_pending(&mut self) -> Option<usize> {
        if self.pending.is_empty() {
            return None;
        }
        let tx = self.pending.remove(0);
        insert_in_list(&mut self.in_progress, tx);
        Some(tx)
    }

    /// Moves `tx` from pending to in-progress.
    pub fn start(&mut self, tx: usize) {
        remove_from_list(&mut self.pending, tx);
        insert_in_list(&mut self.in_progress, tx);
    }

    pub fn push_pending(&mut self, tx: usize) {
        insert_in_list(&mut self.pending, tx);
    }

    /// Makes every index of `set` pending again, un-completing it if needed.
    pub fn push_pending_set(&mut self, set: &[usize]) {
        for &tx in set {
            if self.is_complete(tx) {
                self.clear_complete(tx);
            }
            self.push_pending(tx);
        }
    }

    /// Moves `tx` from in-progress to complete.
    pub fn mark_complete(&mut self, tx: usize) {
        let removed = remove_from_list(&mut self.in_progress, tx);
        debug_assert!(removed, "task {tx} completed without being in progress");
        insert_in_list(&mut self.complete, tx);
    }

    pub fn clear_in_progress(&mut self, tx: usize) {
        let removed = remove_from_list(&mut self.in_progress, tx);
        debug_assert!(removed, "task {tx} was not in progress");
    }

    pub fn clear_complete(&mut self, tx: usize) {
        remove_from_list(&mut self.complete, tx);
    }

    pub fn clear_pending(&mut self, tx: usize) {
        remove_from_list(&mut self.pending, tx);
    }

    pub fn min_pending(&self) -> Option<usize> {
        self.pending.first().copied()
    }

    pub fn count_complete(&self) -> usize {
        self.complete.len()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_progress_len(&self) -> usize {
        self.in_progress.len()
    }

    pub fn is_pending(&self, tx: usize) -> bool {
        contains(&self.pending, tx)
    }

    pub fn is_in_progress(&self, tx: usize) -> bool {
        contains(&self.in_progress, tx)
    }

    pub fn is_complete(&self, tx: usize) -> bool {
        contains(&self.complete, tx)
    }

    /// Largest `k` such that `0..=k` are all complete.
    ///
    /// `None` when index 0 is not complete.
    pub fn max_all_complete(&self) -> Option<usize> {
        let complete = &self.complete;
        if complete.first() != Some(&0) {
            return None;
        }
        // complete is sorted and deduplicated, so `complete[i] == i` holds
        // exactly on the gapless prefix.
        let (mut lo, mut hi) = (0, complete.len());
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if complete[mid] == mid {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Some(lo - 1)
    }

    /// Records that `dependent` must wait for `blocker` to commit.
    ///
    /// Returns true if `dependent` is now blocked. Nothing is recorded when
    /// `blocker >= dependent` or `blocker` has already completed.
    pub fn add_dependency(&mut self, blocker: usize, dependent: usize) -> bool {
        if blocker >= dependent {
            return false;
        }

        if self.is_complete(blocker) {
            // Blocker has already completed.
            let blocked = match self.blocker.get_mut(&dependent) {
                Some(blockers) => {
                    blockers.remove(&blocker);
                    !blockers.is_empty()
                }
                None => false,
            };
            return blocked;
        }

        self.dependency.entry(blocker).or_default().insert(dependent);
        self.blocker.entry(dependent).or_default().insert(blocker);
        true
    }

    pub fn is_blocked(&self, tx: usize) -> bool {
        self.blocker.get(&tx).is_some_and(|b| !b.is_empty())
    }

    /// Releases every task waiting on `tx`, which just committed.
    ///
    /// Returns the dependents that became pending: no blockers left and not
    /// already pending, in progress or complete.
    pub fn remove_dependency(&mut self, tx: usize) -> Vec<usize> {
        let mut released = Vec::new();
        let Some(dependents) = self.dependency.remove(&tx) else {
            return released;
        };

        for dependent in dependents {
            let unblocked = match self.blocker.get_mut(&dependent) {
                Some(blockers) => {
                    blockers.remove(&tx);
                    blockers.is_empty()
                }
                None => true,
            };
            if !unblocked {
                continue;
            }
            self.blocker.remove(&dependent);

            if !self.is_complete(dependent)
                && !self.is_pending(dependent)
                && !self.is_in_progress(dependent)
            {
                self.push_pending(dependent);
                released.push(dependent);
            }
        }

        released
    }

    /// Every index in `[tx_from, max_all_complete]` not currently in progress.
    ///
    /// After a conflict at `tx_from` these are the executed results that can
    /// no longer be trusted.
    pub fn revalidation_range(&self, tx_from: usize) -> Vec<usize> {
        match self.max_all_complete() {
            Some(max) => (tx_from..=max)
                .filter(|&tx| !self.is_in_progress(tx))
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_complete(indices: &[usize]) -> StatusManager {
        let mut m = StatusManager::new(10);
        for &tx in indices {
            m.start(tx);
            m.mark_complete(tx);
        }
        m
    }

    #[test]
    fn test_max_all_complete() {
        assert_eq!(with_complete(&[0, 1, 2, 5, 6]).max_all_complete(), Some(2));
        assert_eq!(with_complete(&[0, 1, 2, 3]).max_all_complete(), Some(3));
        assert_eq!(with_complete(&[1, 2]).max_all_complete(), None);
        assert_eq!(with_complete(&[]).max_all_complete(), None);
        assert_eq!(with_complete(&[0]).max_all_complete(), Some(0));
    }

    #[test]
    fn test_dependency_released_after_all_blockers() {
        let mut m = StatusManager::new(10);
        m.clear_pending(5);

        assert!(m.add_dependency(2, 5));
        assert!(m.add_dependency(3, 5));
        assert!(m.is_blocked(5));

        assert!(m.remove_dependency(2).is_empty());
        assert!(m.is_blocked(5));
        assert!(!m.is_pending(5));

        assert_eq!(m.remove_dependency(3), vec![5]);
        assert!(!m.is_blocked(5));
        assert!(m.is_pending(5));
    }

    #[test]
    fn test_add_dependency_noops() {
        let mut m = with_complete(&[0, 1]);

        // Only lower tasks can block.
        assert!(!m.add_dependency(4, 4));
        assert!(!m.add_dependency(6, 4));
        // A completed blocker resolves immediately.
        assert!(!m.add_dependency(1, 4));
        assert!(!m.is_blocked(4));
        assert!(m.remove_dependency(1).is_empty());
    }

    #[test]
    fn test_release_skips_tasks_already_scheduled() {
        let mut m = StatusManager::new(10);
        // Task 7 is still pending, e.g. it was requeued without waiting.
        assert!(m.add_dependency(3, 7));
        assert!(m.remove_dependency(3).is_empty());
        assert!(m.is_pending(7));
    }

    #[test]
    fn test_take_next_pending() {
        let mut m = StatusManager::new(3);
        assert_eq!(m.min_pending(), Some(0));
        assert_eq!(m.take_next_pending(), Some(0));
        assert!(m.is_in_progress(0));
        assert_eq!(m.take_next_pending(), Some(1));
        assert_eq!(m.take_next_pending(), Some(2));
        assert_eq!(m.take_next_pending(), None);
        assert_eq!(m.in_progress_len(), 3);
    }

    #[test]
    fn test_revalidation_range_skips_in_progress() {
        let mut m = with_complete(&[0, 1, 2, 3, 4, 6]);
        // 5 is executing, so the contiguous prefix stops at 4.
        m.start(5);
        assert_eq!(m.revalidation_range(2), vec![2, 3, 4]);
        assert_eq!(m.revalidation_range(5), Vec::<usize>::new());

        m.push_pending_set(&[2, 3, 4]);
        assert_eq!(m.max_all_complete(), Some(1));
        assert!(m.is_pending(3));
        assert_eq!(m.count_complete(), 3);
    }

    #[test]
    fn test_sorted_insert_and_remove() {
        let mut list = vec![1, 4, 9];
        insert_in_list(&mut list, 5);
        insert_in_list(&mut list, 0);
        insert_in_list(&mut list, 4);
        insert_in_list(&mut list, 10);
        assert_eq!(list, vec![0, 1, 4, 5, 9, 10]);

        assert!(remove_from_list(&mut list, 5));
        assert!(!remove_from_list(&mut list, 6));
        assert_eq!(list, vec![0, 1, 4, 9, 10]);
    }
}
