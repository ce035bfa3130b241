//! In-memory result storage for the lifetime of a test session.
//!
//! Keeps the latest result per test grouped by declaring class, the set of
//! currently failing tests, and the dynamic tests registered at run time.
//! Missing data is never an error: the first run, deleted tests and unknown
//! classes are all ordinary states.

use crate::model::{TestId, TestResult, TestStatus};
use std::collections::{HashMap, HashSet};

/// Results of one batch or of the whole store, keyed by declaring class.
pub type ResultsByClass = HashMap<String, HashMap<TestId, TestResult>>;

/// Latest result per test plus the failing and dynamic sets.
#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    results: ResultsByClass,
    failing: HashSet<TestId>,
    dynamic: HashSet<TestId>,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace stored results with a batch and update the failing set.
    pub fn merge(&mut self, batch: ResultsByClass) {
        for (class, results) in batch {
            let bucket = self.results.entry(class).or_default();
            for (id, result) in results {
                if result.status == TestStatus::Failed {
                    self.failing.insert(id.clone());
                } else {
                    self.failing.remove(&id);
                }
                bucket.insert(id, result);
            }
        }
    }

    /// Drop results for tests that no longer exist.
    ///
    /// A stored dynamic id survives if it was registered again this batch,
    /// or if its nearest statically discovered ancestor still exists and did
    /// not regenerate any dynamic children this batch.
    pub fn prune_deleted_tests(
        &mut self,
        all_discovered: &HashSet<TestId>,
        dynamic_this_batch: &HashSet<TestId>,
    ) {
        self.prune_after_batch(all_discovered, dynamic_this_batch, &HashSet::new());
    }

    /// [`ResultStore::prune_deleted_tests`] with the static ids that ran this
    /// batch. A stored dynamic id whose ancestor ran again without
    /// registering it is dropped as well.
    pub fn prune_after_batch(
        &mut self,
        all_discovered: &HashSet<TestId>,
        dynamic_this_batch: &HashSet<TestId>,
        ran_this_batch: &HashSet<TestId>,
    ) {
        let rerun_parents: HashSet<TestId> = dynamic_this_batch
            .iter()
            .filter_map(|id| static_ancestor(id, all_discovered))
            .chain(ran_this_batch.iter().cloned())
            .collect();

        self.dynamic.retain(|id| {
            if dynamic_this_batch.contains(id) {
                return true;
            }
            match static_ancestor(id, all_discovered) {
                Some(parent) => !rerun_parents.contains(&parent),
                None => false,
            }
        });
        self.dynamic.extend(dynamic_this_batch.iter().cloned());

        let dynamic = &self.dynamic;
        let known = |id: &TestId| all_discovered.contains(id) || dynamic.contains(id);

        self.failing.retain(|id| known(id));
        self.results.retain(|_, bucket| {
            bucket.retain(|id, _| known(id));
            !bucket.is_empty()
        });
    }

    /// Drop every bucket whose declaring class was deleted.
    pub fn classes_removed<'a, I>(&mut self, deleted: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        for class in deleted {
            if let Some(bucket) = self.results.remove(class) {
                for id in bucket.keys() {
                    self.failing.remove(id);
                }
            }
        }
    }

    pub fn is_failing(&self, id: &TestId) -> bool {
        self.failing.contains(id)
    }

    /// Snapshot of the currently failing ids.
    pub fn failing(&self) -> HashSet<TestId> {
        self.failing.clone()
    }

    /// Snapshot of the tracked dynamic ids.
    pub fn dynamic_ids(&self) -> HashSet<TestId> {
        self.dynamic.clone()
    }

    /// Snapshot of every stored result.
    pub fn snapshot(&self) -> ResultsByClass {
        self.results.clone()
    }

    /// Latest result for a test, if any.
    pub fn result(&self, class: &str, id: &TestId) -> Option<TestResult> {
        self.results.get(class)?.get(id).cloned()
    }

    /// Results of one class.
    pub fn class_results(&self, class: &str) -> Vec<TestResult> {
        self.results
            .get(class)
            .map(|bucket| bucket.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn class_count(&self) -> usize {
        self.results.len()
    }

    pub fn result_count(&self) -> usize {
        self.results.values().map(HashMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }
}

/// Nearest ancestor of a dynamic id that was discovered statically.
fn static_ancestor(id: &TestId, all_discovered: &HashSet<TestId>) -> Option<TestId> {
    let mut current = id.parent();
    while let Some(candidate) = current {
        if all_discovered.contains(&candidate) {
            return Some(candidate);
        }
        current = candidate.parent();
    }
    None
}
