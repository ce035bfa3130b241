//! Usage index and change-driven test selection.
//!
//! Records what each test touched and decides, per descriptor, whether a
//! change set requires it to run again.

use super::graph::{UsageGraph, UsageKey};
use crate::model::{DescriptorKind, TestDescriptor, TestId};
use crate::store::ResultStore;
use std::collections::HashSet;

/// Why a descriptor was or was not selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    PreviouslyFailing,
    /// Nothing recorded for this unit yet.
    NoUsageRecord,
    /// The test's own class changed.
    ClassChanged,
    /// A class the test touched last time changed.
    TouchedClassChanged,
    /// Nothing the test depends on changed.
    Unaffected,
}

impl Selection {
    pub fn is_included(self) -> bool {
        self != Selection::Unaffected
    }
}

/// Usage records for every test run in this session.
#[derive(Default)]
pub struct UsageIndex {
    graph: UsageGraph,
}

impl UsageIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the touched classes for a test, or for a whole class when
    /// `test` is `None`. Overwrites the previous record for that key.
    pub fn record_usage(&mut self, class: &str, test: Option<&TestId>, touched: &HashSet<String>) {
        let key = UsageKey { class: class.to_string(), test: test.cloned() };
        if !self.graph.record(key, touched) {
            tracing::debug!(class, "usage record dropped, graph is full");
        }
    }

    /// Forget every record declared by a deleted test class.
    pub fn remove_class(&mut self, class: &str) {
        self.graph.remove_declaring_class(class);
    }

    pub fn contains(&self, class: &str, test: Option<&TestId>) -> bool {
        self.graph.contains(&UsageKey { class: class.to_string(), test: test.cloned() })
    }

    pub fn touched_classes(&self, class: &str, test: Option<&TestId>) -> Option<HashSet<String>> {
        self.graph.touched(&UsageKey { class: class.to_string(), test: test.cloned() })
    }

    /// Number of stored usage records.
    pub fn len(&self) -> usize {
        self.graph.usage_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Build the selection filter for a set of changed classes.
    pub fn selection_filter<'a>(
        &'a self,
        changed_classes: HashSet<String>,
        store: &'a ResultStore,
    ) -> SelectionFilter<'a> {
        let affected = compute_affected(&changed_classes, &self.graph);
        tracing::debug!(
            changed = changed_classes.len(),
            affected = affected.len(),
            "computed affected usages"
        );
        SelectionFilter { index: self, store, changed_classes, affected }
    }
}

/// Compute every usage that touched at least one changed class.
///
/// Touched sets are already transitive (they include parent and startup
/// classes), so one reverse hop from each changed class is enough.
fn compute_affected(changed: &HashSet<String>, graph: &UsageGraph) -> HashSet<UsageKey> {
    changed.iter().flat_map(|class| graph.users_of(class)).collect()
}

/// Decision function produced by [`UsageIndex::selection_filter`].
pub struct SelectionFilter<'a> {
    index: &'a UsageIndex,
    store: &'a ResultStore,
    changed_classes: HashSet<String>,
    affected: HashSet<UsageKey>,
}

impl SelectionFilter<'_> {
    /// Decide whether a descriptor has to run.
    pub fn decide(&self, descriptor: &TestDescriptor) -> Selection {
        if self.store.is_failing(&descriptor.id) {
            return Selection::PreviouslyFailing;
        }

        let Some(class) = descriptor.declaring_class.as_deref() else {
            return Selection::NoUsageRecord;
        };

        let key = match descriptor.kind {
            DescriptorKind::Test => UsageKey::test(class, descriptor.id.clone()),
            DescriptorKind::ClassUnit | DescriptorKind::Container => UsageKey::class_level(class),
        };

        if !self.index.graph.contains(&key) {
            return Selection::NoUsageRecord;
        }
        if self.changed_classes.contains(class) {
            return Selection::ClassChanged;
        }
        if self.affected.contains(&key) {
            return Selection::TouchedClassChanged;
        }
        Selection::Unaffected
    }

    pub fn includes(&self, descriptor: &TestDescriptor) -> bool {
        self.decide(descriptor).is_included()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{TestResult, TestStatus};
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn set(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| (*s).to_string()).collect()
    }

    fn test_descriptor(class: &str, method: &str) -> TestDescriptor {
        let id = TestId::root("engine", "junit")
            .child("class", class)
            .child("method", method);
        TestDescriptor::new(id, DescriptorKind::Test).with_class(class)
    }

    fn failed(descriptor: &TestDescriptor) -> TestResult {
        TestResult {
            id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            declaring_class: descriptor.declaring_class.clone().unwrap(),
            tags: Vec::new(),
            status: TestStatus::Failed,
            captured_output: Vec::new(),
            is_leaf: true,
            run_id: 1,
            duration_ms: 0,
            failure: Some("boom".into()),
        }
    }

    #[test]
    fn unknown_test_is_selected() {
        let index = UsageIndex::new();
        let store = ResultStore::new();
        let filter = index.selection_filter(set(&["A"]), &store);
        assert_eq!(filter.decide(&test_descriptor("XTest", "x")), Selection::NoUsageRecord);
    }

    #[test]
    fn touched_change_selects_only_dependents() {
        let mut index = UsageIndex::new();
        let store = ResultStore::new();
        let x = test_descriptor("XTest", "x");
        let y = test_descriptor("YTest", "y");
        index.record_usage("XTest", Some(&x.id), &set(&["ClassA", "ClassB"]));
        index.record_usage("YTest", Some(&y.id), &set(&["ClassC"]));

        let filter = index.selection_filter(set(&["ClassA"]), &store);
        assert_eq!(filter.decide(&x), Selection::TouchedClassChanged);
        assert_eq!(filter.decide(&y), Selection::Unaffected);
    }

    #[test]
    fn own_class_change_selects_test() {
        let mut index = UsageIndex::new();
        let store = ResultStore::new();
        let x = test_descriptor("XTest", "x");
        index.record_usage("XTest", Some(&x.id), &set(&["ClassC"]));

        let filter = index.selection_filter(set(&["XTest"]), &store);
        assert_eq!(filter.decide(&x), Selection::ClassChanged);
    }

    #[test]
    fn rerecord_on_full_graph_makes_test_unknown() {
        use crate::selection::graph::MAX_GRAPH_NODES;

        let mut index = UsageIndex::new();
        let store = ResultStore::new();
        let x = test_descriptor("XTest", "x");
        index.record_usage("XTest", Some(&x.id), &set(&["ClassA"]));

        let wide: HashSet<String> = (0..MAX_GRAPH_NODES).map(|i| format!("C{i}")).collect();
        index.record_usage("XTest", Some(&x.id), &wide);

        assert!(index.touched_classes("XTest", Some(&x.id)).is_none());
        let filter = index.selection_filter(set(&["C7"]), &store);
        assert_eq!(filter.decide(&x), Selection::NoUsageRecord);
    }

    #[test]
    fn failing_test_is_selected_regardless_of_usage() {
        let mut index = UsageIndex::new();
        let mut store = ResultStore::new();
        let x = test_descriptor("XTest", "x");
        index.record_usage("XTest", Some(&x.id), &set(&["ClassC"]));
        store.merge(HashMap::from([(
            "XTest".to_string(),
            HashMap::from([(x.id.clone(), failed(&x))]),
        )]));

        let filter = index.selection_filter(set(&["Other"]), &store);
        assert_eq!(filter.decide(&x), Selection::PreviouslyFailing);
    }

    #[test]
    fn class_unit_uses_class_level_record() {
        let mut index = UsageIndex::new();
        let store = ResultStore::new();
        let unit = TestDescriptor::new(
            TestId::root("engine", "spock").child("class", "SpecA"),
            DescriptorKind::ClassUnit,
        )
        .with_class("SpecA");
        index.record_usage("SpecA", None, &set(&["Service"]));

        assert!(index.selection_filter(set(&["Service"]), &store).includes(&unit));
        assert!(!index.selection_filter(set(&["Unrelated"]), &store).includes(&unit));
    }

    #[test]
    fn record_usage_overwrites() {
        let mut index = UsageIndex::new();
        let x = test_descriptor("XTest", "x");
        index.record_usage("XTest", Some(&x.id), &set(&["A"]));
        index.record_usage("XTest", Some(&x.id), &set(&["B"]));
        assert_eq!(index.touched_classes("XTest", Some(&x.id)).unwrap(), set(&["B"]));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn remove_class_forgets_records() {
        let mut index = UsageIndex::new();
        let x = test_descriptor("XTest", "x");
        index.record_usage("XTest", Some(&x.id), &set(&["A"]));
        index.record_usage("XTest", None, &set(&["A"]));
        index.remove_class("XTest");
        assert!(index.is_empty());
        assert!(!index.contains("XTest", None));
    }

    proptest! {
        // A recorded, non-failing test whose class and touched classes are
        // disjoint from the change set is never selected.
        #[test]
        fn disjoint_recorded_tests_are_never_selected(
            touched in prop::collection::hash_set("[a-m]{1,4}", 0..8),
            changed in prop::collection::hash_set("[n-z]{1,4}", 0..8),
        ) {
            let mut index = UsageIndex::new();
            let store = ResultStore::new();
            let x = test_descriptor("Xtest", "x");
            index.record_usage("Xtest", Some(&x.id), &touched);

            let filter = index.selection_filter(changed, &store);
            prop_assert_eq!(filter.decide(&x), Selection::Unaffected);
        }

        #[test]
        fn intersecting_tests_are_always_selected(
            touched in prop::collection::hash_set("[a-z]{1,4}", 1..8),
            extra in prop::collection::hash_set("[A-Z]{1,4}", 0..4),
        ) {
            let mut index = UsageIndex::new();
            let store = ResultStore::new();
            let x = test_descriptor("0test", "x");
            index.record_usage("0test", Some(&x.id), &touched);

            let mut changed = extra;
            changed.insert(touched.iter().next().unwrap().clone());
            let filter = index.selection_filter(changed, &store);
            prop_assert!(filter.includes(&x));
        }
    }
}
