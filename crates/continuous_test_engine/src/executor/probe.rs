//! Seams to the test framework: discovery, execution and its event stream.

use crate::model::{DescriptorKind, TestDescriptor, TestId};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Errors reported by a discovery provider or execution probe.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("discovery failed: {0}")]
    Discovery(String),
    #[error("test engine failed: {0}")]
    Engine(String),
}

/// Cooperative cancellation shared between the coordinator and a batch.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Every candidate descriptor found by discovery, parents before children.
#[derive(Debug, Clone, Default)]
pub struct Discovery {
    pub descriptors: Vec<TestDescriptor>,
}

impl Discovery {
    pub fn new(descriptors: Vec<TestDescriptor>) -> Self {
        Self { descriptors }
    }

    pub fn ids(&self) -> HashSet<TestId> {
        self.descriptors.iter().map(|d| d.id.clone()).collect()
    }
}

/// Finds candidate test units.
pub trait DiscoveryProvider: Send + Sync {
    fn discover(&self) -> Result<Discovery, ProbeError>;
}

/// The filtered descriptors of one batch.
#[derive(Debug, Clone, Default)]
pub struct TestPlan {
    descriptors: Vec<TestDescriptor>,
    by_id: HashMap<TestId, usize>,
}

impl TestPlan {
    pub fn new(descriptors: Vec<TestDescriptor>) -> Self {
        let by_id = descriptors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.id.clone(), i))
            .collect();
        Self { descriptors, by_id }
    }

    /// Descriptors in discovery order.
    pub fn descriptors(&self) -> &[TestDescriptor] {
        &self.descriptors
    }

    pub fn get(&self, id: &TestId) -> Option<&TestDescriptor> {
        self.by_id.get(id).map(|&i| &self.descriptors[i])
    }

    pub fn contains(&self, id: &TestId) -> bool {
        self.by_id.contains_key(id)
    }

    /// Descriptors whose parent is not part of the plan.
    pub fn roots(&self) -> impl Iterator<Item = &TestDescriptor> {
        self.descriptors
            .iter()
            .filter(|d| !matches!(d.id.parent(), Some(p) if self.contains(&p)))
    }

    /// Direct children of a descriptor, in discovery order.
    pub fn children<'a>(&'a self, id: &'a TestId) -> impl Iterator<Item = &'a TestDescriptor> + 'a {
        self.descriptors
            .iter()
            .filter(move |d| d.id.parent().as_ref() == Some(id))
    }

    /// Number of selectable units that will run.
    pub fn test_count(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|d| d.kind.is_selectable())
            .count()
    }

    /// True if nothing selectable is planned.
    pub fn is_empty(&self) -> bool {
        self.test_count() == 0
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }
}

/// Outcome reported when a descriptor finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    /// Failure detail, first line is the summary.
    Failed(String),
    Aborted(Option<String>),
}

/// Events a probe reports while executing a plan.
///
/// Start and finish events nest like the descriptor tree.
pub trait ExecutionEvents {
    fn execution_started(&mut self, id: &TestId);
    fn execution_skipped(&mut self, id: &TestId, reason: &str);
    /// A test created at run time, such as one produced by a test factory.
    fn dynamic_test_registered(&mut self, descriptor: TestDescriptor);
    fn execution_finished(&mut self, id: &TestId, outcome: TestOutcome);
    /// Classes loaded or used by the currently executing descriptor.
    fn classes_touched(&mut self, classes: &[String]);
    /// The host framework finished starting inside the current descriptor.
    fn framework_ready(&mut self);
    /// One line of captured output.
    fn output(&mut self, line: &str);
}

/// Runs a plan against the test framework.
pub trait ExecutionProbe: Send + Sync {
    fn execute(
        &self,
        plan: &TestPlan,
        events: &mut dyn ExecutionEvents,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeError>;
}

/// True for a kind whose completion records a class-level usage.
pub(crate) fn records_class_usage(kind: DescriptorKind) -> bool {
    matches!(kind, DescriptorKind::ClassUnit | DescriptorKind::Container)
}
