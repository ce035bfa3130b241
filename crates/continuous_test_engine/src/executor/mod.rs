//! Execution of one batch.
//!
//! Discovers candidates, applies the filter chain, runs the plan through the
//! probe while tracing touched classes, and folds the results into the
//! session state.

pub mod filter;
pub mod probe;
pub mod tracer;

use crate::aggregate::{now_millis, ResultAggregate};
use crate::config::FilterSettings;
use crate::listener::ListenerSet;
use crate::model::{DescriptorKind, RunRequest, TestDescriptor, TestId, TestResult, TestStatus};
use crate::session::SessionState;
use crate::store::{ResultStore, ResultsByClass};
use filter::{build_plan, DescriptorFilter, EngineFilter, FailingOnlyFilter, PatternFilter, TagFilter};
use probe::{
    records_class_usage, CancellationToken, DiscoveryProvider, ExecutionEvents, ExecutionProbe, ProbeError,
    TestOutcome, TestPlan,
};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tracer::Tracer;

/// Errors that end a batch without touching the result store.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("discovery failed: {0}")]
    Discovery(#[source] ProbeError),
    #[error("execution failed: {0}")]
    Execution(#[source] ProbeError),
}

/// How a batch ended.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Completed(ResultAggregate),
    /// Nothing selectable survived filtering.
    NoTests(ResultAggregate),
    /// Cancelled mid-run; built from a scratch copy, nothing merged.
    Aborted(ResultAggregate),
}

impl BatchOutcome {
    pub fn aggregate(&self) -> &ResultAggregate {
        match self {
            BatchOutcome::Completed(a) | BatchOutcome::NoTests(a) | BatchOutcome::Aborted(a) => a,
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self, BatchOutcome::Aborted(_))
    }
}

/// Filter supplied by the host in addition to the configured ones.
pub type ExtraFilter = Arc<dyn DescriptorFilter + Send + Sync>;

fn lock(state: &Mutex<SessionState>) -> MutexGuard<'_, SessionState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Runs one batch against shared session state.
pub struct RunExecutor<'a> {
    run_id: u64,
    request: RunRequest,
    discovery: &'a dyn DiscoveryProvider,
    probe: &'a dyn ExecutionProbe,
    state: &'a Mutex<SessionState>,
    settings: &'a FilterSettings,
    extra_filters: &'a [ExtraFilter],
    listeners: &'a ListenerSet,
}

impl<'a> RunExecutor<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        run_id: u64,
        request: RunRequest,
        discovery: &'a dyn DiscoveryProvider,
        probe: &'a dyn ExecutionProbe,
        state: &'a Mutex<SessionState>,
        settings: &'a FilterSettings,
        extra_filters: &'a [ExtraFilter],
        listeners: &'a ListenerSet,
    ) -> Self {
        Self { run_id, request, discovery, probe, state, settings, extra_filters, listeners }
    }

    /// Run the batch to completion or until `cancel` fires.
    pub fn run(self, cancel: &CancellationToken) -> Result<BatchOutcome, ExecutionError> {
        let started_at = now_millis();
        let run_id = self.run_id;

        let discovery = match self.discovery.discover() {
            Ok(d) => d,
            Err(e) => {
                tracing::error!(run_id, error = %e, "test discovery failed");
                self.listeners.dispatch("run_aborted", |l| l.run_aborted());
                return Err(ExecutionError::Discovery(e));
            }
        };
        let all_discovered = discovery.ids();

        let plan = {
            let state = lock(self.state);
            self.plan(&discovery, &state)
        };
        tracing::debug!(run_id, discovered = all_discovered.len(), planned = plan.len(), "built test plan");

        if plan.is_empty() {
            let aggregate = {
                let mut state = lock(self.state);
                state.store.prune_deleted_tests(&all_discovered, &HashSet::new());
                self.forget_deleted_classes(&mut state);
                self.aggregate(started_at, state.store.snapshot())
            };
            tracing::info!(run_id, "no tests to run");
            self.listeners.dispatch("no_tests", |l| l.no_tests(&aggregate));
            return Ok(BatchOutcome::NoTests(aggregate));
        }

        let total = plan.test_count();
        tracing::info!(run_id, total, full = self.request.changes.is_none(), "starting test run");
        self.listeners.dispatch("run_started", |l| l.run_started(total));

        let mut recorder = BatchRecorder::new(
            run_id,
            &plan,
            self.state,
            self.listeners,
            cancel,
            self.settings.display_test_output,
        );
        if let Err(e) = self.probe.execute(&plan, &mut recorder, cancel) {
            tracing::error!(run_id, error = %e, "test engine failed");
            self.listeners.dispatch("run_aborted", |l| l.run_aborted());
            return Err(ExecutionError::Execution(e));
        }
        let BatchRecorder { results, dynamic_ids, ran, .. } = recorder;

        if cancel.is_cancelled() {
            let aggregate = {
                let state = lock(self.state);
                let mut scratch: ResultStore = state.store.clone();
                drop(state);
                scratch.merge(results);
                self.aggregate(started_at, scratch.snapshot())
            };
            tracing::info!(run_id, "test run aborted");
            self.listeners.dispatch("run_aborted", |l| l.run_aborted());
            return Ok(BatchOutcome::Aborted(aggregate));
        }

        let aggregate = {
            let mut state = lock(self.state);
            state.store.merge(results);
            state.store.prune_after_batch(&all_discovered, &dynamic_ids, &ran);
            self.forget_deleted_classes(&mut state);
            self.aggregate(started_at, state.store.snapshot())
        };

        tracing::info!(
            run_id,
            passed = aggregate.current_passed_count(),
            failed = aggregate.current_failed_count(),
            skipped = aggregate.current_skipped_count(),
            "test run complete"
        );
        self.listeners.dispatch("run_complete", |l| l.run_complete(&aggregate));
        Ok(BatchOutcome::Completed(aggregate))
    }

    /// Filter chain: usage selection, tags, pattern, engines, extras, failing-only.
    fn plan(&self, discovery: &probe::Discovery, state: &SessionState) -> TestPlan {
        let selection = self.request.changes.as_ref().map(|changes| {
            state
                .usage
                .selection_filter(changes.changed_class_names(), &state.store)
        });
        let tags = TagFilter::from_settings(self.settings);
        let pattern = PatternFilter::from_settings(self.settings);
        let engines = EngineFilter::from_settings(self.settings);
        let failing = self
            .request
            .rerun_failing_only
            .then(|| FailingOnlyFilter::new(state.store.failing()));

        let mut filters: Vec<&dyn DescriptorFilter> = Vec::new();
        if let Some(f) = &selection {
            filters.push(f);
        }
        if let Some(f) = &tags {
            filters.push(f);
        }
        if let Some(f) = &pattern {
            filters.push(f);
        }
        if let Some(f) = &engines {
            filters.push(f);
        }
        for f in self.extra_filters {
            filters.push(f.as_ref());
        }
        if let Some(f) = &failing {
            filters.push(f);
        }

        build_plan(discovery, &filters)
    }

    fn forget_deleted_classes(&self, state: &mut SessionState) {
        let Some(changes) = &self.request.changes else {
            return;
        };
        state.store.classes_removed(&changes.deleted);
        for class in &changes.deleted {
            state.usage.remove_class(class);
        }
    }

    fn aggregate(&self, started_at: u64, snapshot: ResultsByClass) -> ResultAggregate {
        ResultAggregate::from_snapshot(
            self.run_id,
            self.request.changes.clone(),
            started_at,
            now_millis(),
            snapshot,
        )
    }
}

/// Collects the events of one batch.
struct BatchRecorder<'a> {
    run_id: u64,
    plan: &'a TestPlan,
    state: &'a Mutex<SessionState>,
    listeners: &'a ListenerSet,
    cancel: &'a CancellationToken,
    display_output: bool,
    tracer: Tracer,
    results: ResultsByClass,
    dynamic: HashMap<TestId, TestDescriptor>,
    dynamic_ids: HashSet<TestId>,
    /// Planned descriptors that ran to a pass or failure.
    ran: HashSet<TestId>,
    /// Static ancestors marked failed by a dynamic child.
    failed_by_dynamic: HashSet<TestId>,
    output: Vec<String>,
}

impl<'a> BatchRecorder<'a> {
    fn new(
        run_id: u64,
        plan: &'a TestPlan,
        state: &'a Mutex<SessionState>,
        listeners: &'a ListenerSet,
        cancel: &'a CancellationToken,
        display_output: bool,
    ) -> Self {
        Self {
            run_id,
            plan,
            state,
            listeners,
            cancel,
            display_output,
            tracer: Tracer::new(),
            results: ResultsByClass::new(),
            dynamic: HashMap::new(),
            dynamic_ids: HashSet::new(),
            ran: HashSet::new(),
            failed_by_dynamic: HashSet::new(),
            output: Vec::new(),
        }
    }

    fn descriptor(&self, id: &TestId) -> Option<&TestDescriptor> {
        self.plan.get(id).or_else(|| self.dynamic.get(id))
    }

    fn result_for(
        &mut self,
        descriptor: &TestDescriptor,
        status: TestStatus,
        duration_ms: u64,
        failure: Option<String>,
    ) -> Option<TestResult> {
        let class = descriptor.declaring_class.clone()?;
        Some(TestResult {
            id: descriptor.id.clone(),
            display_name: descriptor.display_name.clone(),
            declaring_class: class,
            tags: descriptor.tags.clone(),
            status,
            captured_output: std::mem::take(&mut self.output),
            is_leaf: descriptor.kind != DescriptorKind::Container,
            run_id: self.run_id,
            duration_ms,
            failure,
        })
    }

    fn store_result(&mut self, result: TestResult) {
        if result.is_leaf {
            self.listeners.dispatch("test_complete", |l| l.test_complete(&result));
        }
        self.results
            .entry(result.declaring_class.clone())
            .or_default()
            .insert(result.id.clone(), result);
    }

    fn record_usage(&self, descriptor: &TestDescriptor, touched: &HashSet<String>) {
        let Some(class) = descriptor.declaring_class.as_deref() else {
            return;
        };
        let mut state = lock(self.state);
        if descriptor.kind == DescriptorKind::Test {
            state.usage.record_usage(class, Some(&descriptor.id), touched);
        } else if records_class_usage(descriptor.kind) {
            state.usage.record_usage(class, None, touched);
        }
    }

    /// Mark the nearest static ancestor of a failed dynamic test as failed.
    fn mark_static_ancestor(&mut self, dynamic: &TestDescriptor) {
        let mut current = dynamic.id.parent();
        let ancestor = loop {
            let Some(id) = current else {
                return;
            };
            if let Some(found) = self.plan.get(&id) {
                if found.declaring_class.is_some() {
                    break found.clone();
                }
            }
            current = id.parent();
        };

        self.failed_by_dynamic.insert(ancestor.id.clone());
        let Some(class) = ancestor.declaring_class.clone() else {
            return;
        };
        let detail = format!("dynamic test {} failed", dynamic.display_name);
        let bucket = self.results.entry(class.clone()).or_default();
        match bucket.get_mut(&ancestor.id) {
            Some(existing) => {
                existing.status = TestStatus::Failed;
                existing.failure.get_or_insert(detail);
            }
            None => {
                bucket.insert(
                    ancestor.id.clone(),
                    TestResult {
                        id: ancestor.id.clone(),
                        display_name: ancestor.display_name.clone(),
                        declaring_class: class,
                        tags: ancestor.tags.clone(),
                        status: TestStatus::Failed,
                        captured_output: Vec::new(),
                        is_leaf: ancestor.kind != DescriptorKind::Container,
                        run_id: self.run_id,
                        duration_ms: 0,
                        failure: Some(detail),
                    },
                );
            }
        }
    }
}

impl ExecutionEvents for BatchRecorder<'_> {
    fn execution_started(&mut self, id: &TestId) {
        if self.cancel.is_cancelled() {
            return;
        }
        let class = self
            .descriptor(id)
            .and_then(|d| d.declaring_class.clone())
            .unwrap_or_default();
        self.listeners.dispatch("test_started", |l| l.test_started(id, &class));
        self.tracer.push();
    }

    fn execution_skipped(&mut self, id: &TestId, reason: &str) {
        if self.cancel.is_cancelled() {
            return;
        }
        let Some(descriptor) = self.descriptor(id).cloned() else {
            tracing::debug!(%id, "skip reported for unknown descriptor");
            return;
        };
        let reason = (!reason.is_empty()).then(|| reason.to_string());
        if let Some(result) = self.result_for(&descriptor, TestStatus::Aborted, 0, reason) {
            self.store_result(result);
        }
    }

    fn dynamic_test_registered(&mut self, descriptor: TestDescriptor) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.listeners
            .dispatch("dynamic_test_registered", |l| l.dynamic_test_registered(&descriptor.id));
        self.dynamic_ids.insert(descriptor.id.clone());
        self.dynamic.insert(descriptor.id.clone(), descriptor);
    }

    fn execution_finished(&mut self, id: &TestId, outcome: TestOutcome) {
        if self.cancel.is_cancelled() {
            return;
        }
        let frame = self.tracer.pop();
        let Some(descriptor) = self.descriptor(id).cloned() else {
            tracing::debug!(%id, "finish reported for unknown descriptor");
            return;
        };

        let (mut status, mut failure) = match outcome {
            TestOutcome::Passed => (TestStatus::Passed, None),
            TestOutcome::Failed(detail) => (TestStatus::Failed, Some(detail)),
            TestOutcome::Aborted(reason) => (TestStatus::Aborted, reason),
        };

        if status != TestStatus::Aborted {
            self.record_usage(&descriptor, &frame.touched);
            if self.plan.contains(id) {
                self.ran.insert(id.clone());
            }
        }

        if status == TestStatus::Passed && self.failed_by_dynamic.contains(id) {
            status = TestStatus::Failed;
            failure = descriptor.declaring_class.as_ref().and_then(|class| {
                self.results
                    .get(class)
                    .and_then(|bucket| bucket.get(id))
                    .and_then(|r| r.failure.clone())
            });
        }

        if let Some(result) = self.result_for(&descriptor, status, frame.duration_ms, failure) {
            self.store_result(result);
        }

        if status == TestStatus::Failed && self.dynamic_ids.contains(id) {
            self.mark_static_ancestor(&descriptor);
        }
    }

    fn classes_touched(&mut self, classes: &[String]) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.tracer.touch(classes);
    }

    fn framework_ready(&mut self) {
        self.tracer.framework_ready();
    }

    fn output(&mut self, line: &str) {
        if self.display_output {
            tracing::info!(run_id = self.run_id, "{line}");
        }
        self.output.push(line.to_string());
    }
}
