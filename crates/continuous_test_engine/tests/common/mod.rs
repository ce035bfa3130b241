//! Scripted discovery and execution for integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use continuous_test_engine::{
    CancellationToken, Discovery, DescriptorKind, DiscoveryProvider, ExecutionEvents, ExecutionProbe, ProbeError,
    ResultAggregate, TestDescriptor, TestId, TestListener, TestOutcome, TestPlan, TestResult, TestSession,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const ENGINE: &str = "junit";

#[derive(Debug, Clone, Default)]
pub struct FakeTest {
    pub touched: Vec<String>,
    pub fails: bool,
    pub tags: Vec<String>,
    /// Dynamic children as (name, fails).
    pub dynamic: Vec<(String, bool)>,
}

impl FakeTest {
    pub fn touching(classes: &[&str]) -> Self {
        Self { touched: classes.iter().map(|c| (*c).to_string()).collect(), ..Self::default() }
    }

    pub fn failing(mut self) -> Self {
        self.fails = true;
        self
    }

    pub fn tagged(mut self, tag: &str) -> Self {
        self.tags.push(tag.to_string());
        self
    }

    pub fn with_dynamic(mut self, name: &str, fails: bool) -> Self {
        self.dynamic.push((name.to_string(), fails));
        self
    }
}

pub fn class_id(class: &str) -> TestId {
    TestId::root("engine", ENGINE).child("class", class)
}

pub fn method_id(class: &str, method: &str) -> TestId {
    class_id(class).child("method", method)
}

pub fn dynamic_id(class: &str, method: &str, name: &str) -> TestId {
    method_id(class, method).child("dynamic-test", name)
}

#[derive(Default)]
struct GateState {
    closed: bool,
    waiting: bool,
}

/// A scripted project: discovery reads it, the probe runs it.
#[derive(Default)]
pub struct FakeProject {
    classes: Mutex<BTreeMap<String, BTreeMap<String, FakeTest>>>,
    executed: Mutex<Vec<Vec<String>>>,
    gate: Mutex<GateState>,
    gate_changed: Condvar,
    active: AtomicUsize,
    max_active: AtomicUsize,
    cancelled_at_gate: AtomicBool,
}

impl FakeProject {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_test(&self, class: &str, method: &str, test: FakeTest) {
        self.classes
            .lock()
            .unwrap()
            .entry(class.to_string())
            .or_default()
            .insert(method.to_string(), test);
    }

    pub fn remove_class(&self, class: &str) {
        self.classes.lock().unwrap().remove(class);
    }

    /// Test names executed by each batch, `Class.method` form.
    pub fn executed(&self) -> Vec<Vec<String>> {
        self.executed.lock().unwrap().clone()
    }

    pub fn last_executed(&self) -> Vec<String> {
        self.executed().last().cloned().unwrap_or_default()
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Hold every batch at its first test until [`FakeProject::open_gate`].
    pub fn close_gate(&self) {
        self.gate.lock().unwrap().closed = true;
    }

    pub fn open_gate(&self) {
        self.gate.lock().unwrap().closed = false;
        self.gate_changed.notify_all();
    }

    pub fn is_waiting_at_gate(&self) -> bool {
        self.gate.lock().unwrap().waiting
    }

    pub fn cancelled_at_gate(&self) -> bool {
        self.cancelled_at_gate.load(Ordering::SeqCst)
    }

    fn wait_at_gate(&self, cancel: &CancellationToken) {
        let mut gate = self.gate.lock().unwrap();
        gate.waiting = gate.closed;
        while gate.closed && !cancel.is_cancelled() {
            gate = self.gate_changed.wait_timeout(gate, Duration::from_millis(5)).unwrap().0;
        }
        gate.waiting = false;
    }

    fn test(&self, class: &str, method: &str) -> Option<FakeTest> {
        self.classes.lock().unwrap().get(class)?.get(method).cloned()
    }
}

impl DiscoveryProvider for FakeProject {
    fn discover(&self) -> Result<Discovery, ProbeError> {
        let classes = self.classes.lock().unwrap();
        let mut descriptors = vec![TestDescriptor::new(TestId::root("engine", ENGINE), DescriptorKind::Container)];
        for (class, tests) in classes.iter() {
            descriptors.push(TestDescriptor::new(class_id(class), DescriptorKind::Container).with_class(class.clone()));
            for (method, test) in tests {
                descriptors.push(
                    TestDescriptor::new(method_id(class, method), DescriptorKind::Test)
                        .with_class(class.clone())
                        .with_tags(test.tags.clone()),
                );
            }
        }
        Ok(Discovery::new(descriptors))
    }
}

impl FakeProject {
    fn walk(
        &self,
        plan: &TestPlan,
        descriptor: &TestDescriptor,
        events: &mut dyn ExecutionEvents,
        cancel: &CancellationToken,
        executed: &mut Vec<String>,
    ) {
        if cancel.is_cancelled() {
            return;
        }
        events.execution_started(&descriptor.id);
        let mut outcome = TestOutcome::Passed;

        if descriptor.kind == DescriptorKind::Test {
            self.wait_at_gate(cancel);
            if cancel.is_cancelled() {
                self.cancelled_at_gate.store(true, Ordering::SeqCst);
                return;
            }
            let class = descriptor.declaring_class.clone().unwrap_or_default();
            let method = descriptor.display_name.clone();
            let test = self.test(&class, &method).unwrap_or_default();
            events.classes_touched(&test.touched);
            events.output(&format!("running {class}.{method}"));
            executed.push(format!("{class}.{method}"));

            for (name, fails) in &test.dynamic {
                let id = descriptor.id.child("dynamic-test", name.clone());
                events.dynamic_test_registered(
                    TestDescriptor::new(id.clone(), DescriptorKind::Test).with_class(class.clone()),
                );
                events.execution_started(&id);
                let dyn_outcome = if *fails {
                    TestOutcome::Failed(format!("{name} failed"))
                } else {
                    TestOutcome::Passed
                };
                events.execution_finished(&id, dyn_outcome);
            }
            if test.fails {
                outcome = TestOutcome::Failed(format!("expected true\n  at {class}.{method}"));
            }
        }

        for child in plan.children(&descriptor.id) {
            self.walk(plan, child, events, cancel, executed);
        }
        events.execution_finished(&descriptor.id, outcome);
    }
}

impl ExecutionProbe for FakeProject {
    fn execute(
        &self,
        plan: &TestPlan,
        events: &mut dyn ExecutionEvents,
        cancel: &CancellationToken,
    ) -> Result<(), ProbeError> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        let mut executed = Vec::new();
        for root in plan.roots() {
            self.walk(plan, root, events, cancel, &mut executed);
        }
        self.executed.lock().unwrap().push(executed);

        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records listener events as strings.
#[derive(Default)]
pub struct EventLog {
    events: Mutex<Vec<String>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.events().iter().filter(|e| e.starts_with(prefix)).count()
    }

    fn push(&self, event: String) {
        self.events.lock().unwrap().push(event);
    }
}

impl TestListener for EventLog {
    fn run_started(&self, total: usize) {
        self.push(format!("run_started {total}"));
    }
    fn test_started(&self, id: &TestId, class_name: &str) {
        self.push(format!("test_started {id} {class_name}"));
    }
    fn test_complete(&self, result: &TestResult) {
        self.push(format!("test_complete {} {:?}", result.id, result.status));
    }
    fn dynamic_test_registered(&self, id: &TestId) {
        self.push(format!("dynamic {id}"));
    }
    fn run_complete(&self, aggregate: &ResultAggregate) {
        self.push(format!("run_complete {}", aggregate.run_id));
    }
    fn run_aborted(&self) {
        self.push("run_aborted".to_string());
    }
    fn no_tests(&self, aggregate: &ResultAggregate) {
        self.push(format!("no_tests {}", aggregate.run_id));
    }
    fn tests_enabled(&self) {
        self.push("tests_enabled".to_string());
    }
    fn tests_disabled(&self) {
        self.push("tests_disabled".to_string());
    }
    fn build_failed(&self, message: &str) {
        self.push(format!("build_failed {message}"));
    }
    fn build_succeeded(&self) {
        self.push("build_succeeded".to_string());
    }
    fn broken_only_changed(&self, broken_only: bool) {
        self.push(format!("broken_only {broken_only}"));
    }
}

pub fn session(project: &Arc<FakeProject>) -> TestSession {
    TestSession::new(project.clone(), project.clone(), Default::default()).unwrap()
}

pub fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

/// Wait until run `run_id` has finished and the coordinator is idle.
pub fn wait_for_run(session: &TestSession, run_id: u64) {
    wait_until(&format!("run {run_id}"), || {
        session.run_status().last_run >= Some(run_id) && !session.is_currently_running()
    });
}
