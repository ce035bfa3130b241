//! A continuous testing session.
//!
//! [`TestSession`] owns the usage index, the result store, the coordinator,
//! the listeners and the configuration. Nothing here is global; hosts create
//! a session and inject the discovery and execution seams.

use crate::aggregate::{ClassResult, ResultAggregate};
use crate::config::{ConfigError, FilterSettings, TestConfig};
use crate::coordinator::{BatchRunner, RunCoordinator, RunStatus};
use crate::executor::probe::{CancellationToken, DiscoveryProvider, ExecutionProbe};
use crate::executor::{BatchOutcome, ExecutionError, ExtraFilter, RunExecutor};
use crate::listener::{ListenerSet, TestListener};
use crate::model::{ChangeSet, RunRequest, TestResult};
use crate::selection::UsageIndex;
use crate::store::{ResultStore, ResultsByClass};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Errors that can occur while creating a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to start test runner thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Usage records and results, guarded together.
#[derive(Default)]
pub struct SessionState {
    pub usage: UsageIndex,
    pub store: ResultStore,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Settings {
    config: TestConfig,
    compiled: Arc<FilterSettings>,
}

struct SessionInner {
    state: Mutex<SessionState>,
    discovery: Arc<dyn DiscoveryProvider>,
    probe: Arc<dyn ExecutionProbe>,
    settings: Mutex<Settings>,
    extra_filters: Mutex<Vec<ExtraFilter>>,
    listeners: ListenerSet,
    last_aggregate: Mutex<Option<ResultAggregate>>,
    broken_only: AtomicBool,
}

impl BatchRunner for SessionInner {
    fn run_batch(
        &self,
        run_id: u64,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, ExecutionError> {
        // Settings and filters are read once per batch.
        let settings = Arc::clone(&lock(&self.settings).compiled);
        let extra_filters = lock(&self.extra_filters).clone();

        let outcome = RunExecutor::new(
            run_id,
            request,
            self.discovery.as_ref(),
            self.probe.as_ref(),
            &self.state,
            &settings,
            &extra_filters,
            &self.listeners,
        )
        .run(cancel)?;

        if !outcome.is_aborted() {
            *lock(&self.last_aggregate) = Some(outcome.aggregate().clone());
        }
        Ok(outcome)
    }
}

/// The continuous testing engine of one host process.
pub struct TestSession {
    inner: Arc<SessionInner>,
    coordinator: RunCoordinator,
}

impl TestSession {
    /// Create a disabled session. Call [`TestSession::enable`] to start testing.
    pub fn new(
        discovery: Arc<dyn DiscoveryProvider>,
        probe: Arc<dyn ExecutionProbe>,
        config: TestConfig,
    ) -> Result<Self, SessionError> {
        let compiled = Arc::new(config.compile()?);
        let listeners = ListenerSet::new();
        let inner = Arc::new(SessionInner {
            state: Mutex::new(SessionState::default()),
            discovery,
            probe,
            settings: Mutex::new(Settings { config, compiled }),
            extra_filters: Mutex::new(Vec::new()),
            listeners: listeners.clone(),
            last_aggregate: Mutex::new(None),
            broken_only: AtomicBool::new(false),
        });
        let runner: Arc<dyn BatchRunner> = inner.clone();
        let coordinator = RunCoordinator::new(runner, listeners)?;
        Ok(Self { inner, coordinator })
    }

    pub fn add_listener(&self, listener: Arc<dyn TestListener>) {
        self.inner.listeners.add(listener);
    }

    /// Add a filter applied after the configured ones, from the next batch on.
    pub fn add_filter(&self, filter: ExtraFilter) {
        lock(&self.inner.extra_filters).push(filter);
    }

    /// Replace the configuration. Takes effect at the next batch.
    pub fn set_config(&self, config: TestConfig) -> Result<(), ConfigError> {
        let compiled = Arc::new(config.compile()?);
        *lock(&self.inner.settings) = Settings { config, compiled };
        Ok(())
    }

    pub fn config(&self) -> TestConfig {
        lock(&self.inner.settings).config.clone()
    }

    /// Start testing. The first enable queues a full run unless a build
    /// failure is active, in which case call [`TestSession::run_all_tests`]
    /// after [`TestSession::build_succeeded`].
    pub fn enable(&self) {
        self.coordinator.enable();
    }

    pub fn disable(&self) {
        self.coordinator.disable();
    }

    pub fn pause(&self) {
        self.coordinator.pause();
    }

    pub fn resume(&self) {
        self.coordinator.resume();
    }

    pub fn abort(&self) {
        self.coordinator.abort();
    }

    pub fn is_enabled(&self) -> bool {
        self.coordinator.is_enabled()
    }

    /// Run the tests affected by a change set, or everything for `None`.
    pub fn run_tests(&self, changes: Option<ChangeSet>) -> bool {
        self.coordinator.request(RunRequest { changes, rerun_failing_only: false })
    }

    pub fn run_all_tests(&self) -> bool {
        self.run_tests(None)
    }

    /// Re-run the currently failing tests.
    ///
    /// Does nothing before the first batch has finished or when nothing fails.
    pub fn run_failed_tests(&self) -> bool {
        if lock(&self.inner.last_aggregate).is_none() {
            tracing::info!("not re-running failed tests, no test run has completed yet");
            return false;
        }
        if lock(&self.inner.state).store.failing().is_empty() {
            tracing::info!("not re-running failed tests, as all tests passed");
            return false;
        }
        self.coordinator.request(RunRequest::failing_only())
    }

    pub fn build_failed(&self, message: &str) {
        self.coordinator.build_failed(message);
    }

    pub fn build_succeeded(&self) {
        self.coordinator.build_succeeded();
    }

    /// Flip broken-only display mode and notify listeners.
    pub fn toggle_broken_only(&self) -> bool {
        let enabled = !self.inner.broken_only.fetch_xor(true, Ordering::SeqCst);
        tracing::info!(enabled, "broken only mode toggled");
        self.inner
            .listeners
            .dispatch("broken_only_changed", |l| l.broken_only_changed(enabled));
        enabled
    }

    pub fn is_broken_only(&self) -> bool {
        self.inner.broken_only.load(Ordering::SeqCst)
    }

    /// Flip echoing of captured test output. Takes effect at the next batch.
    pub fn toggle_test_output(&self) -> bool {
        let enabled = {
            let mut settings = lock(&self.inner.settings);
            let enabled = !settings.config.display_test_output;
            settings.config.display_test_output = enabled;
            let mut compiled = settings.compiled.as_ref().clone();
            compiled.display_test_output = enabled;
            settings.compiled = Arc::new(compiled);
            enabled
        };
        tracing::info!(enabled, "test output toggled");
        self.inner
            .listeners
            .dispatch("test_output_changed", |l| l.test_output_changed(enabled));
        enabled
    }

    pub fn is_display_test_output(&self) -> bool {
        lock(&self.inner.settings).config.display_test_output
    }

    /// Failing classes of the last finished batch, current first.
    pub fn current_failing_classes(&self) -> Vec<ClassResult> {
        lock(&self.inner.last_aggregate)
            .as_ref()
            .map(|a| a.failing_classes().cloned().collect())
            .unwrap_or_default()
    }

    /// Passing classes of the last finished batch, current first.
    pub fn current_passing_classes(&self) -> Vec<ClassResult> {
        lock(&self.inner.last_aggregate)
            .as_ref()
            .map(|a| a.passing_classes().cloned().collect())
            .unwrap_or_default()
    }

    pub fn is_currently_running(&self) -> bool {
        self.coordinator.is_running()
    }

    pub fn last_aggregate(&self) -> Option<ResultAggregate> {
        lock(&self.inner.last_aggregate).clone()
    }

    pub fn run_status(&self) -> RunStatus {
        self.coordinator.status()
    }

    /// Snapshot of every stored result.
    pub fn results(&self) -> ResultsByClass {
        lock(&self.inner.state).store.snapshot()
    }

    /// Every currently failing result, ordered by id.
    pub fn failing_tests(&self) -> Vec<TestResult> {
        let state = lock(&self.inner.state);
        let failing = state.store.failing();
        let mut out: Vec<TestResult> = state
            .store
            .snapshot()
            .into_values()
            .flat_map(|bucket| bucket.into_values())
            .filter(|r| failing.contains(&r.id))
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    /// Log every failing test with its failure summary.
    pub fn log_failures(&self) {
        let failing = self.failing_tests();
        if failing.is_empty() {
            tracing::info!("all tests passed, no failures to display");
        }
        for result in failing {
            tracing::error!(
                test = %result.display_name,
                class = %result.declaring_class,
                failure = result.failure_summary().as_deref().unwrap_or(""),
                "test failed"
            );
        }
    }

    /// Stop the worker thread. Also done on drop.
    pub fn shutdown(&self) {
        self.coordinator.shutdown();
    }
}
