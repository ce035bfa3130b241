//! Single-worker run coordination.
//!
//! One worker thread runs batches one at a time. Requests that arrive while
//! a batch is running are coalesced into a single queued slot. All state sits
//! behind one monitor; the worker only blocks before it starts a batch.

use crate::executor::probe::CancellationToken;
use crate::executor::{BatchOutcome, ExecutionError};
use crate::listener::ListenerSet;
use crate::model::RunRequest;
use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{JoinHandle, ThreadId};

/// Runs one batch on behalf of the coordinator.
pub trait BatchRunner: Send + Sync {
    fn run_batch(
        &self,
        run_id: u64,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<BatchOutcome, ExecutionError>;
}

/// Coordinator phase. `paused` is tracked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// A batch is running or about to start.
    Running,
    Disabled,
}

/// Run ids of the last finished batch and the one in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub last_run: Option<u64>,
    pub running: Option<u64>,
}

struct CoordinatorState {
    phase: Phase,
    paused: bool,
    queued: Option<RunRequest>,
    in_flight: Option<CancellationToken>,
    running: Option<u64>,
    last_run: Option<u64>,
    next_run_id: u64,
    build_blocked: bool,
    build_block_logged: bool,
    ever_enabled: bool,
    shutdown: bool,
}

impl Default for CoordinatorState {
    fn default() -> Self {
        Self {
            phase: Phase::Disabled,
            paused: false,
            queued: None,
            in_flight: None,
            running: None,
            last_run: None,
            next_run_id: 1,
            build_blocked: false,
            build_block_logged: false,
            ever_enabled: false,
            shutdown: false,
        }
    }
}

struct Shared {
    runner: Arc<dyn BatchRunner>,
    monitor: Mutex<CoordinatorState>,
    changed: Condvar,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.monitor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, CoordinatorState>) -> MutexGuard<'a, CoordinatorState> {
        self.changed.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue or coalesce a request. Returns false if it was dropped.
    fn request_locked(&self, state: &mut CoordinatorState, request: RunRequest) -> bool {
        if state.shutdown || state.phase == Phase::Disabled {
            tracing::debug!("tests disabled, ignoring run request");
            return false;
        }
        if state.build_blocked {
            if !state.build_block_logged {
                tracing::info!("build failed, test run requests are dropped until it succeeds");
                state.build_block_logged = true;
            }
            return false;
        }

        state.queued = Some(match state.queued.take() {
            Some(queued) => queued.coalesce(request),
            None => request,
        });
        if state.phase == Phase::Idle && !state.paused {
            state.phase = Phase::Running;
        }
        self.changed.notify_all();
        true
    }
}

/// State machine owning the worker thread.
pub struct RunCoordinator {
    shared: Arc<Shared>,
    listeners: ListenerSet,
    worker: Mutex<Option<JoinHandle<()>>>,
    worker_id: ThreadId,
}

impl RunCoordinator {
    /// Start the worker. The coordinator begins disabled.
    pub fn new(runner: Arc<dyn BatchRunner>, listeners: ListenerSet) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            runner,
            monitor: Mutex::new(CoordinatorState::default()),
            changed: Condvar::new(),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("test-runner".into())
            .spawn(move || worker_loop(&worker_shared))?;
        let worker_id = handle.thread().id();

        Ok(Self { shared, listeners, worker: Mutex::new(Some(handle)), worker_id })
    }

    fn on_worker(&self) -> bool {
        std::thread::current().id() == self.worker_id
    }

    /// Leave the disabled state. The first enable queues a full run.
    ///
    /// A build failure active at the first enable drops that run like any
    /// other request; call [`RunCoordinator::request`] with a full run after
    /// the build succeeds.
    pub fn enable(&self) {
        {
            let mut state = self.shared.lock();
            if state.phase != Phase::Disabled || state.shutdown {
                return;
            }
            state.phase = if state.queued.is_some() && !state.paused {
                Phase::Running
            } else {
                Phase::Idle
            };
            if !state.ever_enabled {
                state.ever_enabled = true;
                self.shared.request_locked(&mut state, RunRequest::full());
            }
            self.shared.changed.notify_all();
        }
        tracing::info!("continuous testing enabled");
        self.listeners.dispatch("tests_enabled", |l| l.tests_enabled());
    }

    /// Disable testing, abort the in-flight batch and wait for it to stop.
    pub fn disable(&self) {
        {
            let mut state = self.shared.lock();
            if state.phase == Phase::Disabled && state.in_flight.is_none() {
                return;
            }
            state.phase = Phase::Disabled;
            state.queued = None;
            if let Some(token) = &state.in_flight {
                token.cancel();
            }
            if !self.on_worker() {
                while state.in_flight.is_some() {
                    state = self.shared.wait(state);
                }
            }
        }
        tracing::info!("continuous testing disabled");
        self.listeners.dispatch("tests_disabled", |l| l.tests_disabled());
    }

    /// Request a batch. Coalesced into the queued slot when busy.
    pub fn request(&self, request: RunRequest) -> bool {
        let mut state = self.shared.lock();
        self.shared.request_locked(&mut state, request)
    }

    /// Abort the in-flight batch and wait for it to stop. The queued slot is kept.
    pub fn abort(&self) {
        let mut state = self.shared.lock();
        let Some(run_id) = state.running else {
            return;
        };
        if let Some(token) = &state.in_flight {
            token.cancel();
        }
        tracing::info!(run_id, "aborting test run");
        if !self.on_worker() {
            while state.running == Some(run_id) {
                state = self.shared.wait(state);
            }
        }
    }

    /// Hold off starting new batches. A running batch is not interrupted.
    pub fn pause(&self) {
        self.shared.lock().paused = true;
    }

    pub fn resume(&self) {
        let mut state = self.shared.lock();
        state.paused = false;
        if state.phase == Phase::Idle && state.queued.is_some() {
            state.phase = Phase::Running;
        }
        self.shared.changed.notify_all();
    }

    /// Drop requests until the next successful build.
    pub fn build_failed(&self, message: &str) {
        {
            let mut state = self.shared.lock();
            state.build_blocked = true;
            state.build_block_logged = false;
        }
        tracing::info!(reason = message, "test compilation failed");
        self.listeners.dispatch("build_failed", |l| l.build_failed(message));
    }

    pub fn build_succeeded(&self) {
        let was_blocked = std::mem::replace(&mut self.shared.lock().build_blocked, false);
        if was_blocked {
            tracing::info!("test compilation succeeded");
        }
        self.listeners.dispatch("build_succeeded", |l| l.build_succeeded());
    }

    pub fn phase(&self) -> Phase {
        self.shared.lock().phase
    }

    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    pub fn is_enabled(&self) -> bool {
        self.phase() != Phase::Disabled
    }

    pub fn is_paused(&self) -> bool {
        self.shared.lock().paused
    }

    pub fn is_build_blocked(&self) -> bool {
        self.shared.lock().build_blocked
    }

    pub fn has_queued(&self) -> bool {
        self.shared.lock().queued.is_some()
    }

    pub fn status(&self) -> RunStatus {
        let state = self.shared.lock();
        RunStatus { last_run: state.last_run, running: state.running }
    }

    /// Stop the worker after the current batch is cancelled.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            state.shutdown = true;
            state.queued = None;
            if let Some(token) = &state.in_flight {
                token.cancel();
            }
            self.shared.changed.notify_all();
        }
        if self.on_worker() {
            return;
        }
        let handle = self.worker.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("test runner thread panicked");
            }
        }
    }
}

impl Drop for RunCoordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let mut state = shared.lock();
        let request = loop {
            if state.shutdown {
                return;
            }
            if state.phase != Phase::Disabled && !state.paused {
                if let Some(request) = state.queued.take() {
                    break request;
                }
            }
            state = shared.wait(state);
        };

        let run_id = state.next_run_id;
        state.next_run_id += 1;
        let cancel = CancellationToken::new();
        state.phase = Phase::Running;
        state.in_flight = Some(cancel.clone());
        state.running = Some(run_id);
        drop(state);

        let outcome = catch_unwind(AssertUnwindSafe(|| shared.runner.run_batch(run_id, request, &cancel)));

        let mut state = shared.lock();
        state.in_flight = None;
        state.running = None;
        match outcome {
            Ok(Ok(outcome)) if !outcome.is_aborted() => state.last_run = Some(run_id),
            Ok(Ok(_)) => {}
            Ok(Err(e)) => tracing::error!(run_id, error = %e, "test run failed"),
            Err(_) => tracing::error!(run_id, "test run panicked"),
        }
        if state.phase == Phase::Running && (state.queued.is_none() || state.paused) {
            state.phase = Phase::Idle;
        }
        shared.changed.notify_all();
    }
}
