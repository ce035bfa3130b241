//! Test run listeners.
//!
//! Listeners are called on the worker thread. A panicking listener is logged
//! and skipped; the remaining listeners and the batch carry on.

use crate::aggregate::ResultAggregate;
use crate::model::{TestId, TestResult};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};

/// Receives run lifecycle events.
pub trait TestListener: Send + Sync {
    /// A batch started with this many selectable units.
    fn run_started(&self, total: usize);
    fn test_started(&self, id: &TestId, class_name: &str);
    /// A leaf test finished or was skipped.
    fn test_complete(&self, result: &TestResult);
    fn dynamic_test_registered(&self, id: &TestId);
    fn run_complete(&self, aggregate: &ResultAggregate);
    fn run_aborted(&self);

    /// The filtered plan was empty. Sent instead of start/complete.
    fn no_tests(&self, _aggregate: &ResultAggregate) {}
    fn tests_enabled(&self) {}
    fn tests_disabled(&self) {}
    fn build_failed(&self, _message: &str) {}
    fn build_succeeded(&self) {}
    fn broken_only_changed(&self, _broken_only: bool) {}
    fn test_output_changed(&self, _display_output: bool) {}
}

/// A shared, panic-isolated list of listeners.
#[derive(Clone, Default)]
pub struct ListenerSet {
    listeners: Arc<Mutex<Vec<Arc<dyn TestListener>>>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn TestListener>) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Call every listener, isolating panics.
    pub fn dispatch<F>(&self, event: &'static str, f: F)
    where
        F: Fn(&dyn TestListener),
    {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        for listener in listeners {
            let outcome = catch_unwind(AssertUnwindSafe(|| f(listener.as_ref())));
            if let Err(payload) = outcome {
                let message = payload
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                tracing::error!(event, panic = %message, "test listener panicked");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        started: AtomicUsize,
        aborted: AtomicUsize,
    }

    impl TestListener for Counting {
        fn run_started(&self, total: usize) {
            self.started.fetch_add(total, Ordering::SeqCst);
        }
        fn test_started(&self, _id: &TestId, _class_name: &str) {}
        fn test_complete(&self, _result: &TestResult) {}
        fn dynamic_test_registered(&self, _id: &TestId) {}
        fn run_complete(&self, _aggregate: &ResultAggregate) {}
        fn run_aborted(&self) {
            self.aborted.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Panicking;

    impl TestListener for Panicking {
        fn run_started(&self, _total: usize) {
            panic!("listener bug");
        }
        fn test_started(&self, _id: &TestId, _class_name: &str) {}
        fn test_complete(&self, _result: &TestResult) {}
        fn dynamic_test_registered(&self, _id: &TestId) {}
        fn run_complete(&self, _aggregate: &ResultAggregate) {}
        fn run_aborted(&self) {}
    }

    #[test]
    fn panicking_listener_does_not_stop_others() {
        let set = ListenerSet::new();
        let counting = Arc::new(Counting::default());
        set.add(Arc::new(Panicking));
        set.add(counting.clone());

        set.dispatch("run_started", |l| l.run_started(3));
        set.dispatch("run_aborted", |l| l.run_aborted());

        assert_eq!(counting.started.load(Ordering::SeqCst), 3);
        assert_eq!(counting.aborted.load(Ordering::SeqCst), 1);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn default_methods_are_no_ops() {
        let set = ListenerSet::new();
        set.add(Arc::new(Counting::default()));
        set.dispatch("tests_enabled", |l| l.tests_enabled());
        set.dispatch("build_failed", |l| l.build_failed("boom"));
        assert!(!set.is_empty());
    }
}
