//! Per-batch result aggregation.
//!
//! A [`ResultAggregate`] is a pure function of a store snapshot and the run
//! id that produced it. Class buckets touched by this run are *current*, the
//! rest are *historic*.

use crate::model::{ChangeSet, TestResult, TestStatus};
use crate::store::ResultsByClass;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Results of one declaring class, split by status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassResult {
    pub class_name: String,
    pub passing: Vec<TestResult>,
    pub failing: Vec<TestResult>,
    pub skipped: Vec<TestResult>,
    /// Highest run id among this class's results.
    pub latest_run_id: u64,
}

impl ClassResult {
    fn new(class_name: String, mut results: Vec<TestResult>) -> Self {
        results.sort_by(|a, b| a.id.cmp(&b.id));
        let latest_run_id = results.iter().map(|r| r.run_id).max().unwrap_or(0);

        let mut out = Self {
            class_name,
            passing: Vec::new(),
            failing: Vec::new(),
            skipped: Vec::new(),
            latest_run_id,
        };
        for result in results {
            match result.status {
                TestStatus::Passed => out.passing.push(result),
                TestStatus::Failed => out.failing.push(result),
                TestStatus::Aborted => out.skipped.push(result),
            }
        }
        out
    }

    pub fn is_failing(&self) -> bool {
        !self.failing.is_empty()
    }

    pub fn is_passing(&self) -> bool {
        !self.is_failing() && !self.passing.is_empty()
    }

    fn leaf_counts(&self) -> Counts {
        let leaves = |results: &[TestResult]| results.iter().filter(|r| r.is_leaf).count();
        Counts {
            passed: leaves(&self.passing),
            failed: leaves(&self.failing),
            skipped: leaves(&self.skipped),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Counts {
    passed: usize,
    failed: usize,
    skipped: usize,
}

impl Counts {
    fn add(self, other: Counts) -> Counts {
        Counts {
            passed: self.passed + other.passed,
            failed: self.failed + other.failed,
            skipped: self.skipped + other.skipped,
        }
    }
}

/// The view of all known results after one batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultAggregate {
    pub run_id: u64,
    /// The change set that triggered the batch; `None` for full runs.
    pub trigger: Option<ChangeSet>,
    pub full_run: bool,
    /// Milliseconds since the Unix epoch.
    pub started_at: u64,
    pub completed_at: u64,
    pub current_failing: Vec<ClassResult>,
    pub current_passing: Vec<ClassResult>,
    pub current_skipped: Vec<ClassResult>,
    pub historic_failing: Vec<ClassResult>,
    pub historic_passing: Vec<ClassResult>,
    pub historic_skipped: Vec<ClassResult>,
}

impl ResultAggregate {
    /// Classify a store snapshot for the given run.
    pub fn from_snapshot(
        run_id: u64,
        trigger: Option<ChangeSet>,
        started_at: u64,
        completed_at: u64,
        snapshot: ResultsByClass,
    ) -> Self {
        let mut aggregate = Self {
            run_id,
            full_run: trigger.is_none(),
            trigger,
            started_at,
            completed_at,
            current_failing: Vec::new(),
            current_passing: Vec::new(),
            current_skipped: Vec::new(),
            historic_failing: Vec::new(),
            historic_passing: Vec::new(),
            historic_skipped: Vec::new(),
        };

        let mut classes: Vec<ClassResult> = snapshot
            .into_iter()
            .map(|(class, bucket)| ClassResult::new(class, bucket.into_values().collect()))
            .collect();
        classes.sort_by(|a, b| a.class_name.cmp(&b.class_name));

        for class in classes {
            let current = class
                .passing
                .iter()
                .chain(&class.failing)
                .chain(&class.skipped)
                .any(|r| r.run_id == run_id);

            let target = match (current, class.is_failing(), class.is_passing()) {
                (true, true, _) => &mut aggregate.current_failing,
                (true, false, true) => &mut aggregate.current_passing,
                (true, false, false) => &mut aggregate.current_skipped,
                (false, true, _) => &mut aggregate.historic_failing,
                (false, false, true) => &mut aggregate.historic_passing,
                (false, false, false) => &mut aggregate.historic_skipped,
            };
            target.push(class);
        }
        aggregate
    }

    fn current_counts(&self) -> Counts {
        self.current_failing
            .iter()
            .chain(&self.current_passing)
            .chain(&self.current_skipped)
            .map(ClassResult::leaf_counts)
            .fold(Counts::default(), Counts::add)
    }

    fn total_counts(&self) -> Counts {
        self.historic_failing
            .iter()
            .chain(&self.historic_passing)
            .chain(&self.historic_skipped)
            .map(ClassResult::leaf_counts)
            .fold(self.current_counts(), Counts::add)
    }

    pub fn current_passed_count(&self) -> usize {
        self.current_counts().passed
    }

    pub fn current_failed_count(&self) -> usize {
        self.current_counts().failed
    }

    pub fn current_skipped_count(&self) -> usize {
        self.current_counts().skipped
    }

    pub fn current_total_count(&self) -> usize {
        let c = self.current_counts();
        c.passed + c.failed + c.skipped
    }

    pub fn passed_count(&self) -> usize {
        self.total_counts().passed
    }

    pub fn failed_count(&self) -> usize {
        self.total_counts().failed
    }

    pub fn skipped_count(&self) -> usize {
        self.total_counts().skipped
    }

    pub fn total_count(&self) -> usize {
        let c = self.total_counts();
        c.passed + c.failed + c.skipped
    }

    /// Every failing class, current first.
    pub fn failing_classes(&self) -> impl Iterator<Item = &ClassResult> {
        self.current_failing.iter().chain(&self.historic_failing)
    }

    /// Every passing class, current first.
    pub fn passing_classes(&self) -> impl Iterator<Item = &ClassResult> {
        self.current_passing.iter().chain(&self.historic_passing)
    }

    pub fn duration_ms(&self) -> u64 {
        self.completed_at.saturating_sub(self.started_at)
    }

    /// Export the aggregate as JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
