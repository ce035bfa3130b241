//! Core data model shared by selection, execution and aggregation.
//!
//! Identifiers are hierarchical `[kind:value]` paths, for example
//! `[engine:junit]/[class:org.acme.FooTest]/[method:bar()]`. Results, change
//! sets and requests are plain values that are cloned across the worker
//! boundary.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum failure summary length before truncation.
const MAX_SUMMARY_LENGTH: usize = 1000;

/// Segment kind used for the engine root of an identifier.
pub const ENGINE_SEGMENT: &str = "engine";

/// Errors that can occur while parsing a [`TestId`].
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdParseError {
    #[error("identifier is empty")]
    Empty,
    #[error("segment is not enclosed in brackets: {0}")]
    MissingBracket(String),
    #[error("segment has no kind: {0}")]
    MissingKind(String),
    #[error("identifier ends with a separator")]
    TrailingSeparator,
}

/// One `[kind:value]` element of a [`TestId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdSegment {
    pub kind: String,
    pub value: String,
}

/// Hierarchical test identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TestId {
    segments: Vec<IdSegment>,
}

impl TestId {
    /// Create a single-segment identifier.
    pub fn root(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            segments: vec![IdSegment { kind: kind.into(), value: value.into() }],
        }
    }

    /// Create an identifier one level below this one.
    #[must_use]
    pub fn child(&self, kind: impl Into<String>, value: impl Into<String>) -> Self {
        let mut segments = self.segments.clone();
        segments.push(IdSegment { kind: kind.into(), value: value.into() });
        Self { segments }
    }

    /// The identifier with its last segment removed, if any remain.
    pub fn parent(&self) -> Option<TestId> {
        if self.segments.len() < 2 {
            return None;
        }
        Some(Self {
            segments: self.segments[..self.segments.len() - 1].to_vec(),
        })
    }

    pub fn segments(&self) -> &[IdSegment] {
        &self.segments
    }

    pub fn last_segment(&self) -> Option<&IdSegment> {
        self.segments.last()
    }

    /// Value of the `[engine:...]` segment, when present.
    pub fn engine(&self) -> Option<&str> {
        self.segments
            .iter()
            .find(|s| s.kind == ENGINE_SEGMENT)
            .map(|s| s.value.as_str())
    }

    /// Parse the `[kind:value]/[kind:value]` form.
    pub fn parse(input: &str) -> Result<Self, IdParseError> {
        let mut segments = Vec::new();
        let mut rest = input;

        while !rest.is_empty() {
            let body = rest
                .strip_prefix('[')
                .ok_or_else(|| IdParseError::MissingBracket(rest.to_string()))?;

            let (segment, tail) = if let Some(end) = body.find("]/") {
                let tail = &body[end + 2..];
                if tail.is_empty() {
                    return Err(IdParseError::TrailingSeparator);
                }
                (&body[..end], tail)
            } else {
                let segment = body
                    .strip_suffix(']')
                    .ok_or_else(|| IdParseError::MissingBracket(rest.to_string()))?;
                (segment, "")
            };

            let Some((kind, value)) = segment.split_once(':') else {
                return Err(IdParseError::MissingKind(segment.to_string()));
            };
            if kind.is_empty() {
                return Err(IdParseError::MissingKind(segment.to_string()));
            }

            segments.push(IdSegment { kind: kind.to_string(), value: value.to_string() });
            rest = tail;
        }

        if segments.is_empty() {
            return Err(IdParseError::Empty);
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            write!(f, "[{}:{}]", segment.kind, segment.value)?;
        }
        Ok(())
    }
}

impl FromStr for TestId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<TestId> for String {
    fn from(id: TestId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TestId {
    type Error = IdParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

/// Outcome of a single test unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Passed,
    Failed,
    /// Skipped, disabled or interrupted before completion.
    Aborted,
}

/// The latest recorded result of one test unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResult {
    pub id: TestId,
    pub display_name: String,
    pub declaring_class: String,
    /// Tags in declaration order, for display.
    pub tags: Vec<String>,
    pub status: TestStatus,
    pub captured_output: Vec<String>,
    /// `false` for containers such as a class or a test factory.
    pub is_leaf: bool,
    pub run_id: u64,
    pub duration_ms: u64,
    pub failure: Option<String>,
}

impl TestResult {
    pub fn is_failed(&self) -> bool {
        self.status == TestStatus::Failed
    }

    /// First line of the failure detail, truncated for display.
    pub fn failure_summary(&self) -> Option<String> {
        let detail = self.failure.as_deref()?;
        let first = detail.lines().next().unwrap_or("");
        Some(truncate_message(first))
    }
}

fn truncate_message(message: &str) -> String {
    if message.chars().count() > MAX_SUMMARY_LENGTH {
        format!(
            "{}...",
            message
                .chars()
                .take(MAX_SUMMARY_LENGTH - 3)
                .collect::<String>()
        )
    } else {
        message.to_string()
    }
}

/// Class names added, changed or deleted since the previous batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub added: BTreeSet<String>,
    pub changed: BTreeSet<String>,
    pub deleted: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_added(mut self, class: impl Into<String>) -> Self {
        self.added.insert(class.into());
        self
    }

    #[must_use]
    pub fn with_changed(mut self, class: impl Into<String>) -> Self {
        self.changed.insert(class.into());
        self
    }

    #[must_use]
    pub fn with_deleted(mut self, class: impl Into<String>) -> Self {
        self.deleted.insert(class.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.changed.is_empty() && self.deleted.is_empty()
    }

    /// Union another change set into this one.
    pub fn merge(&mut self, other: ChangeSet) {
        self.added.extend(other.added);
        self.changed.extend(other.changed);
        self.deleted.extend(other.deleted);
    }

    /// Every class that counts as "changed" for selection, deleted ones included.
    pub fn changed_class_names(&self) -> HashSet<String> {
        self.added
            .iter()
            .chain(&self.changed)
            .chain(&self.deleted)
            .cloned()
            .collect()
    }
}

/// A request to run a batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunRequest {
    /// `None` means run everything.
    pub changes: Option<ChangeSet>,
    pub rerun_failing_only: bool,
}

impl RunRequest {
    pub fn full() -> Self {
        Self::default()
    }

    pub fn for_changes(changes: ChangeSet) -> Self {
        Self { changes: Some(changes), rerun_failing_only: false }
    }

    pub fn failing_only() -> Self {
        Self { changes: None, rerun_failing_only: true }
    }

    /// Coalesce a newer request into this queued one.
    ///
    /// A full run absorbs any change set, change sets union, and a queued
    /// failing-only replay gives way to a real change request.
    #[must_use]
    pub fn coalesce(self, newer: RunRequest) -> RunRequest {
        match (self.rerun_failing_only, newer.rerun_failing_only) {
            (true, false) => newer,
            (false, true) | (true, true) => self,
            (false, false) => {
                let changes = match (self.changes, newer.changes) {
                    (Some(mut queued), Some(incoming)) => {
                        queued.merge(incoming);
                        Some(queued)
                    }
                    _ => None,
                };
                RunRequest { changes, rerun_failing_only: false }
            }
        }
    }
}

/// Structural role of a discovered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Engine root, class with children, nested group. Never filtered itself.
    Container,
    /// A whole class that runs as one unit (class-level usage record).
    ClassUnit,
    /// A single test (method-level usage record).
    Test,
}

impl DescriptorKind {
    /// Whether filters judge this descriptor directly.
    pub fn is_selectable(self) -> bool {
        matches!(self, DescriptorKind::ClassUnit | DescriptorKind::Test)
    }
}

/// A discovered test unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestDescriptor {
    pub id: TestId,
    pub display_name: String,
    /// `None` for descriptors without a class source, such as engine roots.
    pub declaring_class: Option<String>,
    /// Own tags followed by inherited class tags.
    pub tags: Vec<String>,
    pub kind: DescriptorKind,
}

impl TestDescriptor {
    pub fn new(id: TestId, kind: DescriptorKind) -> Self {
        let display_name = id
            .last_segment()
            .map(|s| s.value.clone())
            .unwrap_or_default();
        Self { id, display_name, declaring_class: None, tags: Vec::new(), kind }
    }

    #[must_use]
    pub fn with_class(mut self, class: impl Into<String>) -> Self {
        self.declaring_class = Some(class.into());
        self
    }

    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    #[must_use]
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn engine(&self) -> Option<&str> {
        self.id.engine()
    }

    pub fn is_test(&self) -> bool {
        self.kind == DescriptorKind::Test
    }
}
