//! Touched-class tracing for the descriptors of one batch.
//!
//! Keeps a stack of frames that mirrors the start/finish nesting of the
//! probe's events. A frame's record holds what it touched directly, what its
//! finished children touched, what its ancestors touched directly and the
//! startup snapshot. Siblings never see each other's classes.

use std::collections::HashSet;
use std::time::Instant;

struct Frame {
    /// Touched while this frame was innermost.
    own: HashSet<String>,
    /// Touched by finished children.
    merged: HashSet<String>,
    started: Instant,
}

/// What a finished frame reports for its usage record.
#[derive(Debug, Default)]
pub struct FinishedFrame {
    /// Own and child classes, plus the direct classes of every enclosing
    /// frame and the startup snapshot.
    pub touched: HashSet<String>,
    pub duration_ms: u64,
}

#[derive(Default)]
pub struct Tracer {
    frames: Vec<Frame>,
    startup: HashSet<String>,
    /// Depth of the frame the framework started in, until it finishes.
    startup_frame: Option<usize>,
    ready_seen: bool,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self) {
        self.frames.push(Frame {
            own: HashSet::new(),
            merged: HashSet::new(),
            started: Instant::now(),
        });
    }

    /// Add classes to the innermost frame. Ignored outside any frame.
    pub fn touch<'a, I>(&mut self, classes: I)
    where
        I: IntoIterator<Item = &'a String>,
    {
        if let Some(frame) = self.frames.last_mut() {
            frame.own.extend(classes.into_iter().cloned());
        }
    }

    /// Mark the innermost frame as the one the framework started in.
    ///
    /// Only the first report counts. Everything that frame touches directly
    /// becomes part of every later usage record.
    pub fn framework_ready(&mut self) {
        if self.ready_seen {
            return;
        }
        self.ready_seen = true;
        if let Some(depth) = self.frames.len().checked_sub(1) {
            self.startup_frame = Some(depth);
        }
    }

    /// Finish the innermost frame and hand its classes to the parent's
    /// child set.
    pub fn pop(&mut self) -> FinishedFrame {
        let Some(frame) = self.frames.pop() else {
            return FinishedFrame { touched: self.startup.clone(), duration_ms: 0 };
        };
        let depth = self.frames.len();

        if self.startup_frame == Some(depth) {
            self.startup.extend(frame.own.iter().cloned());
            self.startup_frame = None;
        }

        let mut own = frame.own;
        own.extend(frame.merged);

        let mut touched = own.clone();
        for ancestor in &self.frames {
            touched.extend(ancestor.own.iter().cloned());
        }
        touched.extend(self.startup.iter().cloned());

        if let Some(parent) = self.frames.last_mut() {
            parent.merged.extend(own);
        }

        let duration_ms = u64::try_from(frame.started.elapsed().as_millis()).unwrap_or(u64::MAX);
        FinishedFrame { touched, duration_ms }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }
}
