//! AI job lifecycle.
//!
//! At most one external detection/re-identification process runs at a time.
//! [`JobRunner`] stages the selected images into a temp area, launches the
//! process, streams its output as [`JobEvent`]s and cleans up on every exit
//! path.

pub mod launcher;
pub mod runner;

use serde::Serialize;
use std::path::PathBuf;

pub use launcher::AiLauncher;
pub use runner::JobRunner;

/// Unique identifier for an AI job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct JobId(pub u64);

impl JobId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        JobId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

/// Task keyword passed as the first argument of the AI executable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Detection,
    Reid,
}

impl JobKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            JobKind::Detection => "detection",
            JobKind::Reid => "reid",
        }
    }

    /// Full display name for messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            JobKind::Detection => "Detection",
            JobKind::Reid => "ReID",
        }
    }
}

/// Progress reported by the AI process through `PROCESS: <done>/<total>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaskProgress {
    pub current: usize,
    pub total: usize,
}

impl TaskProgress {
    pub fn new(current: usize, total: usize) -> Self {
        Self { current, total }
    }

    /// Parse a progress marker line. Anything else yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let rest = line.trim().strip_prefix("PROCESS:")?;
        let (current, total) = rest.trim().split_once('/')?;
        Some(Self::new(
            current.trim().parse().ok()?,
            total.trim().parse().ok()?,
        ))
    }

    /// Calculate progress percentage (0-100).
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            0
        } else {
            ((self.current as f64 / self.total as f64) * 100.0).min(100.0) as u8
        }
    }
}

/// Which output stream of the AI process a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Updates streamed to the caller while a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEvent {
    /// A progress marker line.
    Progress(TaskProgress),
    /// Any other line, passed through verbatim.
    Output { stream: OutputStream, line: String },
}

/// Observable state of the runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobStatus {
    Idle,
    Staging { id: JobId, kind: JobKind },
    Running { id: JobId, kind: JobKind, pid: Option<u32> },
}

/// Result of a job that exited with status 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub id: JobId,
    pub kind: JobKind,
    /// Number of images handed to the AI process.
    pub staged: usize,
    /// Selected images that no longer existed and were skipped.
    pub skipped: Vec<PathBuf>,
}
