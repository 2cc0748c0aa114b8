use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::segment::Segment;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Paused,
    Completed,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Error)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Queued => "Queued",
            TaskStatus::Downloading => "Downloading",
            TaskStatus::Paused => "Paused",
            TaskStatus::Completed => "Completed",
            TaskStatus::Error => "Error",
        };
        f.write_str(s)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Progress {
    pub progress_percent: f64,
    pub speed_bytes_per_sec: f64,
    pub downloaded_bytes: u64,
    pub total_bytes: u64,
    pub eta_seconds: f64,
    pub status: TaskStatus,
    pub connections: usize,
    pub segments: Vec<Segment>,
}

/// Events a single task emits on its outbound channel.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    Progress(Progress),
    /// The destination file is in place; `path` may carry a ` (n)` suffix.
    Complete { path: PathBuf },
    Error { message: String },
}

/// A task event tagged with the transfer it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferEvent {
    pub id: String,
    pub event: TaskEvent,
}
