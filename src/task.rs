use crate::options::DownloadOptions;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

/// Placeholder shown for speed/eta when no live figure is known.
pub const STAT_SENTINEL: &str = "-";

const MS_PER_DAY: i64 = 24 * 60 * 60 * 1000;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for TaskId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Scheduled,
    Pending,
    FetchingInfo,
    Downloading,
    Processing,
    Paused,
    Error,
    Stopped,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Scheduled => "scheduled",
            TaskStatus::Pending => "pending",
            TaskStatus::FetchingInfo => "fetching_info",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Processing => "processing",
            TaskStatus::Paused => "paused",
            TaskStatus::Error => "error",
            TaskStatus::Stopped => "stopped",
            TaskStatus::Completed => "completed",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "scheduled" => Some(TaskStatus::Scheduled),
            "pending" => Some(TaskStatus::Pending),
            "fetching_info" => Some(TaskStatus::FetchingInfo),
            "downloading" => Some(TaskStatus::Downloading),
            "processing" => Some(TaskStatus::Processing),
            "paused" => Some(TaskStatus::Paused),
            "error" => Some(TaskStatus::Error),
            "stopped" => Some(TaskStatus::Stopped),
            "completed" => Some(TaskStatus::Completed),
            _ => None,
        }
    }

    /// States in which a process is running and counts against the limit.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::FetchingInfo | TaskStatus::Downloading | TaskStatus::Processing
        )
    }

    /// Terminal or quasi-terminal: the only states a task may be cleared from.
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Stopped
        )
    }

    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (*self, next),
            (Scheduled, Pending | Stopped)
                | (Pending, FetchingInfo | Error | Stopped)
                | (
                    FetchingInfo,
                    Downloading | Processing | Paused | Completed | Error | Stopped
                )
                | (Downloading, Processing | Paused | Completed | Error | Stopped)
                | (Processing, Paused | Completed | Error | Stopped)
                | (Paused, Downloading | Pending | Completed | Error | Stopped)
                | (Error | Stopped, Pending)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogSource {
    Engine,
    Scheduler,
    Controller,
    Process,
    Recovery,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub message: String,
    pub level: LogLevel,
    pub source: LogSource,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Enqueue order; admission is FIFO on this value.
    pub seq: u64,
    pub url: String,
    pub status: TaskStatus,
    pub options: DownloadOptions,
    pub progress: f64,
    pub speed: String,
    pub eta: String,
    pub total_size: Option<String>,
    pub title: Option<String>,
    pub error_message: Option<String>,
    pub file_path: Option<String>,
    pub log_entries: Vec<LogEntry>,
    pub scheduled_at_ms: Option<i64>,
    pub created_at_ms: i64,
    pub started_at_ms: Option<i64>,
    pub finished_at_ms: Option<i64>,
    /// Spawn attempts, including retries and respawns.
    pub attempts: u32,
    pub space_failures: u32,
}

impl Task {
    /// A task scheduled for the past (or now) starts out pending.
    pub fn new(
        id: TaskId,
        url: String,
        options: DownloadOptions,
        scheduled_at_ms: Option<i64>,
        now_ms: i64,
    ) -> Self {
        let scheduled_at_ms = scheduled_at_ms.filter(|at| *at > now_ms);
        let status = if scheduled_at_ms.is_some() {
            TaskStatus::Scheduled
        } else {
            TaskStatus::Pending
        };
        Self {
            id,
            seq: 0,
            url,
            status,
            options,
            progress: 0.0,
            speed: STAT_SENTINEL.to_string(),
            eta: STAT_SENTINEL.to_string(),
            total_size: None,
            title: None,
            error_message: None,
            file_path: None,
            log_entries: Vec::new(),
            scheduled_at_ms,
            created_at_ms: now_ms,
            started_at_ms: None,
            finished_at_ms: None,
            attempts: 0,
            space_failures: 0,
        }
    }

    /// Applies one state-machine edge. `action` names the operation for the
    /// error message when the edge is not allowed.
    pub fn transition(&mut self, next: TaskStatus, action: &'static str, now_ms: i64) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition {
                id: self.id.to_string(),
                action,
                status: self.status,
            });
        }
        if self.status == TaskStatus::Scheduled {
            self.scheduled_at_ms = None;
        }
        if next.is_finished() {
            self.finished_at_ms = Some(now_ms);
        } else {
            self.finished_at_ms = None;
        }
        self.status = next;
        Ok(())
    }

    pub fn push_log(
        &mut self,
        level: LogLevel,
        source: LogSource,
        message: impl Into<String>,
        now_ms: i64,
        cap: usize,
    ) {
        self.log_entries.push(LogEntry {
            message: message.into(),
            level,
            source,
            timestamp_ms: now_ms,
        });
        if self.log_entries.len() > cap {
            let excess = self.log_entries.len() - cap;
            self.log_entries.drain(..excess);
        }
    }

    pub fn reset_transfer_stats(&mut self) {
        self.speed = STAT_SENTINEL.to_string();
        self.eta = STAT_SENTINEL.to_string();
    }

    /// Clears per-run output ahead of a fresh spawn. Logs are kept.
    pub fn reset_for_rerun(&mut self) {
        self.progress = 0.0;
        self.reset_transfer_stats();
        self.total_size = None;
        self.error_message = None;
        self.file_path = None;
        self.started_at_ms = None;
        self.space_failures = 0;
    }

    /// How the task ended. A user stop reports `Cancelled`, which is not a
    /// failure.
    pub fn outcome(&self) -> Result<()> {
        match self.status {
            TaskStatus::Error => Err(EngineError::Process(
                self.error_message
                    .clone()
                    .unwrap_or_else(|| "download failed".to_string()),
            )),
            TaskStatus::Stopped => Err(EngineError::Cancelled(self.id.to_string())),
            _ => Ok(()),
        }
    }
}

/// Ordered, in-memory collection of tasks. The engine's control thread is the
/// only writer.
#[derive(Debug, Default)]
pub struct TaskStore {
    tasks: HashMap<TaskId, Task>,
    order: Vec<TaskId>,
    next_seq: u64,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the contents with persisted tasks, ordered by `seq`.
    pub fn restore(&mut self, mut tasks: Vec<Task>) {
        tasks.sort_by_key(|t| t.seq);
        self.tasks.clear();
        self.order.clear();
        self.next_seq = 0;
        for task in tasks {
            self.next_seq = self.next_seq.max(task.seq + 1);
            self.order.push(task.id.clone());
            self.tasks.insert(task.id.clone(), task);
        }
    }

    /// Adds a new task at the back of the queue, assigning its `seq`.
    pub fn insert(&mut self, mut task: Task) -> TaskId {
        task.seq = self.next_seq;
        self.next_seq += 1;
        let id = task.id.clone();
        if self.tasks.insert(id.clone(), task).is_none() {
            self.order.push(id.clone());
        }
        id
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.get(id)
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut Task> {
        self.tasks.get_mut(id)
    }

    pub fn require(&self, id: &TaskId) -> Result<&Task> {
        self.tasks
            .get(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub fn require_mut(&mut self, id: &TaskId) -> Result<&mut Task> {
        self.tasks
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.tasks.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task> {
        self.order.iter().filter_map(|id| self.tasks.get(id))
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.order.clone()
    }

    pub fn count_where(&self, pred: impl Fn(&Task) -> bool) -> usize {
        self.tasks.values().filter(|t| pred(t)).count()
    }

    pub fn any(&self, pred: impl Fn(&Task) -> bool) -> bool {
        self.tasks.values().any(pred)
    }

    /// Removes a completed, stopped or failed task.
    pub fn clear(&mut self, id: &TaskId) -> Result<Task> {
        let status = self.require(id)?.status;
        if !status.is_finished() {
            return Err(EngineError::InvalidTransition {
                id: id.to_string(),
                action: "clear",
                status,
            });
        }
        self.order.retain(|existing| existing != id);
        self.tasks
            .remove(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    /// Drops finished tasks past the retention window, then the oldest
    /// finished tasks while the store exceeds `max_items`.
    pub fn prune_history(&mut self, now_ms: i64, retention_days: u32, max_items: usize) -> Vec<TaskId> {
        let mut removed = Vec::new();

        if retention_days > 0 {
            let cutoff = now_ms - i64::from(retention_days) * MS_PER_DAY;
            let expired: Vec<TaskId> = self
                .iter()
                .filter(|t| t.status.is_finished() && t.created_at_ms < cutoff)
                .map(|t| t.id.clone())
                .collect();
            for id in expired {
                if self.clear(&id).is_ok() {
                    removed.push(id);
                }
            }
        }

        if max_items > 0 {
            while self.order.len() > max_items {
                let oldest_finished = self
                    .iter()
                    .find(|t| t.status.is_finished())
                    .map(|t| t.id.clone());
                let Some(id) = oldest_finished else {
                    break;
                };
                if self.clear(&id).is_err() {
                    break;
                }
                removed.push(id);
            }
        }

        removed
    }
}
