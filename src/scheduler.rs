use crate::config::{clamp_concurrency, DEFAULT_CONCURRENCY_LIMIT};
use crate::controller::ProcessController;
use crate::task::{LogLevel, LogSource, TaskId, TaskStatus, TaskStore};
use crate::EngineError;
use std::collections::HashSet;

/// What one tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub promoted: Vec<TaskId>,
    pub started: Vec<TaskId>,
    /// Start attempts that moved the task to `error`.
    pub failed: Vec<TaskId>,
    /// Left pending by the disk pre-flight; admission stopped there.
    pub deferred: Vec<TaskId>,
}

impl TickReport {
    pub fn is_empty(&self) -> bool {
        self.promoted.is_empty()
            && self.started.is_empty()
            && self.failed.is_empty()
            && self.deferred.is_empty()
    }

    pub fn touched(&self) -> impl Iterator<Item = &TaskId> {
        self.promoted
            .iter()
            .chain(&self.started)
            .chain(&self.failed)
            .chain(&self.deferred)
    }
}

/// Slots in use: active tasks, or live handles when that is larger (a task
/// paused in place still owns its process).
pub fn active_count(store: &TaskStore, controller: &ProcessController) -> usize {
    store
        .count_where(|t| t.status.is_active())
        .max(controller.live_count())
}

/// Moves scheduled tasks whose time has come to `pending`.
pub fn promote_due(store: &mut TaskStore, now_ms: i64, log_cap: usize) -> Vec<TaskId> {
    let due: Vec<TaskId> = store
        .iter()
        .filter(|t| {
            t.status == TaskStatus::Scheduled && t.scheduled_at_ms.map(|at| at <= now_ms).unwrap_or(true)
        })
        .map(|t| t.id.clone())
        .collect();

    let mut promoted = Vec::with_capacity(due.len());
    for id in due {
        let Some(task) = store.get_mut(&id) else {
            continue;
        };
        if task.transition(TaskStatus::Pending, "promote", now_ms).is_ok() {
            task.push_log(
                LogLevel::Info,
                LogSource::Scheduler,
                "Scheduled start triggered",
                now_ms,
                log_cap,
            );
            promoted.push(id);
        }
    }
    promoted
}

/// Oldest pending task by enqueue order, skipping `exclude`.
pub fn next_admission(store: &TaskStore, exclude: &HashSet<TaskId>) -> Option<TaskId> {
    store
        .iter()
        .filter(|t| t.status == TaskStatus::Pending && !exclude.contains(&t.id))
        .min_by_key(|t| t.seq)
        .map(|t| t.id.clone())
}

#[derive(Debug, Clone)]
pub struct Scheduler {
    concurrency_limit: usize,
    queue_paused: bool,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(DEFAULT_CONCURRENCY_LIMIT)
    }
}

impl Scheduler {
    pub fn new(concurrency_limit: usize) -> Self {
        Self {
            concurrency_limit: clamp_concurrency(concurrency_limit),
            queue_paused: false,
        }
    }

    pub fn concurrency_limit(&self) -> usize {
        self.concurrency_limit
    }

    /// Lowering the limit never touches running tasks; it only blocks new
    /// admissions until the active count drops.
    pub fn set_concurrency_limit(&mut self, limit: usize) -> usize {
        self.concurrency_limit = clamp_concurrency(limit);
        self.concurrency_limit
    }

    pub fn is_queue_paused(&self) -> bool {
        self.queue_paused
    }

    pub fn set_queue_paused(&mut self, paused: bool) {
        self.queue_paused = paused;
    }

    /// Promotes due scheduled tasks, then admits pending tasks in FIFO order
    /// while slots are free.
    pub fn tick(
        &mut self,
        store: &mut TaskStore,
        controller: &mut ProcessController,
        now_ms: i64,
    ) -> TickReport {
        let mut report = TickReport {
            promoted: promote_due(store, now_ms, controller.log_cap()),
            ..TickReport::default()
        };
        if self.queue_paused {
            return report;
        }

        let mut attempted: HashSet<TaskId> = HashSet::new();
        while active_count(store, controller) < self.concurrency_limit {
            let Some(id) = next_admission(store, &attempted) else {
                break;
            };
            attempted.insert(id.clone());
            let Some(task) = store.get_mut(&id) else {
                continue;
            };

            match controller.start(task, now_ms) {
                Ok(()) => report.started.push(id),
                Err(EngineError::InsufficientSpace { .. }) => {
                    if task.status == TaskStatus::Error {
                        report.failed.push(id);
                    } else {
                        report.deferred.push(id);
                    }
                    break;
                }
                Err(err) => {
                    tracing::debug!(task_id = %id, error = %err, "admission failed");
                    report.failed.push(id);
                }
            }
        }

        if !report.is_empty() {
            tracing::debug!(
                promoted = report.promoted.len(),
                started = report.started.len(),
                failed = report.failed.len(),
                deferred = report.deferred.len(),
                limit = self.concurrency_limit,
                "scheduler tick"
            );
        }
        report
    }
}
