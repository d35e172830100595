use crate::config::QueueSettings;
use crate::controller::ProcessController;
use crate::events::{apply_event, EventOutcome};
use crate::options::DownloadOptions;
use crate::power::{wants_awake, PowerGuard, SleepInhibitor};
use crate::process::ProcessMessage;
use crate::recovery::recover_interrupted;
use crate::repository::TaskRepository;
use crate::scheduler::{Scheduler, TickReport};
use crate::task::{LogLevel, LogSource, Task, TaskId, TaskStatus, TaskStore};
use crate::ytdlp;
use crate::Result;
use std::collections::HashSet;
use std::sync::mpsc::{self, Receiver, Sender};

/// Snapshot pushed to subscribers after every mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskUpdate {
    Changed(Task),
    Removed(TaskId),
}

pub struct QueueEngine {
    store: TaskStore,
    scheduler: Scheduler,
    controller: ProcessController,
    power: PowerGuard,
    repo: TaskRepository,
    settings: QueueSettings,
    subscribers: Vec<Sender<TaskUpdate>>,
    dirty: HashSet<TaskId>,
    last_flush_ms: i64,
}

impl QueueEngine {
    pub fn new(
        settings: QueueSettings,
        repo: TaskRepository,
        controller: ProcessController,
        inhibitor: Box<dyn SleepInhibitor>,
    ) -> Self {
        let settings = settings.normalized();
        Self {
            store: TaskStore::new(),
            scheduler: Scheduler::new(settings.concurrency_limit),
            controller,
            power: PowerGuard::new(inhibitor, settings.prevent_sleep),
            repo,
            settings,
            subscribers: Vec::new(),
            dirty: HashSet::new(),
            last_flush_ms: 0,
        }
    }

    /// Loads persisted tasks and runtime overrides, then reconciles tasks
    /// that were live when the previous process died. Must run before the
    /// first tick.
    pub fn restore(&mut self, now_ms: i64) -> Result<Vec<TaskId>> {
        let tasks = self.repo.load_all()?;
        let loaded = tasks.len();
        self.store.restore(tasks);

        if let Some(limit) = self.repo.stored_max_concurrency()? {
            self.scheduler.set_concurrency_limit(limit);
        }
        self.scheduler.set_queue_paused(self.repo.queue_paused()?);

        let recovered = recover_interrupted(&mut self.store, now_ms, self.controller.log_cap());
        self.persist_now(&recovered);
        self.refresh_power();

        tracing::info!(
            loaded,
            recovered = recovered.len(),
            limit = self.scheduler.concurrency_limit(),
            queue_paused = self.scheduler.is_queue_paused(),
            "queue restored"
        );
        Ok(recovered)
    }

    pub fn subscribe(&mut self) -> Receiver<TaskUpdate> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.push(tx);
        rx
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.store.get(id)
    }

    /// All tasks in enqueue order.
    pub fn tasks(&self) -> Vec<Task> {
        self.store.iter().cloned().collect()
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    pub fn concurrency_limit(&self) -> usize {
        self.scheduler.concurrency_limit()
    }

    pub fn is_queue_paused(&self) -> bool {
        self.scheduler.is_queue_paused()
    }

    pub fn live_process_count(&self) -> usize {
        self.controller.live_count()
    }

    pub fn has_process(&self, id: &TaskId) -> bool {
        self.controller.has_process(id)
    }

    pub fn is_awake_held(&self) -> bool {
        self.power.is_held()
    }

    pub fn enqueue(&mut self, url: &str, options: DownloadOptions, now_ms: i64) -> Result<TaskId> {
        self.enqueue_inner(url, options, None, now_ms)
    }

    /// Schedules a download; a time at or before `now_ms` queues it directly.
    pub fn enqueue_at(
        &mut self,
        url: &str,
        options: DownloadOptions,
        at_ms: i64,
        now_ms: i64,
    ) -> Result<TaskId> {
        self.enqueue_inner(url, options, Some(at_ms), now_ms)
    }

    fn enqueue_inner(
        &mut self,
        url: &str,
        options: DownloadOptions,
        at_ms: Option<i64>,
        now_ms: i64,
    ) -> Result<TaskId> {
        let url = ytdlp::normalize_url(url)?;
        let mut task = Task::new(TaskId::generate(), url, options, at_ms, now_ms);
        let message = match task.scheduled_at_ms {
            Some(at) => format!("Scheduled for {at}"),
            None => "Queued".to_string(),
        };
        task.push_log(
            LogLevel::Info,
            LogSource::Engine,
            message,
            now_ms,
            self.controller.log_cap(),
        );
        let id = self.store.insert(task);
        tracing::info!(task_id = %id, scheduled_at_ms = ?at_ms, "download enqueued");
        self.commit(&[id.clone()], now_ms);
        Ok(id)
    }

    pub fn pause(&mut self, id: &TaskId, now_ms: i64) -> Result<()> {
        let task = self.store.require_mut(id)?;
        self.controller.pause(task, now_ms)?;
        self.commit(&[id.clone()], now_ms);
        Ok(())
    }

    /// Resumes in place when the process is still held; otherwise the task
    /// goes back to `pending` and restarts from its partial file.
    pub fn resume(&mut self, id: &TaskId, now_ms: i64) -> Result<()> {
        let task = self.store.require_mut(id)?;
        if self.controller.has_process(id) {
            self.controller.resume(task, now_ms)?;
        } else {
            self.controller.requeue_paused(task, now_ms)?;
        }
        self.commit(&[id.clone()], now_ms);
        Ok(())
    }

    /// Always succeeds: unknown and finished tasks are left as they are.
    pub fn stop(&mut self, id: &TaskId, now_ms: i64) -> Result<()> {
        let Some(task) = self.store.get_mut(id) else {
            return Ok(());
        };
        match self.controller.stop(task, now_ms) {
            Ok(true) => self.commit(&[id.clone()], now_ms),
            Ok(false) => {}
            Err(err) => tracing::warn!(task_id = %id, error = %err, "stop could not update task"),
        }
        Ok(())
    }

    pub fn retry(&mut self, id: &TaskId, now_ms: i64) -> Result<()> {
        let task = self.store.require_mut(id)?;
        self.controller.retry(task, now_ms)?;
        self.commit(&[id.clone()], now_ms);
        Ok(())
    }

    pub fn clear(&mut self, id: &TaskId) -> Result<()> {
        self.store.clear(id)?;
        self.dirty.remove(id);
        self.repo.delete_many([id])?;
        self.publish_removed(id);
        Ok(())
    }

    /// Stops every task that is not finished. Returns how many changed.
    pub fn stop_all(&mut self, now_ms: i64) -> usize {
        let targets: Vec<TaskId> = self
            .store
            .iter()
            .filter(|t| !t.status.is_finished())
            .map(|t| t.id.clone())
            .collect();

        let mut stopped = Vec::new();
        for id in targets {
            let Some(task) = self.store.get_mut(&id) else {
                continue;
            };
            match self.controller.stop(task, now_ms) {
                Ok(true) => stopped.push(id),
                Ok(false) => {}
                Err(err) => tracing::warn!(task_id = %id, error = %err, "stop_all could not stop task"),
            }
        }
        self.commit(&stopped, now_ms);
        stopped.len()
    }

    pub fn set_concurrency_limit(&mut self, limit: usize) -> Result<usize> {
        let limit = self.scheduler.set_concurrency_limit(limit);
        self.repo.set_max_concurrency(limit)?;
        tracing::info!(limit, "concurrency limit changed");
        Ok(limit)
    }

    /// Holds admission of pending tasks; running tasks are unaffected.
    pub fn set_queue_paused(&mut self, paused: bool) -> Result<()> {
        self.scheduler.set_queue_paused(paused);
        self.repo.set_queue_paused(paused)?;
        tracing::info!(paused, "queue admission toggled");
        Ok(())
    }

    pub fn tick(&mut self, now_ms: i64) -> TickReport {
        let report = self
            .scheduler
            .tick(&mut self.store, &mut self.controller, now_ms);
        let touched: Vec<TaskId> = report.touched().cloned().collect();
        self.commit(&touched, now_ms);

        let pruned = self.store.prune_history(
            now_ms,
            self.settings.history_retention_days,
            self.settings.max_history_items,
        );
        if !pruned.is_empty() {
            for id in &pruned {
                self.dirty.remove(id);
                self.publish_removed(id);
            }
            if let Err(err) = self.repo.delete_many(&pruned) {
                tracing::warn!(error = %err, "failed to delete pruned tasks");
            }
            tracing::debug!(count = pruned.len(), "pruned finished tasks from history");
        }

        self.flush_due(now_ms);
        report
    }

    /// Applies one event from a process. Events from runs the engine no
    /// longer tracks are dropped. Returns true when a slot was freed.
    pub fn on_process_message(&mut self, message: ProcessMessage, now_ms: i64) -> bool {
        let ProcessMessage {
            task_id,
            run_id,
            event,
        } = message;

        if !self.controller.is_current_run(&task_id, run_id) {
            tracing::debug!(task_id = %task_id, run_id, "dropping event from stale run");
            return false;
        }
        let log_cap = self.controller.log_cap();
        let Some(task) = self.store.get_mut(&task_id) else {
            self.controller.release_run(&task_id, run_id);
            return true;
        };

        let before = task.status;
        let outcome = apply_event(task, event, now_ms, log_cap);
        let status_changed = task.status != before;
        if status_changed {
            tracing::info!(task_id = %task_id, from = %before, to = %task.status, "task status changed");
        }

        let released = outcome == EventOutcome::Released && self.controller.release_run(&task_id, run_id);
        if outcome == EventOutcome::Ignored {
            return released;
        }

        if status_changed || released {
            self.commit(&[task_id], now_ms);
        } else {
            self.dirty.insert(task_id.clone());
            self.publish_changed(&task_id);
            self.flush_due(now_ms);
        }
        released
    }

    /// Writes every pending change.
    pub fn flush(&mut self, now_ms: i64) -> Result<()> {
        if self.dirty.is_empty() {
            self.last_flush_ms = now_ms;
            return Ok(());
        }
        // Ids stay dirty until the write commits, so a failed flush is retried.
        let ids: Vec<TaskId> = self.dirty.iter().cloned().collect();
        let tasks: Vec<&Task> = ids.iter().filter_map(|id| self.store.get(id)).collect();
        let written = self.repo.upsert_many(tasks)?;
        for id in &ids {
            self.dirty.remove(id);
        }
        self.last_flush_ms = now_ms;
        tracing::debug!(written, "flushed task changes");
        Ok(())
    }

    /// Flushes debounced changes if the debounce window has passed.
    pub fn flush_due(&mut self, now_ms: i64) {
        if self.dirty.is_empty() {
            return;
        }
        let debounce = self.settings.persist_debounce_ms as i64;
        if now_ms - self.last_flush_ms < debounce {
            return;
        }
        if let Err(err) = self.flush(now_ms) {
            tracing::warn!(error = %err, "failed to persist task changes");
        }
    }

    /// Terminates live processes, marks their tasks paused so they resume by
    /// restarting next time, flushes and releases sleep inhibition.
    pub fn shutdown(&mut self, now_ms: i64) {
        let terminated = self.controller.terminate_all();
        let log_cap = self.controller.log_cap();
        let interrupted: Vec<TaskId> = self
            .store
            .iter()
            .filter(|t| t.status.is_active() || t.status == TaskStatus::Paused)
            .map(|t| t.id.clone())
            .collect();
        for id in &interrupted {
            let Some(task) = self.store.get_mut(id) else {
                continue;
            };
            if task.status.is_active() && task.transition(TaskStatus::Paused, "shutdown", now_ms).is_err() {
                continue;
            }
            task.reset_transfer_stats();
            task.push_log(
                LogLevel::Warning,
                LogSource::Engine,
                "Interrupted by shutdown; resume to continue",
                now_ms,
                log_cap,
            );
            self.dirty.insert(id.clone());
        }
        for id in &interrupted {
            self.publish_changed(id);
        }
        if let Err(err) = self.flush(now_ms) {
            tracing::warn!(error = %err, "failed to persist tasks on shutdown");
        }
        self.power.release();
        tracing::info!(
            terminated = terminated.len(),
            interrupted = interrupted.len(),
            "engine shut down"
        );
    }

    /// Structural change: persist now, notify, and re-evaluate power.
    fn commit(&mut self, ids: &[TaskId], now_ms: i64) {
        if ids.is_empty() {
            return;
        }
        for id in ids {
            self.dirty.insert(id.clone());
            self.publish_changed(id);
        }
        if let Err(err) = self.flush(now_ms) {
            tracing::warn!(error = %err, "failed to persist task changes");
        }
        self.refresh_power();
    }

    fn persist_now(&mut self, ids: &[TaskId]) {
        let tasks: Vec<&Task> = ids.iter().filter_map(|id| self.store.get(id)).collect();
        if tasks.is_empty() {
            return;
        }
        if let Err(err) = self.repo.upsert_many(tasks) {
            tracing::warn!(error = %err, "failed to persist recovered tasks");
        }
    }

    fn refresh_power(&mut self) {
        self.power.update(wants_awake(&self.store));
    }

    fn publish_changed(&mut self, id: &TaskId) {
        let Some(task) = self.store.get(id) else {
            return;
        };
        let update = TaskUpdate::Changed(task.clone());
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }

    fn publish_removed(&mut self, id: &TaskId) {
        let update = TaskUpdate::Removed(id.clone());
        self.subscribers.retain(|tx| tx.send(update.clone()).is_ok());
    }
}
