use crate::config::QueueSettings;
use crate::disk::DiskSpaceProbe;
use crate::process::{BackendCapabilities, EventSink, ProcessBackend};
use crate::registry::ProcessRegistry;
use crate::task::{LogLevel, LogSource, Task, TaskId, TaskStatus};
use crate::ytdlp::{self, ToolPaths};
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub stop_grace: Duration,
    pub min_free_space_bytes: u64,
    pub max_space_failures: u32,
    pub log_cap: usize,
    pub download_dir: PathBuf,
    pub tools: ToolPaths,
}

impl ControllerConfig {
    pub fn from_settings(settings: &QueueSettings, download_dir: PathBuf, tools: ToolPaths) -> Self {
        Self {
            stop_grace: Duration::from_millis(settings.stop_grace_ms),
            min_free_space_bytes: settings.min_free_space_bytes,
            max_space_failures: settings.max_space_failures.max(1),
            log_cap: settings.max_log_entries.max(1),
            download_dir,
            tools,
        }
    }
}

pub struct ProcessController {
    backend: Box<dyn ProcessBackend>,
    disk: Box<dyn DiskSpaceProbe>,
    registry: ProcessRegistry,
    sink: EventSink,
    config: ControllerConfig,
}

impl ProcessController {
    pub fn new(
        backend: Box<dyn ProcessBackend>,
        disk: Box<dyn DiskSpaceProbe>,
        sink: EventSink,
        config: ControllerConfig,
    ) -> Self {
        Self {
            backend,
            disk,
            registry: ProcessRegistry::new(),
            sink,
            config,
        }
    }

    pub fn capabilities(&self) -> BackendCapabilities {
        self.backend.capabilities()
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn log_cap(&self) -> usize {
        self.config.log_cap
    }

    /// Number of live handles, suspended ones included.
    pub fn live_count(&self) -> usize {
        self.registry.len()
    }

    pub fn has_process(&self, id: &TaskId) -> bool {
        self.registry.contains(id)
    }

    pub fn is_current_run(&self, id: &TaskId, run_id: u64) -> bool {
        self.registry.is_current(id, run_id)
    }

    /// Forgets the handle of a run that has exited.
    pub fn release_run(&mut self, id: &TaskId, run_id: u64) -> bool {
        self.registry.release(id, run_id)
    }

    /// Spawns the downloader for a pending task.
    ///
    /// A failed disk pre-flight leaves the task pending (or fails it once
    /// `max_space_failures` is reached) and returns `InsufficientSpace`.
    pub fn start(&mut self, task: &mut Task, now_ms: i64) -> Result<()> {
        if task.status != TaskStatus::Pending {
            return Err(EngineError::InvalidTransition {
                id: task.id.to_string(),
                action: "start",
                status: task.status,
            });
        }
        if self.registry.contains(&task.id) {
            return Err(EngineError::AlreadyRunning(task.id.to_string()));
        }

        let output_dir = task
            .options
            .output_dir
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.download_dir.clone());
        if let Err(err) = std::fs::create_dir_all(&output_dir) {
            let err = EngineError::Spawn {
                tool: "yt-dlp".to_string(),
                reason: format!(
                    "cannot create output directory {}: {err}",
                    output_dir.to_string_lossy()
                ),
            };
            return self.fail_start(task, err, now_ms);
        }

        self.check_free_space(task, &output_dir, now_ms)?;

        let spec = match ytdlp::build_invocation(&task.url, &task.options, &output_dir, &self.config.tools) {
            Ok(spec) => spec,
            Err(err) => return self.fail_start(task, err, now_ms),
        };

        let run_id = self.registry.allocate_run_id();
        task.attempts += 1;
        let handle = match self
            .backend
            .spawn(&task.id, run_id, &spec, self.sink.clone())
        {
            Ok(handle) => handle,
            Err(err) => return self.fail_start(task, err, now_ms),
        };

        task.transition(TaskStatus::FetchingInfo, "start", now_ms)?;
        self.registry.insert(task.id.clone(), run_id, handle)?;
        task.started_at_ms = Some(now_ms);
        task.space_failures = 0;
        task.error_message = None;
        task.reset_transfer_stats();
        task.push_log(
            LogLevel::Info,
            LogSource::Controller,
            format!("Started {} (attempt {})", spec.tool_name(), task.attempts),
            now_ms,
            self.config.log_cap,
        );
        tracing::info!(
            task_id = %task.id,
            run_id,
            attempt = task.attempts,
            url = %ytdlp::redact_url_for_log(&task.url),
            "download started"
        );
        Ok(())
    }

    fn check_free_space(&mut self, task: &mut Task, dir: &Path, now_ms: i64) -> Result<()> {
        let required = self.config.min_free_space_bytes;
        if required == 0 {
            return Ok(());
        }
        let Some(available) = self.disk.available_bytes(dir) else {
            return Ok(());
        };
        if available >= required {
            return Ok(());
        }

        task.space_failures += 1;
        let err = EngineError::InsufficientSpace {
            path: dir.to_path_buf(),
            available,
            required,
        };
        let max = self.config.max_space_failures;
        if task.space_failures >= max {
            task.transition(TaskStatus::Error, "start", now_ms)?;
            task.error_message = Some(err.to_string());
            task.push_log(
                LogLevel::Error,
                LogSource::Controller,
                format!("{err}; giving up after {max} checks"),
                now_ms,
                self.config.log_cap,
            );
            tracing::warn!(task_id = %task.id, available, required, "insufficient space; task failed");
        } else {
            task.push_log(
                LogLevel::Warning,
                LogSource::Controller,
                format!("{err}; will check again ({}/{max})", task.space_failures),
                now_ms,
                self.config.log_cap,
            );
            tracing::warn!(task_id = %task.id, available, required, "insufficient space; start deferred");
        }
        Err(err)
    }

    fn fail_start(&mut self, task: &mut Task, err: EngineError, now_ms: i64) -> Result<()> {
        task.transition(TaskStatus::Error, "start", now_ms)?;
        task.error_message = Some(err.to_string());
        task.push_log(
            LogLevel::Error,
            LogSource::Controller,
            err.to_string(),
            now_ms,
            self.config.log_cap,
        );
        tracing::warn!(task_id = %task.id, error = %err, "download failed to start");
        Err(err)
    }

    /// Freezes a downloading or processing task. Without in-place suspend the
    /// process is killed and the task resumes by restarting.
    pub fn pause(&mut self, task: &mut Task, now_ms: i64) -> Result<()> {
        if task.status == TaskStatus::FetchingInfo {
            return Err(EngineError::InvalidTransition {
                id: task.id.to_string(),
                action: "pause",
                status: task.status,
            });
        }
        if !task.status.is_active() || !self.registry.contains(&task.id) {
            return Err(EngineError::NotRunning(task.id.to_string()));
        }

        let message = if self.backend.capabilities().suspend_in_place {
            let entry = self
                .registry
                .get_mut(&task.id)
                .ok_or_else(|| EngineError::NotRunning(task.id.to_string()))?;
            entry.handle.suspend()?;
            entry.suspended = true;
            "Paused"
        } else {
            if let Some(mut entry) = self.registry.remove(&task.id) {
                if let Err(err) = entry.handle.terminate(Duration::ZERO) {
                    tracing::warn!(task_id = %task.id, error = %err, "failed to stop process for pause");
                }
            }
            "Paused; the download restarts from its partial file on resume"
        };

        task.transition(TaskStatus::Paused, "pause", now_ms)?;
        task.reset_transfer_stats();
        task.push_log(
            LogLevel::Info,
            LogSource::Controller,
            message,
            now_ms,
            self.config.log_cap,
        );
        tracing::info!(task_id = %task.id, "download paused");
        Ok(())
    }

    /// Continues a task frozen in place.
    pub fn resume(&mut self, task: &mut Task, now_ms: i64) -> Result<()> {
        if task.status != TaskStatus::Paused {
            return Err(EngineError::NotPaused(task.id.to_string()));
        }
        let entry = self
            .registry
            .get_mut(&task.id)
            .ok_or_else(|| EngineError::NotPaused(task.id.to_string()))?;
        entry.handle.resume()?;
        entry.suspended = false;

        task.transition(TaskStatus::Downloading, "resume", now_ms)?;
        task.push_log(
            LogLevel::Info,
            LogSource::Controller,
            "Resumed",
            now_ms,
            self.config.log_cap,
        );
        tracing::info!(task_id = %task.id, "download resumed");
        Ok(())
    }

    /// Sends a paused task without a process back to the queue.
    pub fn requeue_paused(&mut self, task: &mut Task, now_ms: i64) -> Result<()> {
        if task.status != TaskStatus::Paused {
            return Err(EngineError::NotPaused(task.id.to_string()));
        }
        if self.registry.contains(&task.id) {
            return Err(EngineError::AlreadyRunning(task.id.to_string()));
        }
        task.transition(TaskStatus::Pending, "resume", now_ms)?;
        task.reset_transfer_stats();
        task.push_log(
            LogLevel::Info,
            LogSource::Controller,
            "Resuming by restarting the download",
            now_ms,
            self.config.log_cap,
        );
        Ok(())
    }

    /// Ends a task. Finished tasks are left alone. Returns whether anything
    /// changed.
    pub fn stop(&mut self, task: &mut Task, now_ms: i64) -> Result<bool> {
        if task.status.is_finished() {
            return Ok(false);
        }

        if let Some(mut entry) = self.registry.remove(&task.id) {
            if let Err(err) = entry.handle.terminate(self.config.stop_grace) {
                tracing::warn!(task_id = %task.id, error = %err, "failed to signal process on stop");
            }
        }

        task.transition(TaskStatus::Stopped, "stop", now_ms)?;
        task.reset_transfer_stats();
        task.push_log(
            LogLevel::Warning,
            LogSource::Controller,
            "Stopped",
            now_ms,
            self.config.log_cap,
        );
        tracing::info!(task_id = %task.id, "download stopped");
        Ok(true)
    }

    /// Re-queues a failed or stopped task with its original options.
    pub fn retry(&mut self, task: &mut Task, now_ms: i64) -> Result<()> {
        if !matches!(task.status, TaskStatus::Error | TaskStatus::Stopped) {
            return Err(EngineError::InvalidTransition {
                id: task.id.to_string(),
                action: "retry",
                status: task.status,
            });
        }
        if let Some(mut entry) = self.registry.remove(&task.id) {
            if let Err(err) = entry.handle.terminate(Duration::ZERO) {
                tracing::warn!(task_id = %task.id, error = %err, "failed to kill leftover process on retry");
            }
        }
        task.transition(TaskStatus::Pending, "retry", now_ms)?;
        task.reset_for_rerun();
        task.push_log(
            LogLevel::Info,
            LogSource::Controller,
            "Queued for retry",
            now_ms,
            self.config.log_cap,
        );
        tracing::info!(task_id = %task.id, "download queued for retry");
        Ok(())
    }

    /// Terminates every live process. Used on shutdown.
    pub fn terminate_all(&mut self) -> Vec<TaskId> {
        let grace = self.config.stop_grace;
        self.registry
            .drain()
            .into_iter()
            .map(|(id, mut entry)| {
                if let Err(err) = entry.handle.terminate(grace) {
                    tracing::warn!(task_id = %id, error = %err, "failed to terminate process");
                }
                id
            })
            .collect()
    }
}
