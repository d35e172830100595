use crate::task::{LogLevel, LogSource, TaskId, TaskStatus, TaskStore};

/// After a restart no process survives. Tasks that were running, or paused
/// with a frozen process, come back paused so the user decides when to
/// continue. Returns the tasks that were touched.
pub fn recover_interrupted(store: &mut TaskStore, now_ms: i64, log_cap: usize) -> Vec<TaskId> {
    let interrupted: Vec<TaskId> = store
        .iter()
        .filter(|t| t.status.is_active() || t.status == TaskStatus::Paused)
        .map(|t| t.id.clone())
        .collect();

    for id in &interrupted {
        let Some(task) = store.get_mut(id) else {
            continue;
        };
        if task.status.is_active() {
            if let Err(err) = task.transition(TaskStatus::Paused, "recover", now_ms) {
                tracing::warn!(task_id = %id, error = %err, "could not recover task");
                continue;
            }
        }
        task.reset_transfer_stats();
        task.push_log(
            LogLevel::Warning,
            LogSource::Recovery,
            "Interrupted by restart; resume to continue",
            now_ms,
            log_cap,
        );
    }

    if !interrupted.is_empty() {
        tracing::info!(count = interrupted.len(), "recovered interrupted downloads as paused");
    }
    interrupted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::DownloadOptions;
    use crate::task::{Task, STAT_SENTINEL};

    fn add(store: &mut TaskStore, status: TaskStatus) -> TaskId {
        let mut task = Task::new(
            TaskId::generate(),
            "https://example.com/v".to_string(),
            DownloadOptions::default(),
            None,
            0,
        );
        task.status = status;
        task.speed = "2.00 MiB/s".to_string();
        task.progress = 42.0;
        store.insert(task)
    }

    #[test]
    fn running_and_paused_come_back_paused_others_untouched() {
        let mut store = TaskStore::new();
        let downloading = add(&mut store, TaskStatus::Downloading);
        let processing = add(&mut store, TaskStatus::Processing);
        let paused = add(&mut store, TaskStatus::Paused);
        let pending = add(&mut store, TaskStatus::Pending);
        let done = add(&mut store, TaskStatus::Completed);

        let touched = recover_interrupted(&mut store, 5, 10);
        assert_eq!(touched, vec![downloading.clone(), processing, paused]);

        let task = store.get(&downloading).expect("task");
        assert_eq!(task.status, TaskStatus::Paused);
        assert_eq!(task.speed, STAT_SENTINEL);
        assert_eq!(task.progress, 42.0);
        assert_eq!(task.log_entries.len(), 1);

        assert_eq!(store.get(&pending).map(|t| t.status), Some(TaskStatus::Pending));
        assert_eq!(store.get(&done).map(|t| t.status), Some(TaskStatus::Completed));
        assert!(!store.any(|t| t.status.is_active()));
    }
}
