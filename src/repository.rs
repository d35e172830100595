use crate::config::clamp_concurrency;
use crate::db::{self, OptionalRowExt};
use crate::options::DownloadOptions;
use crate::paths::AppPaths;
use crate::task::{LogEntry, Task, TaskId, TaskStatus};
use crate::{EngineError, Result};
use rusqlite::{params, Connection};

const META_KEY_QUEUE_PAUSED: &str = "queue_paused";
const META_KEY_MAX_CONCURRENCY: &str = "queue_max_concurrency";

const TASK_COLUMNS: &str = "id, seq, url, status, options_json, progress, speed, eta, total_size, \
     title, error, file_path, log_json, scheduled_at_ms, created_at_ms, started_at_ms, \
     finished_at_ms, attempts, space_failures";

/// SQLite-backed task store. Owned by the engine's control thread.
pub struct TaskRepository {
    conn: Connection,
}

impl TaskRepository {
    pub fn open(paths: &AppPaths) -> Result<Self> {
        let conn = db::open(paths)?;
        db::migrate(&conn)?;
        Ok(Self { conn })
    }

    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            conn: db::open_in_memory()?,
        })
    }

    pub fn load_all(&self) -> Result<Vec<Task>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {TASK_COLUMNS} FROM task ORDER BY seq ASC"))?;
        let rows = stmt
            .query_map([], |row| {
                let id: String = row.get(0)?;
                let status_str: String = row.get(3)?;
                let options_json: String = row.get(4)?;
                let log_json: String = row.get(12)?;
                let status = TaskStatus::from_str(&status_str).unwrap_or(TaskStatus::Error);
                let options: DownloadOptions = match serde_json::from_str(&options_json) {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(task_id = %id, error = %err, "unreadable task options; using defaults");
                        DownloadOptions::default()
                    }
                };
                let log_entries: Vec<LogEntry> = serde_json::from_str(&log_json).unwrap_or_default();
                Ok(Task {
                    id: TaskId::from(id),
                    seq: row.get::<_, i64>(1)?.max(0) as u64,
                    url: row.get(2)?,
                    status,
                    options,
                    progress: row.get(5)?,
                    speed: row.get(6)?,
                    eta: row.get(7)?,
                    total_size: row.get(8)?,
                    title: row.get(9)?,
                    error_message: row.get(10)?,
                    file_path: row.get(11)?,
                    log_entries,
                    scheduled_at_ms: row.get(13)?,
                    created_at_ms: row.get(14)?,
                    started_at_ms: row.get(15)?,
                    finished_at_ms: row.get(16)?,
                    attempts: row.get::<_, i64>(17)?.max(0) as u32,
                    space_failures: row.get::<_, i64>(18)?.max(0) as u32,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Writes every task in one transaction.
    pub fn upsert_many<'a>(&mut self, tasks: impl IntoIterator<Item = &'a Task>) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut written = 0_usize;
        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO task({TASK_COLUMNS})
                 VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(id) DO UPDATE SET
                   seq=excluded.seq, url=excluded.url, status=excluded.status,
                   options_json=excluded.options_json, progress=excluded.progress,
                   speed=excluded.speed, eta=excluded.eta, total_size=excluded.total_size,
                   title=excluded.title, error=excluded.error, file_path=excluded.file_path,
                   log_json=excluded.log_json, scheduled_at_ms=excluded.scheduled_at_ms,
                   created_at_ms=excluded.created_at_ms, started_at_ms=excluded.started_at_ms,
                   finished_at_ms=excluded.finished_at_ms, attempts=excluded.attempts,
                   space_failures=excluded.space_failures"
            ))?;
            for task in tasks {
                let options_json = serde_json::to_string(&task.options)?;
                let log_json = serde_json::to_string(&task.log_entries)?;
                stmt.execute(params![
                    task.id.as_str(),
                    task.seq as i64,
                    task.url,
                    task.status.as_str(),
                    options_json,
                    task.progress,
                    task.speed,
                    task.eta,
                    task.total_size,
                    task.title,
                    task.error_message,
                    task.file_path,
                    log_json,
                    task.scheduled_at_ms,
                    task.created_at_ms,
                    task.started_at_ms,
                    task.finished_at_ms,
                    i64::from(task.attempts),
                    i64::from(task.space_failures),
                ])?;
                written += 1;
            }
        }
        tx.commit()?;
        Ok(written)
    }

    pub fn upsert(&mut self, task: &Task) -> Result<()> {
        self.upsert_many(std::iter::once(task))?;
        Ok(())
    }

    pub fn delete_many<'a>(&mut self, ids: impl IntoIterator<Item = &'a TaskId>) -> Result<usize> {
        let tx = self.conn.transaction()?;
        let mut removed = 0_usize;
        {
            let mut stmt = tx.prepare("DELETE FROM task WHERE id=?1")?;
            for id in ids {
                removed += stmt.execute([id.as_str()])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    /// `None` when no runtime override was ever stored.
    pub fn stored_max_concurrency(&self) -> Result<Option<usize>> {
        Ok(self
            .meta_value(META_KEY_MAX_CONCURRENCY)?
            .and_then(|v| v.trim().parse::<usize>().ok())
            .map(clamp_concurrency))
    }

    pub fn set_max_concurrency(&self, limit: usize) -> Result<usize> {
        let limit = clamp_concurrency(limit);
        self.set_meta_value(META_KEY_MAX_CONCURRENCY, &limit.to_string())?;
        Ok(limit)
    }

    pub fn queue_paused(&self) -> Result<bool> {
        Ok(self
            .meta_value(META_KEY_QUEUE_PAUSED)?
            .map(|v| {
                let v = v.trim();
                v == "1" || v.eq_ignore_ascii_case("true")
            })
            .unwrap_or(false))
    }

    pub fn set_queue_paused(&self, paused: bool) -> Result<()> {
        self.set_meta_value(META_KEY_QUEUE_PAUSED, if paused { "1" } else { "0" })
    }

    fn meta_value(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT value FROM meta WHERE key=?1", [key], |row| row.get(0))
            .optional()
            .map_err(EngineError::Database)
    }

    fn set_meta_value(&self, key: &str, value: &str) -> Result<()> {
        self.conn.execute(
            "INSERT INTO meta(key, value) VALUES(?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )?;
        Ok(())
    }
}
