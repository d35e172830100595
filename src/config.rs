use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_CONCURRENCY_LIMIT: usize = 3;
pub const MAX_CONCURRENCY_LIMIT: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub concurrency_limit: usize,
    pub tick_interval_ms: u64,
    /// Time between the polite terminate signal and the force kill on stop.
    pub stop_grace_ms: u64,
    /// Pre-flight threshold; 0 disables the disk check.
    pub min_free_space_bytes: u64,
    /// Consecutive pre-flight failures before a pending task is failed.
    pub max_space_failures: u32,
    pub max_log_entries: usize,
    pub prevent_sleep: bool,
    /// 0 keeps finished tasks forever.
    pub history_retention_days: u32,
    /// 0 disables the cap.
    pub max_history_items: usize,
    pub persist_debounce_ms: u64,
    pub yt_dlp_path: Option<String>,
    pub ffmpeg_path: Option<String>,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            concurrency_limit: DEFAULT_CONCURRENCY_LIMIT,
            tick_interval_ms: 10_000,
            stop_grace_ms: 3_000,
            min_free_space_bytes: 512 * 1024 * 1024,
            max_space_failures: 5,
            max_log_entries: 200,
            prevent_sleep: true,
            history_retention_days: 30,
            max_history_items: 100,
            persist_debounce_ms: 1_000,
            yt_dlp_path: None,
            ffmpeg_path: None,
        }
    }
}

impl QueueSettings {
    pub fn normalized(mut self) -> Self {
        self.concurrency_limit = clamp_concurrency(self.concurrency_limit);
        self.tick_interval_ms = self.tick_interval_ms.max(100);
        self.max_log_entries = self.max_log_entries.max(1);
        self.max_space_failures = self.max_space_failures.max(1);
        self.yt_dlp_path = non_empty(self.yt_dlp_path);
        self.ffmpeg_path = non_empty(self.ffmpeg_path);
        self
    }
}

pub fn clamp_concurrency(value: usize) -> usize {
    value.clamp(1, MAX_CONCURRENCY_LIMIT)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn load_queue_settings(paths: &AppPaths) -> Result<QueueSettings> {
    let path = paths.queue_settings_path();
    if !path.exists() {
        return Ok(QueueSettings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: QueueSettings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::Config(format!(
            "failed to parse queue settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed.normalized())
}

pub fn save_queue_settings(paths: &AppPaths, settings: &QueueSettings) -> Result<()> {
    let path = paths.queue_settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}
