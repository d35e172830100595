use crate::task::TaskStatus;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("failed to start {tool}: {reason}")]
    Spawn { tool: String, reason: String },

    #[error("task {0} has no running process")]
    NotRunning(String),

    #[error("task {0} is not paused")]
    NotPaused(String),

    #[error("insufficient disk space in {path}: {available} bytes available, {required} required")]
    InsufficientSpace {
        path: PathBuf,
        available: u64,
        required: u64,
    },

    #[error("external tool failed: {0}")]
    Process(String),

    #[error("task {0} was cancelled")]
    Cancelled(String),

    #[error("cannot {action} task {id} while it is {status}")]
    InvalidTransition {
        id: String,
        action: &'static str,
        status: TaskStatus,
    },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("process control failed for pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },

    #[error("task {0} already has a live process")]
    AlreadyRunning(String),

    #[error("engine is not running")]
    EngineStopped,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, EngineError>;
