pub mod cmd;
pub mod config;
pub mod controller;
pub mod db;
pub mod disk;
pub mod engine;
mod error;
pub mod events;
pub mod options;
pub mod paths;
pub mod power;
pub mod process;
pub mod recovery;
pub mod registry;
pub mod repository;
pub mod runtime;
pub mod scheduler;
pub mod task;
pub mod ytdlp;

pub use error::{EngineError, Result};
