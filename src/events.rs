use crate::task::{LogLevel, LogSource, Task, TaskStatus, STAT_SENTINEL};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::OnceLock;

pub const DOWNLOAD_PREFIX: &str = "MQ_DL;";
pub const POSTPROCESS_PREFIX: &str = "MQ_PP;";
pub const TITLE_PREFIX: &str = "MQ_TITLE;";
pub const FILE_PREFIX: &str = "MQ_FILE;";

/// Share of the bar given to the transfer when a post-processing pass follows.
const DOWNLOAD_SHARE: f64 = 0.8;
const POSTPROCESS_PERCENT: f64 = 90.0;
const STDERR_TAIL_LINES: usize = 20;
const CLIP_PROGRESS_STEP: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Downloading,
    Processing,
}

/// The closed set of messages a running process can report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Started {
        title: Option<String>,
    },
    /// `speed`/`eta`/`total_size` of `None` keep the last known value.
    Progress {
        percent: f64,
        speed: Option<String>,
        eta: Option<String>,
        total_size: Option<String>,
        phase: ProgressPhase,
    },
    Log {
        message: String,
        level: LogLevel,
    },
    Completed {
        file_path: String,
    },
    Error {
        message: String,
    },
    Cancelled,
}

impl TaskEvent {
    /// Events after which the process is gone and its handle must be released.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            TaskEvent::Completed { .. } | TaskEvent::Error { .. } | TaskEvent::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Applied,
    /// The process has exited; the registry entry must be dropped.
    Released,
    /// Stale for the task's current state (e.g. a late `started` after stop).
    Ignored,
}

pub fn apply_event(task: &mut Task, event: TaskEvent, now_ms: i64, log_cap: usize) -> EventOutcome {
    match event {
        TaskEvent::Started { title } => {
            if !task.status.is_active() {
                return EventOutcome::Ignored;
            }
            if let Some(title) = title.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
                task.title = Some(title);
            }
            if task.status == TaskStatus::FetchingInfo
                && task
                    .transition(TaskStatus::Downloading, "start download", now_ms)
                    .is_ok()
            {
                let message = match task.title.as_deref() {
                    Some(title) => format!("Downloading \"{title}\""),
                    None => "Downloading".to_string(),
                };
                task.push_log(LogLevel::Info, LogSource::Process, message, now_ms, log_cap);
            }
            EventOutcome::Applied
        }
        TaskEvent::Progress {
            percent,
            speed,
            eta,
            total_size,
            phase,
        } => {
            if !task.status.is_active() {
                return EventOutcome::Ignored;
            }
            match phase {
                ProgressPhase::Processing if task.status != TaskStatus::Processing => {
                    if task
                        .transition(TaskStatus::Processing, "post-process", now_ms)
                        .is_ok()
                    {
                        task.push_log(
                            LogLevel::Info,
                            LogSource::Process,
                            "Post-processing",
                            now_ms,
                            log_cap,
                        );
                    }
                }
                ProgressPhase::Downloading if task.status == TaskStatus::FetchingInfo => {
                    let _ = task.transition(TaskStatus::Downloading, "start download", now_ms);
                }
                _ => {}
            }
            if percent.is_finite() {
                task.progress = task.progress.max(percent.clamp(0.0, 100.0));
            }
            if let Some(speed) = speed {
                task.speed = speed;
            }
            if let Some(eta) = eta {
                task.eta = eta;
            }
            if total_size.is_some() {
                task.total_size = total_size;
            }
            EventOutcome::Applied
        }
        TaskEvent::Log { message, level } => {
            task.push_log(level, LogSource::Process, message, now_ms, log_cap);
            EventOutcome::Applied
        }
        TaskEvent::Completed { file_path } => {
            if is_live(task.status)
                && task
                    .transition(TaskStatus::Completed, "complete", now_ms)
                    .is_ok()
            {
                task.progress = 100.0;
                task.reset_transfer_stats();
                if !file_path.trim().is_empty() {
                    task.file_path = Some(file_path);
                }
                let message = match task.file_path.as_deref() {
                    Some(path) => format!("Completed: {path}"),
                    None => "Completed".to_string(),
                };
                task.push_log(LogLevel::Info, LogSource::Process, message, now_ms, log_cap);
            }
            EventOutcome::Released
        }
        TaskEvent::Error { message } => {
            if is_live(task.status) && task.transition(TaskStatus::Error, "fail", now_ms).is_ok() {
                task.reset_transfer_stats();
                task.push_log(
                    LogLevel::Error,
                    LogSource::Process,
                    message.clone(),
                    now_ms,
                    log_cap,
                );
                task.error_message = Some(message);
            }
            EventOutcome::Released
        }
        TaskEvent::Cancelled => {
            if is_live(task.status) && task.transition(TaskStatus::Stopped, "cancel", now_ms).is_ok()
            {
                task.reset_transfer_stats();
                task.push_log(
                    LogLevel::Warning,
                    LogSource::Process,
                    "Process cancelled",
                    now_ms,
                    log_cap,
                );
            }
            EventOutcome::Released
        }
    }
}

fn is_live(status: TaskStatus) -> bool {
    status.is_active() || status == TaskStatus::Paused
}

fn ffmpeg_time_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"time=(\d+:\d+:\d+(?:\.\d+)?)").expect("valid ffmpeg time regex"))
}

fn ffmpeg_speed_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"speed=\s*([0-9.]+)x").expect("valid ffmpeg speed regex"))
}

/// Stateful decoder for one output stream of one process run.
#[derive(Debug, Clone)]
pub struct LineDecoder {
    expect_post_processing: bool,
    clip_duration_secs: Option<f64>,
    post_processing: bool,
    last_clip_percent: f64,
    file_path: Option<String>,
    error_lines: Vec<String>,
    tail: VecDeque<String>,
}

impl LineDecoder {
    pub fn new(expect_post_processing: bool, clip_duration_secs: Option<f64>) -> Self {
        Self {
            expect_post_processing,
            clip_duration_secs: clip_duration_secs.filter(|d| *d > 0.0),
            post_processing: false,
            last_clip_percent: 0.0,
            file_path: None,
            error_lines: Vec::new(),
            tail: VecDeque::with_capacity(STDERR_TAIL_LINES),
        }
    }

    /// Final media path reported by the tool, if any.
    pub fn file_path(&self) -> Option<&str> {
        self.file_path.as_deref()
    }

    /// Best error summary seen so far: `ERROR:` lines if any, otherwise the
    /// last lines of output.
    pub fn error_summary(&self) -> Option<String> {
        if !self.error_lines.is_empty() {
            return Some(self.error_lines.join("\n"));
        }
        if self.tail.is_empty() {
            return None;
        }
        Some(self.tail.iter().cloned().collect::<Vec<_>>().join("\n"))
    }

    pub fn decode_stdout(&mut self, raw: &str) -> Vec<TaskEvent> {
        let line = raw.trim();
        if line.is_empty() {
            return Vec::new();
        }

        if let Some(rest) = line.strip_prefix(DOWNLOAD_PREFIX) {
            return self.decode_download_progress(rest).into_iter().collect();
        }
        if let Some(rest) = line.strip_prefix(POSTPROCESS_PREFIX) {
            return self.decode_postprocess(rest);
        }
        if let Some(rest) = line.strip_prefix(TITLE_PREFIX) {
            let title = rest.trim();
            let title = if title.is_empty() || title == "NA" {
                None
            } else {
                Some(title.to_string())
            };
            return vec![TaskEvent::Started { title }];
        }
        if let Some(rest) = line.strip_prefix(FILE_PREFIX) {
            let path = rest.trim();
            if !path.is_empty() && path != "NA" {
                self.file_path = Some(path.to_string());
            }
            return Vec::new();
        }

        self.decode_plain(line).into_iter().collect()
    }

    pub fn decode_stderr(&mut self, raw: &str) -> Vec<TaskEvent> {
        let line = raw.trim();
        if line.is_empty() {
            return Vec::new();
        }
        if self.tail.len() >= STDERR_TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());

        if let Some(event) = self.decode_clip_progress(line) {
            return vec![event];
        }
        if line.starts_with("ERROR:") || line.starts_with("WARNING:") {
            return self.decode_plain(line).into_iter().collect();
        }
        Vec::new()
    }

    fn decode_download_progress(&mut self, rest: &str) -> Option<TaskEvent> {
        let parts: Vec<&str> = rest.split(';').collect();
        if parts.len() < 6 {
            return None;
        }
        let status = parts[0].trim();
        let downloaded = parse_number(parts[1]);
        let total = parse_number(parts[2])
            .filter(|t| *t > 0.0)
            .or_else(|| parse_number(parts[3]).filter(|t| *t > 0.0));
        let speed = parse_number(parts[4]);
        let eta = parse_number(parts[5]);

        let mut percent = match (downloaded, total) {
            (Some(done), Some(total)) => (done / total * 100.0).min(100.0),
            _ if status == "finished" => 100.0,
            _ => 0.0,
        };
        if self.expect_post_processing {
            percent *= DOWNLOAD_SHARE;
        }

        Some(TaskEvent::Progress {
            percent,
            speed: speed.map(format_speed),
            eta: eta.map(|s| format_eta(s.max(0.0) as u64)),
            total_size: total.map(format_bytes),
            phase: ProgressPhase::Downloading,
        })
    }

    fn decode_postprocess(&mut self, rest: &str) -> Vec<TaskEvent> {
        let mut parts = rest.split(';');
        let status = parts.next().unwrap_or_default().trim();
        let processor = parts.next().unwrap_or_default().trim();
        if status != "started" {
            return Vec::new();
        }
        self.post_processing = true;
        let label = match processor {
            "Merger" | "FFmpegMerger" => "Merging streams",
            "ExtractAudio" | "FFmpegExtractAudio" => "Extracting audio",
            "EmbedSubtitle" | "FFmpegEmbedSubtitle" => "Embedding subtitles",
            "VideoConvertor" | "FFmpegVideoConvertor" | "VideoRemuxer" | "FFmpegVideoRemuxer" => {
                "Converting video"
            }
            "Metadata" | "FFmpegMetadata" => "Adding metadata",
            _ => "Post-processing",
        };
        vec![
            TaskEvent::Log {
                message: format!("{label} ({processor})"),
                level: LogLevel::Info,
            },
            TaskEvent::Progress {
                percent: POSTPROCESS_PERCENT,
                speed: Some(STAT_SENTINEL.to_string()),
                eta: Some(STAT_SENTINEL.to_string()),
                total_size: None,
                phase: ProgressPhase::Processing,
            },
        ]
    }

    /// ffmpeg reports `time=` while it downloads and trims a clip in one pass.
    fn decode_clip_progress(&mut self, line: &str) -> Option<TaskEvent> {
        let duration = self.clip_duration_secs?;
        let caps = ffmpeg_time_re().captures(line)?;
        let current = crate::options::parse_time_to_seconds(caps.get(1).map(|m| m.as_str()));
        let fraction = (current / duration).min(1.0);
        let percent = (fraction * 99.0).min(99.0);
        if (percent - self.last_clip_percent).abs() <= CLIP_PROGRESS_STEP {
            return None;
        }
        self.last_clip_percent = percent;

        let speed = ffmpeg_speed_re()
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| format!("{}x", m.as_str()));
        let remaining = ((1.0 - fraction) * duration) as u64;
        Some(TaskEvent::Progress {
            percent,
            speed,
            eta: Some(format_eta(remaining)),
            total_size: None,
            phase: ProgressPhase::Downloading,
        })
    }

    fn decode_plain(&mut self, line: &str) -> Option<TaskEvent> {
        if let Some(rest) = line.strip_prefix("ERROR:") {
            let message = rest.trim().to_string();
            self.error_lines.push(message.clone());
            return Some(TaskEvent::Log {
                message,
                level: LogLevel::Error,
            });
        }
        if let Some(rest) = line.strip_prefix("WARNING:") {
            return Some(TaskEvent::Log {
                message: rest.trim().to_string(),
                level: LogLevel::Warning,
            });
        }
        Some(TaskEvent::Log {
            message: line.to_string(),
            level: LogLevel::Info,
        })
    }
}

/// yt-dlp prints `NA` (or `None`) for unknown template fields.
fn parse_number(raw: &str) -> Option<f64> {
    raw.trim().parse::<f64>().ok().filter(|v| v.is_finite())
}

pub fn format_bytes(bytes: f64) -> String {
    const KIB: f64 = 1024.0;
    const MIB: f64 = KIB * 1024.0;
    const GIB: f64 = MIB * 1024.0;
    if bytes >= GIB {
        format!("{:.2} GiB", bytes / GIB)
    } else if bytes >= MIB {
        format!("{:.2} MiB", bytes / MIB)
    } else {
        format!("{:.2} KiB", bytes / KIB)
    }
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec))
}

pub fn format_eta(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes:02}:{seconds:02}")
    }
}
