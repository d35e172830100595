use std::path::PathBuf;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;

use mediaqueue_engine::engine::TaskUpdate;
use mediaqueue_engine::options::DownloadOptions;
use mediaqueue_engine::paths::AppPaths;
use mediaqueue_engine::runtime::{self, EngineHandle};
use mediaqueue_engine::task::{Task, TaskStatus};
use mediaqueue_engine::EngineError;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), String> {
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|a| a == "-h" || a == "--help") {
        print_help();
        return Ok(());
    }

    let mut base_dir: Option<PathBuf> = None;
    let mut options = DownloadOptions::default();
    let mut concurrency: Option<usize> = None;
    let mut delay_secs: Option<u64> = None;
    let mut list_only = false;
    let mut resume_paused = false;
    let mut download_dir: Option<PathBuf> = None;
    let mut reset_download_dir = false;
    let mut urls: Vec<String> = Vec::new();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--base-dir" => {
                base_dir = Some(PathBuf::from(value_of(&args, &mut i, "--base-dir")?));
            }
            "--output-dir" => {
                options.output_dir = Some(value_of(&args, &mut i, "--output-dir")?);
            }
            "--format" => options.format = Some(value_of(&args, &mut i, "--format")?),
            "--audio" => {
                options.format = Some("audio".to_string());
                options.audio_format = Some(value_of(&args, &mut i, "--audio")?);
            }
            "--container" => options.container = Some(value_of(&args, &mut i, "--container")?),
            "--start" => options.range_start = Some(value_of(&args, &mut i, "--start")?),
            "--end" => options.range_end = Some(value_of(&args, &mut i, "--end")?),
            "--subs" => {
                options.subtitles = true;
                options.subtitle_lang = Some(value_of(&args, &mut i, "--subs")?);
            }
            "--embed-metadata" => options.embed_metadata = true,
            "--rate-limit" => options.rate_limit = Some(value_of(&args, &mut i, "--rate-limit")?),
            "--concurrency" => {
                let v = value_of(&args, &mut i, "--concurrency")?;
                concurrency = Some(
                    v.parse::<usize>()
                        .map_err(|_| format!("--concurrency expects a number, got {v}"))?,
                );
            }
            "--in" => {
                let v = value_of(&args, &mut i, "--in")?;
                delay_secs = Some(
                    v.parse::<u64>()
                        .map_err(|_| format!("--in expects seconds, got {v}"))?,
                );
            }
            "--download-dir" => {
                download_dir = Some(PathBuf::from(value_of(&args, &mut i, "--download-dir")?));
            }
            "--reset-download-dir" => reset_download_dir = true,
            "--list" => list_only = true,
            "--resume-paused" => resume_paused = true,
            other if other.starts_with("--") => {
                return Err(format!("unknown arg: {other} (try --help)"));
            }
            url => urls.push(url.to_string()),
        }
        i += 1;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let base_dir = base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    if reset_download_dir {
        paths
            .clear_download_dir_override()
            .map_err(|e| format!("failed to reset download dir: {e}"))?;
    }
    if let Some(dir) = download_dir.as_deref() {
        paths
            .set_download_dir_override(dir)
            .map_err(|e| format!("failed to set download dir: {e}"))?;
        println!("Download dir: {}", dir.to_string_lossy());
    }
    let engine = runtime::start_runtime(paths).map_err(|e| e.to_string())?;

    let result = run(
        &engine,
        &urls,
        options,
        concurrency,
        delay_secs,
        list_only,
        resume_paused,
    );
    engine.shutdown().map_err(|e| e.to_string())?;
    result
}

fn run(
    engine: &EngineHandle,
    urls: &[String],
    options: DownloadOptions,
    concurrency: Option<usize>,
    delay_secs: Option<u64>,
    list_only: bool,
    resume_paused: bool,
) -> Result<(), String> {
    if list_only {
        for task in engine.tasks().map_err(|e| e.to_string())? {
            print_task(&task);
        }
        return Ok(());
    }

    if let Some(limit) = concurrency {
        let applied = engine
            .set_concurrency_limit(limit)
            .map_err(|e| e.to_string())?;
        println!("Concurrency limit: {applied}");
    }

    let updates = engine.subscribe().map_err(|e| e.to_string())?;

    if resume_paused {
        for task in engine.tasks().map_err(|e| e.to_string())? {
            if task.status == TaskStatus::Paused {
                engine.resume(&task.id).map_err(|e| e.to_string())?;
            }
        }
    }

    let mut queued = Vec::new();
    for url in urls {
        let id = match delay_secs {
            Some(secs) => engine.enqueue_at(
                url,
                options.clone(),
                runtime::now_ms() + (secs as i64) * 1000,
            ),
            None => engine.enqueue(url, options.clone()),
        }
        .map_err(|e| e.to_string())?;
        println!("Queued {id} {url}");
        queued.push(id);
    }

    loop {
        match updates.recv_timeout(Duration::from_secs(1)) {
            Ok(TaskUpdate::Changed(task)) => print_task(&task),
            Ok(TaskUpdate::Removed(id)) => println!("{id} removed"),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        let tasks = engine.tasks().map_err(|e| e.to_string())?;
        let busy = tasks
            .iter()
            .any(|t| !t.status.is_finished() && t.status != TaskStatus::Paused);
        if !busy {
            break;
        }
    }

    let failed = engine
        .tasks()
        .map_err(|e| e.to_string())?
        .iter()
        .filter(|t| queued.contains(&t.id))
        .filter(|t| matches!(t.outcome(), Err(err) if !matches!(err, EngineError::Cancelled(_))))
        .count();
    if failed > 0 {
        return Err(format!("{failed} download(s) failed"));
    }
    Ok(())
}

fn value_of(args: &[String], i: &mut usize, flag: &str) -> Result<String, String> {
    *i += 1;
    args.get(*i)
        .cloned()
        .ok_or_else(|| format!("{flag} requires a value"))
}

fn print_task(task: &Task) {
    let label = task.title.as_deref().unwrap_or(&task.url);
    match task.status {
        TaskStatus::Completed => println!(
            "{} completed {}",
            task.id,
            task.file_path.as_deref().unwrap_or(label)
        ),
        TaskStatus::Error => println!(
            "{} error: {}",
            task.id,
            task.error_message.as_deref().unwrap_or("unknown error")
        ),
        status => println!(
            "{} {:<13} {:>5.1}% {:>12} eta {:>8}  {}",
            task.id, status, task.progress, task.speed, task.eta, label
        ),
    }
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("MEDIAQUEUE_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("mediaqueue"));
            }
        }
    }

    std::env::var("HOME")
        .ok()
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .map(|h| PathBuf::from(h).join(".local").join("share").join("mediaqueue"))
}

fn print_help() {
    println!(
        r#"mediaqueue

Queues media downloads through yt-dlp and runs them until the queue drains.

Usage:
  mediaqueue https://example.com/watch?v=abc
  mediaqueue --audio mp3 --concurrency 2 <url> <url>
  mediaqueue --in 3600 <url>
  mediaqueue --list

Options:
  --base-dir <path>     Override base dir (default: $MEDIAQUEUE_BASE_DIR, then the platform data dir)
  --output-dir <path>   Download directory for these URLs
  --download-dir <path> Set the default download directory (persisted)
  --reset-download-dir  Go back to <base-dir>/downloads
  --format <fmt>        best (default), audio, or a raw yt-dlp format selector
  --audio <codec>       Extract audio (mp3, m4a, flac, wav, opus, aac)
  --container <ext>     Merge into mp4, mkv or webm
  --start <time>        Clip start (HH:MM:SS, MM:SS or seconds)
  --end <time>          Clip end
  --subs <lang>         Download subtitles (a language code or "all")
  --embed-metadata      Embed metadata into the output file
  --rate-limit <rate>   Bandwidth cap, e.g. 2M
  --concurrency <n>     Maximum simultaneous downloads (1-16, persisted)
  --in <secs>           Schedule the URLs this many seconds from now
  --resume-paused       Resume downloads interrupted by a previous run
  --list                Print the stored queue and exit

Set RUST_LOG (e.g. RUST_LOG=mediaqueue_engine=debug) for diagnostics.
"#
    );
}
