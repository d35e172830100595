#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::{Duration, Instant};

use mediaqueue_engine::config::{save_queue_settings, QueueSettings};
use mediaqueue_engine::options::DownloadOptions;
use mediaqueue_engine::paths::AppPaths;
use mediaqueue_engine::runtime::{start_runtime, EngineHandle};
use mediaqueue_engine::task::{Task, TaskId, TaskStatus};

const QUICK_SCRIPT: &str = r#"#!/bin/sh
echo "MQ_TITLE;Fake clip"
echo "MQ_DL;downloading;50;100;NA;25;2"
echo "MQ_DL;finished;100;100;NA;25;0"
echo "MQ_FILE;$FAKE_OUT/Fake clip.mp4"
exit 0
"#;

const SLOW_SCRIPT: &str = r#"#!/bin/sh
echo "MQ_TITLE;Slow clip"
i=0
while [ $i -lt 600 ]; do
  echo "MQ_DL;downloading;$i;1000;NA;10;60"
  i=$((i + 1))
  sleep 0.1
done
exit 0
"#;

const FAILING_SCRIPT: &str = r#"#!/bin/sh
echo "ERROR: [generic] Unsupported URL: https://media.example.com/none" >&2
exit 1
"#;

fn install_tool(base: &Path, body: &str) -> PathBuf {
    let out = base.join("out");
    std::fs::create_dir_all(&out).expect("out dir");
    let script = base.join("fake-yt-dlp");
    let body = body.replace("$FAKE_OUT", &out.to_string_lossy());
    std::fs::write(&script, body).expect("write script");
    let mut perms = std::fs::metadata(&script).expect("metadata").permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).expect("chmod");
    script
}

fn start(base: &Path, script: &Path) -> EngineHandle {
    let paths = AppPaths::new(base.to_path_buf());
    let settings = QueueSettings {
        concurrency_limit: 1,
        tick_interval_ms: 200,
        stop_grace_ms: 500,
        min_free_space_bytes: 0,
        prevent_sleep: false,
        persist_debounce_ms: 0,
        yt_dlp_path: Some(script.to_string_lossy().to_string()),
        ..QueueSettings::default()
    };
    save_queue_settings(&paths, &settings).expect("save settings");
    start_runtime(paths).expect("start runtime")
}

fn wait_for(
    engine: &EngineHandle,
    id: &TaskId,
    timeout: Duration,
    done: impl Fn(&Task) -> bool,
) -> Task {
    let started = Instant::now();
    loop {
        let task = engine
            .tasks()
            .expect("snapshot")
            .into_iter()
            .find(|t| &t.id == id)
            .expect("task exists");
        if done(&task) {
            return task;
        }
        if started.elapsed() > timeout {
            panic!("timed out waiting on task {id}; last status {}", task.status);
        }
        sleep(Duration::from_millis(50));
    }
}

#[test]
fn completes_through_the_real_process_backend() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = install_tool(dir.path(), QUICK_SCRIPT);
    let engine = start(dir.path(), &script);

    let id = engine
        .enqueue("https://media.example.com/watch?v=quick", DownloadOptions::default())
        .expect("enqueue");
    let task = wait_for(&engine, &id, Duration::from_secs(15), |t| {
        t.status.is_finished()
    });

    assert_eq!(task.status, TaskStatus::Completed, "{:?}", task.log_entries);
    assert_eq!(task.title.as_deref(), Some("Fake clip"));
    assert_eq!(task.progress, 100.0);
    assert!(task
        .file_path
        .as_deref()
        .unwrap_or_default()
        .ends_with("Fake clip.mp4"));
    engine.shutdown().expect("shutdown");
}

#[test]
fn failing_tool_reports_its_error_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = install_tool(dir.path(), FAILING_SCRIPT);
    let engine = start(dir.path(), &script);

    let id = engine
        .enqueue("https://media.example.com/none", DownloadOptions::default())
        .expect("enqueue");
    let task = wait_for(&engine, &id, Duration::from_secs(15), |t| {
        t.status.is_finished()
    });

    assert_eq!(task.status, TaskStatus::Error);
    assert!(task
        .error_message
        .as_deref()
        .unwrap_or_default()
        .contains("Unsupported URL"));
    engine.shutdown().expect("shutdown");
}

#[test]
fn pause_resume_and_stop_signal_the_real_process() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = install_tool(dir.path(), SLOW_SCRIPT);
    let engine = start(dir.path(), &script);
    let updates = engine.subscribe().expect("subscribe");

    let id = engine
        .enqueue("https://media.example.com/watch?v=slow", DownloadOptions::default())
        .expect("enqueue");
    wait_for(&engine, &id, Duration::from_secs(15), |t| {
        t.status == TaskStatus::Downloading && t.progress > 0.0
    });

    engine.pause(&id).expect("pause");
    let paused = wait_for(&engine, &id, Duration::from_secs(5), |t| {
        t.status == TaskStatus::Paused
    });
    // A stopped process prints nothing, so progress holds still.
    sleep(Duration::from_millis(500));
    let still = wait_for(&engine, &id, Duration::from_secs(5), |_| true);
    assert_eq!(still.status, TaskStatus::Paused);
    assert_eq!(still.progress, paused.progress);

    engine.resume(&id).expect("resume");
    wait_for(&engine, &id, Duration::from_secs(5), |t| {
        t.status == TaskStatus::Downloading && t.progress > paused.progress
    });

    engine.stop(&id).expect("stop");
    let stopped = wait_for(&engine, &id, Duration::from_secs(5), |t| {
        t.status.is_finished()
    });
    assert_eq!(stopped.status, TaskStatus::Stopped);

    // The exit of the killed process must not change the outcome.
    sleep(Duration::from_millis(800));
    let after = wait_for(&engine, &id, Duration::from_secs(1), |_| true);
    assert_eq!(after.status, TaskStatus::Stopped);
    assert!(updates.try_iter().count() > 0);

    engine.shutdown().expect("shutdown");
    assert!(engine.tasks().is_err());
}
