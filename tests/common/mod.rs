#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mediaqueue_engine::config::QueueSettings;
use mediaqueue_engine::controller::{ControllerConfig, ProcessController};
use mediaqueue_engine::disk::DiskSpaceProbe;
use mediaqueue_engine::engine::QueueEngine;
use mediaqueue_engine::events::TaskEvent;
use mediaqueue_engine::options::DownloadOptions;
use mediaqueue_engine::paths::AppPaths;
use mediaqueue_engine::power::SleepInhibitor;
use mediaqueue_engine::process::{
    BackendCapabilities, EventSink, LaunchSpec, ProcessBackend, ProcessHandle, ProcessMessage,
};
use mediaqueue_engine::repository::TaskRepository;
use mediaqueue_engine::scheduler::TickReport;
use mediaqueue_engine::task::{Task, TaskId, TaskStatus};
use mediaqueue_engine::ytdlp::ToolPaths;
use mediaqueue_engine::{EngineError, Result};

pub const START_MS: i64 = 1_700_000_000_000;
pub const TICK_MS: i64 = 1_000;

struct FakeRun {
    run_id: u64,
    sink: EventSink,
    alive: bool,
}

#[derive(Default)]
struct FakeState {
    runs: HashMap<TaskId, FakeRun>,
    spawns: usize,
    calls: Vec<String>,
    failing_urls: Vec<String>,
}

/// Stands in for yt-dlp. Tests push events as the process would.
#[derive(Clone, Default)]
pub struct FakeProcesses {
    state: Arc<Mutex<FakeState>>,
    suspend_in_place: bool,
}

impl FakeProcesses {
    pub fn new(suspend_in_place: bool) -> Self {
        Self {
            state: Arc::default(),
            suspend_in_place,
        }
    }

    pub fn fail_spawn_for(&self, url: &str) {
        self.state
            .lock()
            .expect("lock")
            .failing_urls
            .push(url.to_string());
    }

    pub fn spawns(&self) -> usize {
        self.state.lock().expect("lock").spawns
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().expect("lock").calls.clone()
    }

    pub fn run_id(&self, id: &TaskId) -> Option<u64> {
        self.state
            .lock()
            .expect("lock")
            .runs
            .get(id)
            .map(|r| r.run_id)
    }

    pub fn alive(&self) -> usize {
        self.state
            .lock()
            .expect("lock")
            .runs
            .values()
            .filter(|r| r.alive)
            .count()
    }

    /// Emits through the sink of the task's latest run.
    pub fn emit(&self, id: &TaskId, event: TaskEvent) {
        let (sink, run_id) = {
            let state = self.state.lock().expect("lock");
            let run = state.runs.get(id).expect("task was never spawned");
            (run.sink.clone(), run.run_id)
        };
        sink(ProcessMessage {
            task_id: id.clone(),
            run_id,
            event,
        });
    }
}

impl ProcessBackend for FakeProcesses {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            suspend_in_place: self.suspend_in_place,
        }
    }

    fn spawn(
        &self,
        task_id: &TaskId,
        run_id: u64,
        spec: &LaunchSpec,
        sink: EventSink,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut state = self.state.lock().expect("lock");
        if let Some(url) = spec.args.last() {
            if state.failing_urls.iter().any(|f| f == url) {
                return Err(EngineError::Spawn {
                    tool: spec.tool_name(),
                    reason: "No such file or directory".to_string(),
                });
            }
        }
        state.spawns += 1;
        state.calls.push(format!("spawn {task_id}"));
        state.runs.insert(
            task_id.clone(),
            FakeRun {
                run_id,
                sink,
                alive: true,
            },
        );
        Ok(Box::new(FakeHandle {
            task_id: task_id.clone(),
            state: self.state.clone(),
        }))
    }
}

struct FakeHandle {
    task_id: TaskId,
    state: Arc<Mutex<FakeState>>,
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> Option<u32> {
        None
    }

    fn suspend(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(format!("suspend {}", self.task_id));
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        let mut state = self.state.lock().expect("lock");
        state.calls.push(format!("resume {}", self.task_id));
        Ok(())
    }

    /// Behaves like a real process: it dies and reports `cancelled`.
    fn terminate(&mut self, _grace: Duration) -> Result<()> {
        let (sink, run_id) = {
            let mut state = self.state.lock().expect("lock");
            state.calls.push(format!("terminate {}", self.task_id));
            let run = state.runs.get_mut(&self.task_id).expect("run");
            run.alive = false;
            (run.sink.clone(), run.run_id)
        };
        sink(ProcessMessage {
            task_id: self.task_id.clone(),
            run_id,
            event: TaskEvent::Cancelled,
        });
        Ok(())
    }
}

#[derive(Clone)]
pub struct SharedDisk(pub Arc<Mutex<Option<u64>>>);

impl DiskSpaceProbe for SharedDisk {
    fn available_bytes(&self, _path: &Path) -> Option<u64> {
        *self.0.lock().expect("lock")
    }
}

#[derive(Clone, Default)]
pub struct InhibitorLog(pub Arc<Mutex<Vec<&'static str>>>);

impl InhibitorLog {
    pub fn entries(&self) -> Vec<&'static str> {
        self.0.lock().expect("lock").clone()
    }
}

impl SleepInhibitor for InhibitorLog {
    fn acquire(&mut self) -> Result<()> {
        self.0.lock().expect("lock").push("acquire");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.0.lock().expect("lock").push("release");
        Ok(())
    }
}

/// Wires an engine over `paths` without restoring persisted state.
pub fn build_engine(
    paths: &AppPaths,
    settings: QueueSettings,
    backend: Box<dyn ProcessBackend>,
    disk: Box<dyn DiskSpaceProbe>,
    sink: EventSink,
    inhibitor: Box<dyn SleepInhibitor>,
) -> Result<QueueEngine> {
    let config = ControllerConfig::from_settings(
        &settings,
        paths.base_dir.join("downloads"),
        ToolPaths {
            yt_dlp: PathBuf::from("yt-dlp"),
            ffmpeg_location: None,
        },
    );
    let controller = ProcessController::new(backend, disk, sink, config);
    let repo = TaskRepository::open(paths)?;
    Ok(QueueEngine::new(settings, repo, controller, inhibitor))
}

pub struct Harness {
    pub engine: QueueEngine,
    pub procs: FakeProcesses,
    pub disk: SharedDisk,
    pub inhibitor: InhibitorLog,
    pub now: i64,
    events: Receiver<ProcessMessage>,
    base_dir: PathBuf,
}

pub fn settings(limit: usize) -> QueueSettings {
    QueueSettings {
        concurrency_limit: limit,
        min_free_space_bytes: 1_000,
        max_space_failures: 3,
        persist_debounce_ms: 0,
        ..QueueSettings::default()
    }
}

impl Harness {
    pub fn new(base_dir: &Path, limit: usize) -> Self {
        Self::with(base_dir, settings(limit), true)
    }

    pub fn with(base_dir: &Path, settings: QueueSettings, suspend_in_place: bool) -> Self {
        Self::build(base_dir, settings, suspend_in_place, START_MS)
    }

    fn build(base_dir: &Path, settings: QueueSettings, suspend_in_place: bool, now: i64) -> Self {
        let paths = AppPaths::new(base_dir.to_path_buf());
        let procs = FakeProcesses::new(suspend_in_place);
        let disk = SharedDisk(Arc::new(Mutex::new(None)));
        let inhibitor = InhibitorLog::default();

        let (tx, rx) = mpsc::channel::<ProcessMessage>();
        let tx = Mutex::new(tx);
        let sink: EventSink = Arc::new(move |msg: ProcessMessage| {
            let _ = tx.lock().expect("lock").send(msg);
        });

        let mut engine = build_engine(
            &paths,
            settings,
            Box::new(procs.clone()),
            Box::new(disk.clone()),
            sink,
            Box::new(inhibitor.clone()),
        )
        .expect("build engine");
        engine.restore(now).expect("restore");

        Self {
            engine,
            procs,
            disk,
            inhibitor,
            now,
            events: rx,
            base_dir: base_dir.to_path_buf(),
        }
    }

    /// Simulates a crash: the engine is dropped without `shutdown` and a new
    /// one is started over the same data directory.
    pub fn crash_and_restart(self, settings: QueueSettings) -> Self {
        let base_dir = self.base_dir.clone();
        let now = self.now + TICK_MS;
        drop(self);
        Self::build(&base_dir, settings, true, now)
    }

    pub fn advance(&mut self, ms: i64) {
        self.now += ms;
    }

    pub fn tick(&mut self) -> TickReport {
        self.now += TICK_MS;
        self.engine.tick(self.now)
    }

    pub fn enqueue(&mut self, url: &str) -> TaskId {
        self.engine
            .enqueue(url, DownloadOptions::default(), self.now)
            .expect("enqueue")
    }

    /// Delivers everything the fake processes emitted. Returns how many
    /// slots were freed.
    pub fn pump(&mut self) -> usize {
        let mut freed = 0;
        while let Ok(msg) = self.events.try_recv() {
            if self.engine.on_process_message(msg, self.now) {
                freed += 1;
            }
        }
        freed
    }

    pub fn emit(&mut self, id: &TaskId, event: TaskEvent) -> usize {
        self.procs.emit(id, event);
        self.pump()
    }

    pub fn task(&self, id: &TaskId) -> Task {
        self.engine.get(id).cloned().expect("task exists")
    }

    pub fn status(&self, id: &TaskId) -> TaskStatus {
        self.task(id).status
    }

    pub fn count(&self, status: TaskStatus) -> usize {
        self.engine
            .tasks()
            .iter()
            .filter(|t| t.status == status)
            .count()
    }

    /// A live handle exists exactly for active tasks and tasks paused in place.
    pub fn assert_registry_consistent(&self) {
        for task in self.engine.tasks() {
            let live = self.engine.has_process(&task.id);
            if task.status.is_active() {
                assert!(live, "active task {} has no process", task.id);
            }
            if live {
                assert!(
                    task.status.is_active() || task.status == TaskStatus::Paused,
                    "task {} holds a process while {}",
                    task.id,
                    task.status
                );
            }
        }
        assert!(self.engine.live_process_count() <= self.engine.concurrency_limit());
    }
}

pub fn started(title: &str) -> TaskEvent {
    TaskEvent::Started {
        title: Some(title.to_string()),
    }
}

pub fn completed(path: &str) -> TaskEvent {
    TaskEvent::Completed {
        file_path: path.to_string(),
    }
}
