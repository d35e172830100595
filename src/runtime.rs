use crate::config::{load_queue_settings, QueueSettings};
use crate::controller::{ControllerConfig, ProcessController};
use crate::disk::SystemDiskProbe;
use crate::engine::{QueueEngine, TaskUpdate};
use crate::options::DownloadOptions;
use crate::paths::AppPaths;
use crate::power::{NoopInhibitor, SleepInhibitor, SystemInhibitor};
use crate::process::{EventSink, ProcessMessage, SystemBackend};
use crate::repository::TaskRepository;
use crate::task::{Task, TaskId};
use crate::ytdlp::ToolPaths;
use crate::{EngineError, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

type Reply<T> = Sender<Result<T>>;

pub enum Command {
    Enqueue {
        url: String,
        options: DownloadOptions,
        at_ms: Option<i64>,
        reply: Reply<TaskId>,
    },
    Pause {
        id: TaskId,
        reply: Reply<()>,
    },
    Resume {
        id: TaskId,
        reply: Reply<()>,
    },
    Stop {
        id: TaskId,
        reply: Reply<()>,
    },
    Retry {
        id: TaskId,
        reply: Reply<()>,
    },
    Clear {
        id: TaskId,
        reply: Reply<()>,
    },
    StopAll {
        reply: Reply<usize>,
    },
    SetConcurrencyLimit {
        limit: usize,
        reply: Reply<usize>,
    },
    SetQueuePaused {
        paused: bool,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<Vec<Task>>,
    },
    Subscribe {
        reply: Reply<Receiver<TaskUpdate>>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

pub enum RuntimeMessage {
    Command(Command),
    Process(ProcessMessage),
}

#[derive(Clone)]
pub struct EngineHandle {
    tx: Sender<RuntimeMessage>,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl EngineHandle {
    fn call<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T> {
        let (reply, rx) = mpsc::channel();
        self.tx
            .send(RuntimeMessage::Command(build(reply)))
            .map_err(|_| EngineError::EngineStopped)?;
        rx.recv().map_err(|_| EngineError::EngineStopped)?
    }

    pub fn enqueue(&self, url: &str, options: DownloadOptions) -> Result<TaskId> {
        let url = url.to_string();
        self.call(|reply| Command::Enqueue {
            url,
            options,
            at_ms: None,
            reply,
        })
    }

    pub fn enqueue_at(&self, url: &str, options: DownloadOptions, at_ms: i64) -> Result<TaskId> {
        let url = url.to_string();
        self.call(|reply| Command::Enqueue {
            url,
            options,
            at_ms: Some(at_ms),
            reply,
        })
    }

    pub fn pause(&self, id: &TaskId) -> Result<()> {
        let id = id.clone();
        self.call(|reply| Command::Pause { id, reply })
    }

    pub fn resume(&self, id: &TaskId) -> Result<()> {
        let id = id.clone();
        self.call(|reply| Command::Resume { id, reply })
    }

    pub fn stop(&self, id: &TaskId) -> Result<()> {
        let id = id.clone();
        self.call(|reply| Command::Stop { id, reply })
    }

    pub fn retry(&self, id: &TaskId) -> Result<()> {
        let id = id.clone();
        self.call(|reply| Command::Retry { id, reply })
    }

    pub fn clear(&self, id: &TaskId) -> Result<()> {
        let id = id.clone();
        self.call(|reply| Command::Clear { id, reply })
    }

    pub fn stop_all(&self) -> Result<usize> {
        self.call(|reply| Command::StopAll { reply })
    }

    pub fn set_concurrency_limit(&self, limit: usize) -> Result<usize> {
        self.call(|reply| Command::SetConcurrencyLimit { limit, reply })
    }

    pub fn set_queue_paused(&self, paused: bool) -> Result<()> {
        self.call(|reply| Command::SetQueuePaused { paused, reply })
    }

    pub fn tasks(&self) -> Result<Vec<Task>> {
        self.call(|reply| Command::Snapshot { reply })
    }

    pub fn subscribe(&self) -> Result<Receiver<TaskUpdate>> {
        self.call(|reply| Command::Subscribe { reply })
    }

    /// Stops the engine thread and waits for it. Later calls on any clone
    /// fail with `EngineStopped`.
    pub fn shutdown(&self) -> Result<()> {
        let result = self.call(|reply| Command::Shutdown { reply });
        let thread = match self.thread.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(thread) = thread {
            let _ = thread.join();
        }
        match result {
            Err(EngineError::EngineStopped) => Ok(()),
            other => other,
        }
    }
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Starts the control thread, which builds the engine against the channel's
/// event sink and restores persisted state before handling any message.
/// Restore runs on that thread because sleep inhibition is thread-bound on
/// Windows.
pub fn spawn_engine<F>(tick_interval: Duration, build: F) -> Result<EngineHandle>
where
    F: FnOnce(EventSink) -> Result<QueueEngine> + Send + 'static,
{
    let (tx, rx) = mpsc::channel::<RuntimeMessage>();

    let sink_tx = Mutex::new(tx.clone());
    let sink: EventSink = Arc::new(move |message: ProcessMessage| {
        let guard = match sink_tx.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = guard.send(RuntimeMessage::Process(message));
    });

    let (ready_tx, ready_rx) = mpsc::channel::<Result<()>>();
    let thread = thread::Builder::new()
        .name("mediaqueue-engine".to_string())
        .spawn(move || {
            let engine = build(sink).and_then(|mut engine| {
                engine.restore(now_ms())?;
                Ok(engine)
            });
            match engine {
                Ok(engine) => {
                    let _ = ready_tx.send(Ok(()));
                    run_loop(engine, rx, tick_interval);
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                }
            }
        })?;

    let ready = ready_rx.recv().unwrap_or(Err(EngineError::EngineStopped));
    if let Err(err) = ready {
        let _ = thread.join();
        return Err(err);
    }

    Ok(EngineHandle {
        tx,
        thread: Arc::new(Mutex::new(Some(thread))),
    })
}

/// Starts the engine with the system process backend, disk probe and sleep
/// inhibitor, using settings from `paths`.
pub fn start_runtime(paths: AppPaths) -> Result<EngineHandle> {
    paths.ensure_dirs()?;
    let settings = load_queue_settings(&paths)?;
    let download_dir = paths.effective_download_dir()?;
    let tools = ToolPaths::resolve(&paths, &settings);
    let tick_interval = Duration::from_millis(settings.tick_interval_ms);

    spawn_engine(tick_interval, move |sink| {
        let repo = TaskRepository::open(&paths)?;
        let config = ControllerConfig::from_settings(&settings, download_dir, tools);
        let controller = ProcessController::new(
            Box::new(SystemBackend),
            Box::new(SystemDiskProbe),
            sink,
            config,
        );
        let inhibitor = system_inhibitor(&settings);
        Ok(QueueEngine::new(settings, repo, controller, inhibitor))
    })
}

fn system_inhibitor(settings: &QueueSettings) -> Box<dyn SleepInhibitor> {
    if settings.prevent_sleep {
        Box::new(SystemInhibitor::new())
    } else {
        Box::new(NoopInhibitor)
    }
}

fn run_loop(mut engine: QueueEngine, rx: Receiver<RuntimeMessage>, tick_interval: Duration) {
    tracing::info!(tick_ms = tick_interval.as_millis() as u64, "engine loop started");
    let mut ticker = Ticker::new(tick_interval, Instant::now());

    loop {
        let timeout = ticker.remaining(Instant::now());
        match rx.recv_timeout(timeout) {
            Ok(RuntimeMessage::Process(message)) => {
                if engine.on_process_message(message, now_ms()) {
                    engine.tick(now_ms());
                }
            }
            Ok(RuntimeMessage::Command(command)) => match handle_command(&mut engine, command) {
                Step::Kick => {
                    engine.tick(now_ms());
                }
                Step::Idle => {}
                Step::Exit => break,
            },
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                engine.shutdown(now_ms());
                break;
            }
        }
        // Checked after every message so a busy channel cannot starve it.
        if ticker.due(Instant::now()) {
            engine.tick(now_ms());
        }
        engine.flush_due(now_ms());
    }
    tracing::info!("engine loop stopped");
}

struct Ticker {
    interval: Duration,
    next: Instant,
}

impl Ticker {
    fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval,
            next: start,
        }
    }

    fn remaining(&self, now: Instant) -> Duration {
        self.next.saturating_duration_since(now)
    }

    fn due(&mut self, now: Instant) -> bool {
        if now < self.next {
            return false;
        }
        self.next = now + self.interval;
        true
    }
}

enum Step {
    Idle,
    /// The command may have made a task admissible.
    Kick,
    Exit,
}

fn kick_if(ok: bool) -> Step {
    if ok {
        Step::Kick
    } else {
        Step::Idle
    }
}

fn handle_command(engine: &mut QueueEngine, command: Command) -> Step {
    let now = now_ms();
    match command {
        Command::Enqueue {
            url,
            options,
            at_ms,
            reply,
        } => {
            let result = match at_ms {
                Some(at) => engine.enqueue_at(&url, options, at, now),
                None => engine.enqueue(&url, options, now),
            };
            let step = kick_if(result.is_ok());
            let _ = reply.send(result);
            step
        }
        Command::Pause { id, reply } => {
            let _ = reply.send(engine.pause(&id, now));
            Step::Idle
        }
        Command::Resume { id, reply } => {
            let result = engine.resume(&id, now);
            let step = kick_if(result.is_ok());
            let _ = reply.send(result);
            step
        }
        Command::Stop { id, reply } => {
            let _ = reply.send(engine.stop(&id, now));
            Step::Kick
        }
        Command::Retry { id, reply } => {
            let result = engine.retry(&id, now);
            let step = kick_if(result.is_ok());
            let _ = reply.send(result);
            step
        }
        Command::Clear { id, reply } => {
            let _ = reply.send(engine.clear(&id));
            Step::Idle
        }
        Command::StopAll { reply } => {
            let _ = reply.send(Ok(engine.stop_all(now)));
            Step::Idle
        }
        Command::SetConcurrencyLimit { limit, reply } => {
            let result = engine.set_concurrency_limit(limit);
            let step = kick_if(result.is_ok());
            let _ = reply.send(result);
            step
        }
        Command::SetQueuePaused { paused, reply } => {
            let result = engine.set_queue_paused(paused);
            let step = kick_if(result.is_ok() && !paused);
            let _ = reply.send(result);
            step
        }
        Command::Snapshot { reply } => {
            let _ = reply.send(Ok(engine.tasks()));
            Step::Idle
        }
        Command::Subscribe { reply } => {
            let _ = reply.send(Ok(engine.subscribe()));
            Step::Idle
        }
        Command::Shutdown { reply } => {
            engine.shutdown(now);
            let _ = reply.send(Ok(()));
            Step::Exit
        }
    }
}
