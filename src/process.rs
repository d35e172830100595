use crate::cmd;
use crate::events::{LineDecoder, TaskEvent};
use crate::task::TaskId;
use crate::{EngineError, Result};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, ExitStatus};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Everything needed to start one run of a task.
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub expect_post_processing: bool,
    pub clip_duration_secs: Option<f64>,
}

impl LaunchSpec {
    pub fn tool_name(&self) -> String {
        self.program
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.to_string_lossy().to_string())
    }
}

/// An event from one specific run. `run_id` lets the engine drop events from
/// a process it has already let go of.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessMessage {
    pub task_id: TaskId,
    pub run_id: u64,
    pub event: TaskEvent,
}

pub type EventSink = Arc<dyn Fn(ProcessMessage) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCapabilities {
    /// Pause can freeze the process instead of killing it.
    pub suspend_in_place: bool,
}

pub trait ProcessHandle: Send {
    fn pid(&self) -> Option<u32>;
    fn suspend(&mut self) -> Result<()>;
    fn resume(&mut self) -> Result<()>;
    /// Asks the process tree to exit, then force-kills whatever is left after
    /// `grace`. Must not block the caller for the grace period.
    fn terminate(&mut self, grace: Duration) -> Result<()>;
}

pub trait ProcessBackend: Send {
    fn capabilities(&self) -> BackendCapabilities;

    /// Starts the process. Every event of the run, ending with exactly one of
    /// `completed`, `error` or `cancelled`, is delivered through `sink`.
    fn spawn(
        &self,
        task_id: &TaskId,
        run_id: u64,
        spec: &LaunchSpec,
        sink: EventSink,
    ) -> Result<Box<dyn ProcessHandle>>;
}

/// Spawns real OS processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemBackend;

impl ProcessBackend for SystemBackend {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities {
            suspend_in_place: cfg!(unix),
        }
    }

    fn spawn(
        &self,
        task_id: &TaskId,
        run_id: u64,
        spec: &LaunchSpec,
        sink: EventSink,
    ) -> Result<Box<dyn ProcessHandle>> {
        let mut command = cmd::streaming_command(&spec.program, &spec.args);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| EngineError::Spawn {
            tool: spec.tool_name(),
            reason: e.to_string(),
        })?;
        let pid = child.id();
        tracing::debug!(task_id = %task_id, run_id, pid, tool = %spec.tool_name(), "spawned process");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let child = Arc::new(Mutex::new(child));
        let cancelled = Arc::new(AtomicBool::new(false));

        let stdout_reader = stdout.map(|stream| {
            let decoder = LineDecoder::new(spec.expect_post_processing, spec.clip_duration_secs);
            let emit = emitter(task_id, run_id, sink.clone());
            thread::spawn(move || pump_lines(stream, decoder, emit, LineDecoder::decode_stdout))
        });
        let stderr_reader = stderr.map(|stream| {
            let decoder = LineDecoder::new(spec.expect_post_processing, spec.clip_duration_secs);
            let emit = emitter(task_id, run_id, sink.clone());
            thread::spawn(move || pump_lines(stream, decoder, emit, LineDecoder::decode_stderr))
        });

        let monitor_child = child.clone();
        let monitor_cancelled = cancelled.clone();
        let emit = emitter(task_id, run_id, sink);
        let tool = spec.tool_name();
        thread::spawn(move || {
            let status = wait_for_exit(&monitor_child);
            let out = stdout_reader.and_then(|h| h.join().ok());
            let err = stderr_reader.and_then(|h| h.join().ok());

            let event = if monitor_cancelled.load(Ordering::SeqCst) {
                TaskEvent::Cancelled
            } else {
                match status {
                    Ok(status) if status.success() => TaskEvent::Completed {
                        file_path: out
                            .as_ref()
                            .and_then(|d| d.file_path())
                            .unwrap_or_default()
                            .to_string(),
                    },
                    Ok(status) => TaskEvent::Error {
                        message: err
                            .as_ref()
                            .and_then(LineDecoder::error_summary)
                            .or_else(|| out.as_ref().and_then(LineDecoder::error_summary))
                            .unwrap_or_else(|| format!("{tool} exited with {status}")),
                    },
                    Err(e) => TaskEvent::Error {
                        message: e.to_string(),
                    },
                }
            };
            emit(event);
        });

        Ok(Box::new(SystemHandle {
            pid,
            child,
            cancelled,
            suspended: false,
        }))
    }
}

fn emitter(task_id: &TaskId, run_id: u64, sink: EventSink) -> impl Fn(TaskEvent) + Send + 'static {
    let task_id = task_id.clone();
    move |event| {
        sink(ProcessMessage {
            task_id: task_id.clone(),
            run_id,
            event,
        })
    }
}

fn pump_lines<R, E>(
    stream: R,
    mut decoder: LineDecoder,
    emit: E,
    decode: fn(&mut LineDecoder, &str) -> Vec<TaskEvent>,
) -> LineDecoder
where
    R: Read,
    E: Fn(TaskEvent),
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                for event in decode(&mut decoder, &line) {
                    emit(event);
                }
            }
        }
    }
    decoder
}

fn wait_for_exit(child: &Arc<Mutex<Child>>) -> Result<ExitStatus> {
    loop {
        let polled = {
            let mut guard = child
                .lock()
                .map_err(|_| EngineError::Process("child handle lock poisoned".to_string()))?;
            guard.try_wait()?
        };
        if let Some(status) = polled {
            return Ok(status);
        }
        thread::sleep(EXIT_POLL_INTERVAL);
    }
}

struct SystemHandle {
    pid: u32,
    child: Arc<Mutex<Child>>,
    cancelled: Arc<AtomicBool>,
    suspended: bool,
}

impl ProcessHandle for SystemHandle {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn suspend(&mut self) -> Result<()> {
        suspend_process_tree(self.pid)?;
        self.suspended = true;
        Ok(())
    }

    fn resume(&mut self) -> Result<()> {
        resume_process_tree(self.pid)?;
        self.suspended = false;
        Ok(())
    }

    fn terminate(&mut self, grace: Duration) -> Result<()> {
        self.cancelled.store(true, Ordering::SeqCst);
        if self.suspended {
            // A frozen process cannot act on the terminate signal.
            if let Err(err) = resume_process_tree(self.pid) {
                tracing::warn!(pid = self.pid, error = %err, "failed to continue process before terminate");
            }
            self.suspended = false;
        }

        if cfg!(windows) || grace.is_zero() {
            kill_process_tree(self.pid, &self.child);
            return Ok(());
        }

        if let Err(err) = terminate_process_tree(self.pid) {
            tracing::debug!(pid = self.pid, error = %err, "terminate signal failed; killing");
            kill_process_tree(self.pid, &self.child);
            return Ok(());
        }

        let pid = self.pid;
        let child = self.child.clone();
        thread::spawn(move || {
            thread::sleep(grace);
            let still_running = child
                .lock()
                .map(|mut c| matches!(c.try_wait(), Ok(None)))
                .unwrap_or(false);
            if still_running {
                tracing::info!(pid, "process ignored terminate; killing tree");
                kill_process_tree(pid, &child);
            }
        });
        Ok(())
    }
}

#[cfg(unix)]
mod tree {
    use crate::{EngineError, Result};
    use sysinfo::{Pid, ProcessesToUpdate, Signal, System};

    /// Root first, then descendants breadth-first.
    fn collect_tree(system: &System, root: Pid) -> Vec<Pid> {
        let mut tree = vec![root];
        let mut idx = 0;
        while idx < tree.len() {
            let parent = tree[idx];
            for (pid, process) in system.processes() {
                if process.parent() == Some(parent) && !tree.contains(pid) {
                    tree.push(*pid);
                }
            }
            idx += 1;
        }
        tree
    }

    pub(super) fn signal_tree(pid: u32, signal: Signal, children_first: bool) -> Result<usize> {
        let mut system = System::new();
        system.refresh_processes(ProcessesToUpdate::All, true);

        let root = Pid::from_u32(pid);
        if system.process(root).is_none() {
            return Err(EngineError::Signal {
                pid,
                reason: "process not found".to_string(),
            });
        }

        let mut targets = collect_tree(&system, root);
        if children_first {
            targets.reverse();
        }

        let mut delivered = 0_usize;
        for target in targets {
            if let Some(process) = system.process(target) {
                if process.kill_with(signal) == Some(true) {
                    delivered += 1;
                }
            }
        }
        if delivered == 0 {
            return Err(EngineError::Signal {
                pid,
                reason: format!("{signal:?} was not delivered"),
            });
        }
        Ok(delivered)
    }
}

#[cfg(unix)]
pub fn suspend_process_tree(pid: u32) -> Result<()> {
    tree::signal_tree(pid, sysinfo::Signal::Stop, false).map(|_| ())
}

#[cfg(unix)]
pub fn resume_process_tree(pid: u32) -> Result<()> {
    tree::signal_tree(pid, sysinfo::Signal::Continue, true).map(|_| ())
}

#[cfg(unix)]
pub fn terminate_process_tree(pid: u32) -> Result<()> {
    tree::signal_tree(pid, sysinfo::Signal::Term, true).map(|_| ())
}

#[cfg(not(unix))]
pub fn suspend_process_tree(pid: u32) -> Result<()> {
    Err(EngineError::Signal {
        pid,
        reason: "suspend is not supported on this platform".to_string(),
    })
}

#[cfg(not(unix))]
pub fn resume_process_tree(pid: u32) -> Result<()> {
    Err(EngineError::Signal {
        pid,
        reason: "resume is not supported on this platform".to_string(),
    })
}

#[cfg(not(unix))]
pub fn terminate_process_tree(pid: u32) -> Result<()> {
    Err(EngineError::Signal {
        pid,
        reason: "graceful terminate is not supported on this platform".to_string(),
    })
}

/// Best-effort hard kill of the whole tree, then of the direct child.
fn kill_process_tree(pid: u32, child: &Arc<Mutex<Child>>) {
    #[cfg(windows)]
    {
        let _ = cmd::command("taskkill")
            .args(["/PID", &pid.to_string(), "/T", "/F"])
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status();
    }
    #[cfg(unix)]
    {
        if let Err(err) = tree::signal_tree(pid, sysinfo::Signal::Kill, true) {
            tracing::debug!(pid, error = %err, "kill signal not delivered");
        }
    }
    if let Ok(mut child) = child.lock() {
        let _ = child.kill();
    }
}
