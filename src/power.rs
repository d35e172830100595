use crate::task::{TaskStatus, TaskStore};
use crate::Result;

pub trait SleepInhibitor: Send {
    fn acquire(&mut self) -> Result<()>;
    fn release(&mut self) -> Result<()>;
}

/// Records requests without touching the OS.
#[derive(Debug, Default)]
pub struct NoopInhibitor;

impl SleepInhibitor for NoopInhibitor {
    fn acquire(&mut self) -> Result<()> {
        tracing::debug!("sleep inhibition requested (noop)");
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        tracing::debug!("sleep inhibition released (noop)");
        Ok(())
    }
}

/// Holds a `systemd-inhibit` (Linux) or `caffeinate` (macOS) helper process
/// for as long as sleep must be blocked.
#[cfg(unix)]
#[derive(Debug, Default)]
pub struct SystemInhibitor {
    helper: Option<std::process::Child>,
}

#[cfg(unix)]
impl SystemInhibitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn helper_command() -> std::process::Command {
        if cfg!(target_os = "macos") {
            let mut cmd = crate::cmd::command("caffeinate");
            cmd.arg("-i");
            cmd
        } else {
            let mut cmd = crate::cmd::command("systemd-inhibit");
            cmd.args([
                "--what=idle:sleep",
                "--who=mediaqueue",
                "--why=Downloads in progress",
                "--mode=block",
                "sleep",
                "infinity",
            ]);
            cmd
        }
    }
}

#[cfg(unix)]
impl SleepInhibitor for SystemInhibitor {
    fn acquire(&mut self) -> Result<()> {
        if self.helper.is_some() {
            return Ok(());
        }
        let child = Self::helper_command()
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| crate::EngineError::Spawn {
                tool: "sleep inhibitor".to_string(),
                reason: e.to_string(),
            })?;
        self.helper = Some(child);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if let Some(mut child) = self.helper.take() {
            let _ = child.kill();
            let _ = child.wait();
        }
        Ok(())
    }
}

/// Uses `SetThreadExecutionState`; must stay on the thread that acquired it.
#[cfg(windows)]
#[derive(Debug, Default)]
pub struct SystemInhibitor;

#[cfg(windows)]
impl SystemInhibitor {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(windows)]
impl SleepInhibitor for SystemInhibitor {
    fn acquire(&mut self) -> Result<()> {
        use windows_sys::Win32::System::Power::{
            SetThreadExecutionState, ES_CONTINUOUS, ES_SYSTEM_REQUIRED,
        };
        let previous = unsafe { SetThreadExecutionState(ES_CONTINUOUS | ES_SYSTEM_REQUIRED) };
        if previous == 0 {
            return Err(crate::EngineError::Process(
                "SetThreadExecutionState failed".to_string(),
            ));
        }
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        use windows_sys::Win32::System::Power::{SetThreadExecutionState, ES_CONTINUOUS};
        unsafe { SetThreadExecutionState(ES_CONTINUOUS) };
        Ok(())
    }
}

/// Whether any task still has work ahead of it right now. Paused tasks do
/// not keep the machine awake.
pub fn wants_awake(store: &TaskStore) -> bool {
    store.any(|t| t.status.is_active() || t.status == TaskStatus::Pending)
}

/// Tracks the inhibitor so it is only touched on state changes.
pub struct PowerGuard {
    inhibitor: Box<dyn SleepInhibitor>,
    enabled: bool,
    held: bool,
}

impl PowerGuard {
    pub fn new(inhibitor: Box<dyn SleepInhibitor>, enabled: bool) -> Self {
        Self {
            inhibitor,
            enabled,
            held: false,
        }
    }

    pub fn is_held(&self) -> bool {
        self.held
    }

    pub fn update(&mut self, wanted: bool) {
        let wanted = wanted && self.enabled;
        if wanted == self.held {
            return;
        }
        if wanted {
            match self.inhibitor.acquire() {
                Ok(()) => {
                    self.held = true;
                    tracing::info!("sleep inhibited while downloads are active");
                }
                Err(err) => tracing::warn!(error = %err, "failed to inhibit sleep"),
            }
        } else {
            if let Err(err) = self.inhibitor.release() {
                tracing::warn!(error = %err, "failed to release sleep inhibition");
            }
            self.held = false;
            tracing::info!("sleep inhibition released");
        }
    }

    /// Releases regardless of the tracked state.
    pub fn release(&mut self) {
        if let Err(err) = self.inhibitor.release() {
            tracing::warn!(error = %err, "failed to release sleep inhibition");
        }
        self.held = false;
    }
}

impl Drop for PowerGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl SleepInhibitor for Recorder {
        fn acquire(&mut self) -> Result<()> {
            self.0.lock().expect("lock").push("acquire");
            Ok(())
        }
        fn release(&mut self) -> Result<()> {
            self.0.lock().expect("lock").push("release");
            Ok(())
        }
    }

    #[test]
    fn inhibitor_is_only_called_on_change() {
        let recorder = Recorder::default();
        let mut guard = PowerGuard::new(Box::new(recorder.clone()), true);
        guard.update(true);
        guard.update(true);
        guard.update(false);
        guard.update(false);
        assert_eq!(*recorder.0.lock().expect("lock"), vec!["acquire", "release"]);
    }

    #[test]
    fn disabled_guard_never_acquires_and_drop_releases() {
        let recorder = Recorder::default();
        {
            let mut guard = PowerGuard::new(Box::new(recorder.clone()), false);
            guard.update(true);
            assert!(!guard.is_held());
        }
        assert_eq!(*recorder.0.lock().expect("lock"), vec!["release"]);
    }
}
