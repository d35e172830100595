use crate::process::ProcessHandle;
use crate::task::TaskId;
use crate::{EngineError, Result};
use std::collections::HashMap;

pub struct RunningProcess {
    pub run_id: u64,
    pub handle: Box<dyn ProcessHandle>,
    pub suspended: bool,
}

/// Live process handles, at most one per task.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: HashMap<TaskId, RunningProcess>,
    next_run_id: u64,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate_run_id(&mut self) -> u64 {
        self.next_run_id += 1;
        self.next_run_id
    }

    pub fn insert(&mut self, id: TaskId, run_id: u64, handle: Box<dyn ProcessHandle>) -> Result<()> {
        if self.entries.contains_key(&id) {
            return Err(EngineError::AlreadyRunning(id.to_string()));
        }
        self.entries.insert(
            id,
            RunningProcess {
                run_id,
                handle,
                suspended: false,
            },
        );
        Ok(())
    }

    pub fn get_mut(&mut self, id: &TaskId) -> Option<&mut RunningProcess> {
        self.entries.get_mut(id)
    }

    pub fn remove(&mut self, id: &TaskId) -> Option<RunningProcess> {
        self.entries.remove(id)
    }

    /// Drops the entry only if it still belongs to `run_id`.
    pub fn release(&mut self, id: &TaskId, run_id: u64) -> bool {
        if self.is_current(id, run_id) {
            self.entries.remove(id);
            return true;
        }
        false
    }

    pub fn is_current(&self, id: &TaskId, run_id: u64) -> bool {
        self.entries
            .get(id)
            .map(|entry| entry.run_id == run_id)
            .unwrap_or(false)
    }

    pub fn contains(&self, id: &TaskId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.entries.keys().cloned().collect()
    }

    pub fn drain(&mut self) -> Vec<(TaskId, RunningProcess)> {
        self.entries.drain().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct NullHandle;

    impl ProcessHandle for NullHandle {
        fn pid(&self) -> Option<u32> {
            None
        }
        fn suspend(&mut self) -> Result<()> {
            Ok(())
        }
        fn resume(&mut self) -> Result<()> {
            Ok(())
        }
        fn terminate(&mut self, _grace: Duration) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn one_handle_per_task_and_stale_runs_are_not_released() {
        let mut registry = ProcessRegistry::new();
        let id = TaskId::from("a");
        let first = registry.allocate_run_id();
        registry
            .insert(id.clone(), first, Box::new(NullHandle))
            .expect("insert");
        let err = registry
            .insert(id.clone(), first + 1, Box::new(NullHandle))
            .expect_err("duplicate");
        assert!(matches!(err, EngineError::AlreadyRunning(_)));

        assert!(!registry.release(&id, first + 1));
        assert!(registry.contains(&id));
        assert!(registry.release(&id, first));
        assert!(registry.is_empty());
    }

    #[test]
    fn run_ids_are_monotonic() {
        let mut registry = ProcessRegistry::new();
        let a = registry.allocate_run_id();
        let b = registry.allocate_run_id();
        assert!(b > a);
    }
}
