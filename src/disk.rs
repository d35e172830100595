use std::path::Path;
use sysinfo::Disks;

pub trait DiskSpaceProbe: Send {
    /// Free bytes on the volume holding `path`; `None` when unknown.
    fn available_bytes(&self, path: &Path) -> Option<u64>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDiskProbe;

impl DiskSpaceProbe for SystemDiskProbe {
    fn available_bytes(&self, path: &Path) -> Option<u64> {
        let target = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| target.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_answers_for_an_existing_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        // Containers may hide mount info; only check the value is sane when present.
        if let Some(free) = SystemDiskProbe.available_bytes(dir.path()) {
            assert!(free < u64::MAX);
        }
    }
}
