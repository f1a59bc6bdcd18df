use std::collections::HashSet;
use std::path::PathBuf;

use procfs::process::{MMapPath, Process};

use crate::errors::DeployError;

/// Point-in-time reader over /proc/<pid>. Results never mix data between
/// two processes, but no stronger atomicity is guaranteed; a process that
/// exits mid-read surfaces as [`DeployError::ProcessGone`].
pub struct ProcInspector;

impl ProcInspector {
    /// Path of the main executable image, as the target process sees it.
    pub fn executable(pid: u32) -> Result<PathBuf, DeployError> {
        let process =
            Process::new(pid as i32).map_err(|_| DeployError::ProcessGone { pid })?;
        process.exe().map_err(|_| DeployError::ProcessGone { pid })
    }

    /// Every distinct file-backed path currently mapped into the target.
    pub fn mapped_paths(pid: u32) -> Result<HashSet<PathBuf>, DeployError> {
        let process =
            Process::new(pid as i32).map_err(|_| DeployError::ProcessGone { pid })?;
        let maps = process.maps().map_err(|_| DeployError::ProcessGone { pid })?;

        let mut paths = HashSet::new();
        for map in maps {
            if let MMapPath::Path(path) = map.pathname {
                paths.insert(path);
            }
        }
        Ok(paths)
    }
}
