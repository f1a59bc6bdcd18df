use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Result;

use crate::errors::DeployError;

pub mod inspector;
pub mod resolver;
pub mod tracker;

pub use inspector::ProcInspector;
pub use resolver::PathResolver;
pub use tracker::ProcTracker;

/// Unique identity of a process instance: (address-space id, kernel pid,
/// start time in kernel ticks). Two observations of the same triple always
/// refer to the same process; the start time distinguishes a reused pid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Upid {
    pub asid: u32,
    pub pid: u32,
    pub start_time_ticks: u64,
}

/// Address-space id of the host the agent runs on. A multi-host control
/// plane would assign these; a standalone agent sees a single address space.
pub const HOST_ASID: u32 = 0;

/// Snapshot the upids of every process currently visible in /proc.
pub fn snapshot_upids() -> Result<HashSet<Upid>> {
    let mut upids = HashSet::new();
    for p in procfs::process::all_processes()? {
        let process = match p {
            Ok(process) => process,
            Err(_) => continue,
        };
        // Processes racing with the walk simply drop out of the snapshot.
        let stat = match process.stat() {
            Ok(stat) => stat,
            Err(_) => continue,
        };
        upids.insert(Upid {
            asid: HOST_ASID,
            pid: process.pid as u32,
            start_time_ticks: stat.starttime,
        });
    }
    Ok(upids)
}

/// The per-process surface the deployment passes read: executable image,
/// mapped files, and cross-namespace path resolution. The orchestrator is
/// generic over this so the conformance tests can substitute a fake.
pub trait ProcReader: Send + Sync {
    /// Path of the main executable image, as the target process sees it.
    fn executable(&self, pid: u32) -> Result<PathBuf, DeployError>;

    /// Every distinct file-backed region currently mapped into the target.
    fn mapped_paths(&self, pid: u32) -> Result<HashSet<PathBuf>, DeployError>;

    /// Re-express a path valid inside the target's mount namespace as a path
    /// reachable from the agent.
    fn resolve_path(&self, pid: u32, path: &Path) -> Result<PathBuf, DeployError>;
}

/// Production [`ProcReader`] over /proc. Keeps one [`PathResolver`] and
/// rebinds it per pid, which is cheaper than reconstructing it for every
/// lookup.
#[derive(Default)]
pub struct SysProcReader {
    resolver: Mutex<Option<PathResolver>>,
}

impl SysProcReader {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcReader for SysProcReader {
    fn executable(&self, pid: u32) -> Result<PathBuf, DeployError> {
        ProcInspector::executable(pid)
    }

    fn mapped_paths(&self, pid: u32) -> Result<HashSet<PathBuf>, DeployError> {
        ProcInspector::mapped_paths(pid)
    }

    fn resolve_path(&self, pid: u32, path: &Path) -> Result<PathBuf, DeployError> {
        let mut guard = self.resolver.lock().unwrap_or_else(|e| e.into_inner());
        let rebind_needed = !matches!(guard.as_ref(), Some(r) if r.pid() == pid);
        if rebind_needed {
            match guard.as_mut() {
                Some(resolver) => resolver.rebind(pid)?,
                None => *guard = Some(PathResolver::new(pid)?),
            }
        }
        match guard.as_ref() {
            Some(resolver) => resolver.resolve(path),
            None => Err(DeployError::NamespaceUnavailable { pid }),
        }
    }
}
