use std::path::{Path, PathBuf};

use crate::errors::DeployError;

/// Maps paths seen inside a target process's mount namespace to paths
/// reachable from the agent, by going through `/proc/<pid>/root` whenever
/// the target lives in a different namespace.
///
/// Bound to one pid at a time; `rebind` swaps the binding without
/// reconstruction.
#[derive(Debug)]
pub struct PathResolver {
    pid: u32,
    target_mnt_ns: PathBuf,
    agent_mnt_ns: PathBuf,
}

impl PathResolver {
    pub fn new(pid: u32) -> Result<Self, DeployError> {
        let agent_mnt_ns = read_mnt_ns(std::process::id())
            .map_err(|_| DeployError::NamespaceUnavailable {
                pid: std::process::id(),
            })?;
        let target_mnt_ns =
            read_mnt_ns(pid).map_err(|_| DeployError::NamespaceUnavailable { pid })?;
        Ok(Self {
            pid,
            target_mnt_ns,
            agent_mnt_ns,
        })
    }

    /// Rebind the resolver to another process.
    pub fn rebind(&mut self, pid: u32) -> Result<(), DeployError> {
        self.target_mnt_ns =
            read_mnt_ns(pid).map_err(|_| DeployError::NamespaceUnavailable { pid })?;
        self.pid = pid;
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Translate `path` from the bound process's namespace to one the agent
    /// can open. The result is verified to exist.
    pub fn resolve(&self, path: &Path) -> Result<PathBuf, DeployError> {
        let resolved = if self.target_mnt_ns == self.agent_mnt_ns {
            path.to_path_buf()
        } else {
            // /proc/<pid>/root/<path>
            let relative = path.strip_prefix("/").unwrap_or(path);
            PathBuf::from(format!("/proc/{}/root", self.pid)).join(relative)
        };

        if resolved.exists() {
            Ok(resolved)
        } else {
            Err(DeployError::PathUnresolvable {
                pid: self.pid,
                path: path.to_path_buf(),
            })
        }
    }
}

fn read_mnt_ns(pid: u32) -> std::io::Result<PathBuf> {
    std::fs::read_link(format!("/proc/{}/ns/mnt", pid))
}
