use std::path::PathBuf;

use thiserror::Error;

/// Everything that can go wrong while deploying uprobes. None of these are
/// fatal to the engine: individual processes and probe families are
/// best-effort, and the deployment pass keeps going.
#[derive(Error, Debug)]
pub enum DeployError {
    #[error("process {pid} disappeared during inspection")]
    ProcessGone { pid: u32 },

    #[error("mount namespace of process {pid} is unavailable")]
    NamespaceUnavailable { pid: u32 },

    #[error("could not resolve {path} in the namespace of process {pid}")]
    PathUnresolvable { pid: u32, path: PathBuf },

    #[error("cannot read binary {path}: {reason}")]
    BinaryUnreadable { path: PathBuf, reason: String },

    #[error("{path} is not a Go binary")]
    NotGoBinary { path: PathBuf },

    #[error("no usable debug info in {path}")]
    DebugInfoMissing { path: PathBuf },

    #[error("{family} symbols incomplete: missing {symbol}")]
    SymbolsIncomplete { family: &'static str, symbol: String },

    #[error("failed to attach {handler} to {binary}: {reason}")]
    ProbeAttachFailed {
        handler: String,
        binary: PathBuf,
        reason: String,
    },

    #[error("failed to update {table} for pid {pid}: {reason}")]
    TableUpdateFailed {
        table: &'static str,
        pid: u32,
        reason: String,
    },
}
