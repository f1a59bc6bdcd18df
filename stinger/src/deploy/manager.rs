use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use log::{debug, info, warn};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::DeployError;
use crate::obj::{DwarfReader, ElfReader};
use crate::proc::{ProcReader, ProcTracker, Upid};

use super::attacher::attach_probe_templates;
use super::backend::ProbeBackend;
use super::symaddrs;
use super::templates::{GO_HTTP2_UPROBE_TMPLS, GO_TLS_UPROBE_TMPLS, OPENSSL_UPROBES};
use super::{AttachTarget, ProbeFamily, UProbeSpec, UProbeTmpl};

const LIBSSL_SO: &str = "libssl.so.1.1";
const LIBCRYPTO_SO: &str = "libcrypto.so.1.1";
const GO_BUILD_VERSION_SYMBOL: &str = "runtime.buildVersion";

/// Attach failures past this count within one pass drop to debug verbosity.
const ATTACH_FAILURE_LOG_LIMIT: usize = 10;

static OPENSSL_LIB_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^lib(?:ssl|crypto)\.so\.1\.1$").unwrap());

/// Engine configuration, fixed at construction (the HTTP/2 flag can also be
/// flipped at runtime, see [`UProbeManager::set_http2_tracing`]).
#[derive(Debug, Clone, Copy, Default)]
pub struct UprobeConfig {
    pub trace_http2: bool,
    pub disable_self_probing: bool,
    pub rescan_for_dlopen: bool,
    /// On process exit only the Go HTTP/2 symaddrs table is cleared by
    /// default; the OpenSSL, Go-common and Go-TLS tables accumulate dead
    /// pids until this flag enables full cleanup.
    pub cleanup_all_symaddr_tables: bool,
}

struct DeployState<B> {
    backend: B,
    tracker: ProcTracker,
    probed_binaries: HashMap<ProbeFamily, HashSet<PathBuf>>,
}

/// A Go probe family as a value: its templates, the key of its
/// probed-binary set, and the function that resolves and publishes its
/// symaddrs record. One driver iterates these.
struct GoFamily<B> {
    name: &'static str,
    kind: ProbeFamily,
    templates: &'static [UProbeTmpl],
    publish: fn(&ElfReader, &DwarfReader, &[u32], &mut B) -> Result<(), DeployError>,
}

fn go_families<B: ProbeBackend>() -> [GoFamily<B>; 2] {
    [
        GoFamily {
            name: "go-tls",
            kind: ProbeFamily::GoTls,
            templates: GO_TLS_UPROBE_TMPLS,
            publish: publish_go_tls::<B>,
        },
        GoFamily {
            name: "go-http2",
            kind: ProbeFamily::GoHttp2,
            templates: GO_HTTP2_UPROBE_TMPLS,
            publish: publish_go_http2::<B>,
        },
    ]
}

fn publish_go_tls<B: ProbeBackend>(
    elf: &ElfReader,
    dwarf: &DwarfReader,
    pids: &[u32],
    backend: &mut B,
) -> Result<(), DeployError> {
    let addrs = symaddrs::go_tls_symaddrs(elf, dwarf)?;
    for pid in pids {
        if let Err(e) = backend.update_go_tls_symaddrs(*pid, &addrs) {
            warn!("{e}");
        }
    }
    Ok(())
}

fn publish_go_http2<B: ProbeBackend>(
    elf: &ElfReader,
    dwarf: &DwarfReader,
    pids: &[u32],
    backend: &mut B,
) -> Result<(), DeployError> {
    let addrs = symaddrs::go_http2_symaddrs(elf, dwarf)?;
    for pid in pids {
        if let Err(e) = backend.update_go_http2_symaddrs(*pid, &addrs) {
            warn!("{e}");
        }
    }
    Ok(())
}

/// The deployment orchestrator. Owns the process tracker, the per-family
/// probed-binary sets and the symaddrs table handles, and guarantees
/// at-most-once probing per (binary, family).
///
/// `deploy` runs under an exclusive mutex: it is called from background
/// workers and must never overlap itself.
pub struct UProbeManager<B: ProbeBackend, P: ProcReader> {
    cfg: UprobeConfig,
    trace_http2: AtomicBool,
    self_pid: u32,
    proc_reader: P,
    state: Mutex<DeployState<B>>,
}

impl<B: ProbeBackend, P: ProcReader> UProbeManager<B, P> {
    pub fn new(cfg: UprobeConfig, backend: B, proc_reader: P) -> Self {
        Self {
            trace_http2: AtomicBool::new(cfg.trace_http2),
            cfg,
            self_pid: std::process::id(),
            proc_reader,
            state: Mutex::new(DeployState {
                backend,
                tracker: ProcTracker::new(),
                probed_binaries: HashMap::new(),
            }),
        }
    }

    /// Toggle HTTP/2 header tracing for subsequent deploy passes. Binaries
    /// already probed for HTTP/2 stay probed.
    pub fn set_http2_tracing(&self, enabled: bool) {
        self.trace_http2.store(enabled, Ordering::Relaxed);
    }

    /// One deployment pass over an observed process population. Returns the
    /// number of probes attached. Calling this again with the same
    /// observation attaches nothing.
    pub fn deploy(&self, observed: HashSet<Upid>) -> u64 {
        let mut guard = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let state = &mut *guard;

        state.tracker.update(observed);

        // Clean up table entries of dead processes before publishing new ones.
        self.cleanup_symaddr_tables(state);

        let new_upids = state.tracker.new_upids().clone();

        let mut count = self.deploy_openssl_uprobes(state, &new_upids);
        if self.cfg.rescan_for_dlopen {
            let rescan = self.upids_to_rescan(state);
            count += self.deploy_openssl_uprobes(state, &rescan);
        }
        count += self.deploy_go_uprobes(state, &new_upids);

        info!(
            "Deployed {} uprobes across {} new processes",
            count,
            new_upids.len()
        );
        count
    }

    fn cleanup_symaddr_tables(&self, state: &mut DeployState<B>) {
        let DeployState {
            backend, tracker, ..
        } = state;
        for upid in tracker.deleted_upids() {
            backend.remove_go_http2_symaddrs(upid.pid);
            if self.cfg.cleanup_all_symaddr_tables {
                backend.remove_openssl_symaddrs(upid.pid);
                backend.remove_go_common_symaddrs(upid.pid);
                backend.remove_go_tls_symaddrs(upid.pid);
            }
        }
    }

    /// Pids whose mmap activity warrants a re-inspection: still tracked,
    /// but not part of this pass's new set (those are scanned anyway).
    /// Duplicates across drains are harmless since attachment is gated by
    /// the probed-binary sets.
    fn upids_to_rescan(&self, state: &mut DeployState<B>) -> HashSet<Upid> {
        let drained = state.backend.drain_mmap_events();
        if drained.is_empty() {
            return HashSet::new();
        }

        let Some(asid) = state.tracker.current().iter().next().map(|u| u.asid) else {
            return HashSet::new();
        };

        drained
            .into_iter()
            .map(|raw| Upid {
                asid,
                pid: raw.pid,
                start_time_ticks: raw.start_time_ticks,
            })
            .filter(|upid| {
                state.tracker.current().contains(upid)
                    && !state.tracker.new_upids().contains(upid)
            })
            .collect()
    }

    fn deploy_openssl_uprobes(&self, state: &mut DeployState<B>, upids: &HashSet<Upid>) -> u64 {
        let mut count = 0;
        let mut failures = 0usize;
        for upid in upids {
            if self.cfg.disable_self_probing && upid.pid == self.self_pid {
                continue;
            }
            match self.attach_openssl_uprobes(state, upid.pid) {
                Ok(n) => count += n,
                Err(
                    e @ (DeployError::ProcessGone { .. }
                    | DeployError::NamespaceUnavailable { .. }
                    | DeployError::PathUnresolvable { .. }),
                ) => {
                    debug!("Skipping OpenSSL probes for pid {}: {e}", upid.pid);
                }
                Err(e) => {
                    failures += 1;
                    if failures <= ATTACH_FAILURE_LOG_LIMIT {
                        warn!("Attaching OpenSSL uprobes failed for pid {}: {e}", upid.pid);
                    } else {
                        debug!("Attaching OpenSSL uprobes failed for pid {}: {e}", upid.pid);
                    }
                }
            }
        }
        count
    }

    fn attach_openssl_uprobes(
        &self,
        state: &mut DeployState<B>,
        pid: u32,
    ) -> Result<u64, DeployError> {
        let mapped = self.proc_reader.mapped_paths(pid)?;

        let mut libssl = None;
        let mut libcrypto = None;
        for path in &mapped {
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !OPENSSL_LIB_RE.is_match(name) {
                continue;
            }
            if name == LIBSSL_SO {
                libssl = Some(path);
            } else if name == LIBCRYPTO_SO {
                libcrypto = Some(path);
            }
        }

        // A process that maps neither (or only one) is not an OpenSSL user.
        let (Some(libssl), Some(libcrypto)) = (libssl, libcrypto) else {
            return Ok(0);
        };

        let host_libssl = self.proc_reader.resolve_path(pid, libssl)?;
        let host_libcrypto = self.proc_reader.resolve_path(pid, libcrypto)?;

        let addrs = symaddrs::openssl_symaddrs(&host_libcrypto)?;
        if let Err(e) = state.backend.update_openssl_symaddrs(pid, &addrs) {
            warn!("{e}");
        }

        // The symaddrs are published per pid; the probes are attached only
        // the first time this libssl binary is seen.
        if !state
            .probed_binaries
            .entry(ProbeFamily::OpenSsl)
            .or_default()
            .insert(host_libssl.clone())
        {
            return Ok(0);
        }

        let mut count = 0;
        for probe in OPENSSL_UPROBES {
            state.backend.attach_uprobe(&UProbeSpec {
                binary_path: host_libssl.clone(),
                target: AttachTarget::Symbol(probe.symbol.to_string()),
                mode: probe.mode,
                handler: probe.handler.to_string(),
            })?;
            count += 1;
        }
        Ok(count)
    }

    fn deploy_go_uprobes(&self, state: &mut DeployState<B>, upids: &HashSet<Upid>) -> u64 {
        let mut count = 0;
        let mut failures = 0usize;

        for (binary, pids) in self.group_pids_by_binary(upids) {
            if self.cfg.disable_self_probing
                && pids.len() == 1
                && pids[0] == self.self_pid
            {
                continue;
            }

            match self.deploy_go_binary(state, &binary, &pids, &mut failures) {
                Ok(n) => count += n,
                // Most binaries on a host are not Go binaries; skip silently.
                Err(DeployError::NotGoBinary { .. }) => {}
                Err(e @ DeployError::BinaryUnreadable { .. }) => {
                    warn!(
                        "Cannot analyze binary {} for uprobe deployment: {e}",
                        binary.display()
                    );
                }
                Err(e @ DeployError::DebugInfoMissing { .. }) => {
                    debug!("{e}; cannot deploy Go uprobes");
                }
                Err(e) => {
                    warn!(
                        "Go binary {} lacks mandatory symbols: {e}",
                        binary.display()
                    );
                }
            }
        }
        count
    }

    /// Deploy every enabled Go family onto one binary. Family-level
    /// failures are handled here; errors that disqualify the whole binary
    /// propagate to the caller.
    fn deploy_go_binary(
        &self,
        state: &mut DeployState<B>,
        binary: &PathBuf,
        pids: &[u32],
        failures: &mut usize,
    ) -> Result<u64, DeployError> {
        let elf = ElfReader::open(binary)?;

        // DWARF parsing is memory intensive and the remaining probes are
        // Go specific, so test for a Go runtime first.
        if elf.symbol_address(GO_BUILD_VERSION_SYMBOL).is_none() {
            return Err(DeployError::NotGoBinary {
                path: binary.clone(),
            });
        }

        let dwarf = DwarfReader::open(binary)?;

        let common = symaddrs::go_common_symaddrs(&elf, &dwarf)?;
        for pid in pids {
            if let Err(e) = state.backend.update_go_common_symaddrs(*pid, &common) {
                warn!("{e}");
            }
        }

        let mut count = 0;
        for family in go_families::<B>() {
            if family.kind == ProbeFamily::GoHttp2
                && !self.trace_http2.load(Ordering::Relaxed)
            {
                continue;
            }
            match self.attach_go_family(state, &family, binary, &elf, &dwarf, pids) {
                Ok(n) => count += n,
                Err(e @ DeployError::SymbolsIncomplete { .. }) => {
                    warn!(
                        "Skipping {} probes for {}: {e}",
                        family.name,
                        binary.display()
                    );
                }
                Err(e) => {
                    *failures += 1;
                    if *failures <= ATTACH_FAILURE_LOG_LIMIT {
                        warn!(
                            "Failed to attach {} uprobes to {}: {e}",
                            family.name,
                            binary.display()
                        );
                    } else {
                        debug!(
                            "Failed to attach {} uprobes to {}: {e}",
                            family.name,
                            binary.display()
                        );
                    }
                }
            }
        }
        Ok(count)
    }

    fn attach_go_family(
        &self,
        state: &mut DeployState<B>,
        family: &GoFamily<B>,
        binary: &PathBuf,
        elf: &ElfReader,
        dwarf: &DwarfReader,
        pids: &[u32],
    ) -> Result<u64, DeployError> {
        // Publish the symaddrs for every pid of the group first; probes are
        // then attached only for binaries not yet probed by this family.
        (family.publish)(elf, dwarf, pids, &mut state.backend)?;

        if !state
            .probed_binaries
            .entry(family.kind)
            .or_default()
            .insert(binary.clone())
        {
            return Ok(0);
        }
        attach_probe_templates(&mut state.backend, family.templates, binary, elf)
    }

    /// Group new pids by their host-visible executable path, so each binary
    /// is analyzed once no matter how many instances run. Ordered map keeps
    /// deployment order stable for a given observation.
    fn group_pids_by_binary(&self, upids: &HashSet<Upid>) -> BTreeMap<PathBuf, Vec<u32>> {
        let mut groups: BTreeMap<PathBuf, Vec<u32>> = BTreeMap::new();
        for upid in upids {
            let exe = match self.proc_reader.executable(upid.pid) {
                Ok(exe) => exe,
                Err(e) => {
                    debug!("Could not read executable of pid {}: {e}", upid.pid);
                    continue;
                }
            };
            let host_exe = match self.proc_reader.resolve_path(upid.pid, &exe) {
                Ok(host_exe) => host_exe,
                Err(e) => {
                    debug!("Could not resolve executable of pid {}: {e}", upid.pid);
                    continue;
                }
            };
            groups.entry(host_exe).or_default().push(upid.pid);
        }
        groups
    }
}
