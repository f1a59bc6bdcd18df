use anyhow::{Context, Result};
use aya::maps::{HashMap as BpfHashMap, MapData};
use aya::programs::UProbe;
use aya::Ebpf;

use stinger_common::{
    GoCommonSymaddrs, GoHttp2Symaddrs, GoTlsSymaddrs, OpensslSymaddrs, RawUpid,
    GO_COMMON_SYMADDRS_MAP, GO_HTTP2_SYMADDRS_MAP, GO_TLS_SYMADDRS_MAP, MMAP_EVENTS_MAP,
    OPENSSL_SYMADDRS_MAP,
};

use crate::errors::DeployError;

use super::{AttachTarget, UProbeSpec};

/// The kernel-instrumentation surface the orchestrator drives: probe
/// registration, the per-family symaddrs tables, and the kernel-populated
/// mmap event map. The conformance tests substitute a recording fake.
pub trait ProbeBackend: Send {
    fn attach_uprobe(&mut self, spec: &UProbeSpec) -> Result<(), DeployError>;

    fn update_openssl_symaddrs(
        &mut self,
        pid: u32,
        addrs: &OpensslSymaddrs,
    ) -> Result<(), DeployError>;
    fn update_go_common_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoCommonSymaddrs,
    ) -> Result<(), DeployError>;
    fn update_go_tls_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoTlsSymaddrs,
    ) -> Result<(), DeployError>;
    fn update_go_http2_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoHttp2Symaddrs,
    ) -> Result<(), DeployError>;

    fn remove_openssl_symaddrs(&mut self, pid: u32);
    fn remove_go_common_symaddrs(&mut self, pid: u32);
    fn remove_go_tls_symaddrs(&mut self, pid: u32);
    fn remove_go_http2_symaddrs(&mut self, pid: u32);

    /// Destructively drain the mmap event map. Tolerant of concurrent
    /// kernel-side inserts: anything racing the drain is seen next time.
    fn drain_mmap_events(&mut self) -> Vec<RawUpid>;
}

/// Production back end over an [`aya::Ebpf`] handle loaded with the probe
/// bytecode.
pub struct EbpfBackend {
    bpf: Ebpf,
    openssl_symaddrs: BpfHashMap<MapData, u32, OpensslSymaddrs>,
    go_common_symaddrs: BpfHashMap<MapData, u32, GoCommonSymaddrs>,
    go_tls_symaddrs: BpfHashMap<MapData, u32, GoTlsSymaddrs>,
    go_http2_symaddrs: BpfHashMap<MapData, u32, GoHttp2Symaddrs>,
    mmap_events: BpfHashMap<MapData, RawUpid, u8>,
}

impl EbpfBackend {
    pub fn new(mut bpf: Ebpf) -> Result<Self> {
        let openssl_symaddrs = take_hash_map(&mut bpf, OPENSSL_SYMADDRS_MAP)?;
        let go_common_symaddrs = take_hash_map(&mut bpf, GO_COMMON_SYMADDRS_MAP)?;
        let go_tls_symaddrs = take_hash_map(&mut bpf, GO_TLS_SYMADDRS_MAP)?;
        let go_http2_symaddrs = take_hash_map(&mut bpf, GO_HTTP2_SYMADDRS_MAP)?;
        let mmap_events = take_hash_map(&mut bpf, MMAP_EVENTS_MAP)?;
        Ok(Self {
            bpf,
            openssl_symaddrs,
            go_common_symaddrs,
            go_tls_symaddrs,
            go_http2_symaddrs,
            mmap_events,
        })
    }
}

fn take_hash_map<K, V>(bpf: &mut Ebpf, name: &str) -> Result<BpfHashMap<MapData, K, V>>
where
    K: aya::Pod,
    V: aya::Pod,
{
    let map = bpf
        .take_map(name)
        .with_context(|| format!("Failed to find map {name} in probe bytecode"))?;
    BpfHashMap::try_from(map).with_context(|| format!("Map {name} has an unexpected type"))
}

fn attach_error(spec: &UProbeSpec, reason: String) -> DeployError {
    DeployError::ProbeAttachFailed {
        handler: spec.handler.clone(),
        binary: spec.binary_path.clone(),
        reason,
    }
}

impl ProbeBackend for EbpfBackend {
    fn attach_uprobe(&mut self, spec: &UProbeSpec) -> Result<(), DeployError> {
        // Whether the probe fires at entry or return is a property of the
        // kernel-side program the handler name refers to; the spec's mode
        // only drives template expansion in userspace.
        let program: &mut UProbe = self
            .bpf
            .program_mut(&spec.handler)
            .ok_or_else(|| {
                attach_error(spec, "program not found in probe bytecode".to_string())
            })?
            .try_into()
            .map_err(|e: aya::programs::ProgramError| attach_error(spec, e.to_string()))?;

        if program.fd().is_err() {
            program
                .load()
                .map_err(|e| attach_error(spec, e.to_string()))?;
        }

        let result = match &spec.target {
            AttachTarget::Symbol(symbol) => {
                program.attach(Some(symbol.as_str()), 0, &spec.binary_path, None)
            }
            AttachTarget::Address(address) => {
                program.attach(None, *address, &spec.binary_path, None)
            }
        };
        result
            .map(|_| ())
            .map_err(|e| attach_error(spec, e.to_string()))
    }

    fn update_openssl_symaddrs(
        &mut self,
        pid: u32,
        addrs: &OpensslSymaddrs,
    ) -> Result<(), DeployError> {
        self.openssl_symaddrs
            .insert(pid, addrs, 0)
            .map_err(|e| DeployError::TableUpdateFailed {
                table: OPENSSL_SYMADDRS_MAP,
                pid,
                reason: e.to_string(),
            })
    }

    fn update_go_common_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoCommonSymaddrs,
    ) -> Result<(), DeployError> {
        self.go_common_symaddrs
            .insert(pid, addrs, 0)
            .map_err(|e| DeployError::TableUpdateFailed {
                table: GO_COMMON_SYMADDRS_MAP,
                pid,
                reason: e.to_string(),
            })
    }

    fn update_go_tls_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoTlsSymaddrs,
    ) -> Result<(), DeployError> {
        self.go_tls_symaddrs
            .insert(pid, addrs, 0)
            .map_err(|e| DeployError::TableUpdateFailed {
                table: GO_TLS_SYMADDRS_MAP,
                pid,
                reason: e.to_string(),
            })
    }

    fn update_go_http2_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoHttp2Symaddrs,
    ) -> Result<(), DeployError> {
        self.go_http2_symaddrs
            .insert(pid, addrs, 0)
            .map_err(|e| DeployError::TableUpdateFailed {
                table: GO_HTTP2_SYMADDRS_MAP,
                pid,
                reason: e.to_string(),
            })
    }

    fn remove_openssl_symaddrs(&mut self, pid: u32) {
        let _ = self.openssl_symaddrs.remove(&pid);
    }

    fn remove_go_common_symaddrs(&mut self, pid: u32) {
        let _ = self.go_common_symaddrs.remove(&pid);
    }

    fn remove_go_tls_symaddrs(&mut self, pid: u32) {
        let _ = self.go_tls_symaddrs.remove(&pid);
    }

    fn remove_go_http2_symaddrs(&mut self, pid: u32) {
        let _ = self.go_http2_symaddrs.remove(&pid);
    }

    fn drain_mmap_events(&mut self) -> Vec<RawUpid> {
        // Snapshot the keys, then delete them one by one. The map cannot be
        // cleared wholesale because the kernel side inserts concurrently.
        let keys: Vec<RawUpid> = self.mmap_events.keys().filter_map(|k| k.ok()).collect();
        for key in &keys {
            let _ = self.mmap_events.remove(key);
        }
        keys
    }
}
