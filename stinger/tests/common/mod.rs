#![allow(dead_code)]

//! Shared fixtures for the conformance tests: synthetic ELF/DWARF binaries,
//! a recording probe back end, and a fake /proc surface.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use gimli::write::{AttributeValue, DwarfUnit, EndianVec, Expression, Sections};
use gimli::{Encoding, Format, LittleEndian};
use object::write::{Object as ObjectWriter, StandardSegment, Symbol as WriteSymbol, SymbolSection};
use object::{
    Architecture, BinaryFormat, Endianness, SectionKind, SymbolFlags, SymbolKind, SymbolScope,
};

use stinger::deploy::{ProbeBackend, UProbeSpec};
use stinger::errors::DeployError;
use stinger::proc::{ProcReader, Upid};
use stinger_common::{
    GoCommonSymaddrs, GoHttp2Symaddrs, GoTlsSymaddrs, OpensslSymaddrs, RawUpid,
};

// ---------------------------------------------------------------------------
// ELF fixtures

/// x86-64 bodies with known return-instruction offsets.
pub const CODE_ONE_RET: &[u8] = &[0x55, 0x48, 0x89, 0xe5, 0x90, 0xc3]; // ret at +5
pub const CODE_TWO_RETS: &[u8] = &[0x31, 0xc0, 0xc3, 0x90, 0xc3]; // rets at +2, +4
pub const CODE_RET_ONLY: &[u8] = &[0xc3]; // ret at +0

pub struct ElfFixture {
    obj: ObjectWriter<'static>,
    text: object::write::SectionId,
    data: object::write::SectionId,
}

impl ElfFixture {
    pub fn new() -> Self {
        let mut obj =
            ObjectWriter::new(BinaryFormat::Elf, Architecture::X86_64, Endianness::Little);
        let text_segment = obj.segment_name(StandardSegment::Text).to_vec();
        let text = obj.add_section(text_segment, b".text".to_vec(), SectionKind::Text);
        let data_segment = obj.segment_name(StandardSegment::Data).to_vec();
        let data = obj.add_section(data_segment, b".data".to_vec(), SectionKind::Data);
        Self { obj, text, data }
    }

    /// Append a function body and its symbol; returns the symbol address.
    pub fn add_function(&mut self, name: &str, code: &[u8]) -> u64 {
        let offset = self.obj.append_section_data(self.text, code, 16);
        self.obj.add_symbol(WriteSymbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: code.len() as u64,
            kind: SymbolKind::Text,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(self.text),
            flags: SymbolFlags::None,
        });
        offset
    }

    pub fn add_data_symbol(&mut self, name: &str, bytes: &[u8]) -> u64 {
        let offset = self.obj.append_section_data(self.data, bytes, 8);
        self.obj.add_symbol(WriteSymbol {
            name: name.as_bytes().to_vec(),
            value: offset,
            size: bytes.len() as u64,
            kind: SymbolKind::Data,
            scope: SymbolScope::Linkage,
            weak: false,
            section: SymbolSection::Section(self.data),
            flags: SymbolFlags::None,
        });
        offset
    }

    pub fn set_dwarf(&mut self, dwarf: DwarfFixture) {
        for (name, data) in dwarf.into_sections() {
            let id = self
                .obj
                .add_section(Vec::new(), name.into_bytes(), SectionKind::Debug);
            self.obj.append_section_data(id, &data, 1);
        }
    }

    pub fn build(self) -> Vec<u8> {
        self.obj.write().expect("failed to emit fixture ELF")
    }

    pub fn write_to(self, path: &Path) -> PathBuf {
        std::fs::write(path, self.build()).expect("failed to write fixture ELF");
        path.to_path_buf()
    }
}

// ---------------------------------------------------------------------------
// DWARF fixtures

pub enum FixtureLoc {
    /// DW_OP_fbreg <offset>, frame base being the CFA.
    FrameBase(i64),
    /// DW_OP_reg<n>
    Reg(u8),
}

pub struct DwarfFixture {
    dwarf: DwarfUnit,
}

impl DwarfFixture {
    pub fn new() -> Self {
        let encoding = Encoding {
            format: Format::Dwarf32,
            version: 4,
            address_size: 8,
        };
        Self {
            dwarf: DwarfUnit::new(encoding),
        }
    }

    pub fn add_struct(&mut self, name: &str, members: &[(&str, u64)]) -> &mut Self {
        let root = self.dwarf.unit.root();
        let struct_id = self.dwarf.unit.add(root, gimli::DW_TAG_structure_type);
        self.dwarf
            .unit
            .get_mut(struct_id)
            .set(gimli::DW_AT_name, AttributeValue::String(name.into()));
        for (member, offset) in members {
            let member_id = self.dwarf.unit.add(struct_id, gimli::DW_TAG_member);
            let entry = self.dwarf.unit.get_mut(member_id);
            entry.set(gimli::DW_AT_name, AttributeValue::String((*member).into()));
            entry.set(
                gimli::DW_AT_data_member_location,
                AttributeValue::Udata(*offset),
            );
        }
        self
    }

    pub fn add_function(&mut self, name: &str, params: &[(&str, FixtureLoc)]) -> &mut Self {
        let root = self.dwarf.unit.root();
        let fn_id = self.dwarf.unit.add(root, gimli::DW_TAG_subprogram);
        self.dwarf
            .unit
            .get_mut(fn_id)
            .set(gimli::DW_AT_name, AttributeValue::String(name.into()));
        for (param, loc) in params {
            let param_id = self.dwarf.unit.add(fn_id, gimli::DW_TAG_formal_parameter);
            let entry = self.dwarf.unit.get_mut(param_id);
            entry.set(gimli::DW_AT_name, AttributeValue::String((*param).into()));
            let expr = match loc {
                FixtureLoc::FrameBase(offset) => {
                    let mut bytes = vec![gimli::DW_OP_fbreg.0];
                    write_sleb128(&mut bytes, *offset);
                    Expression::raw(bytes)
                }
                FixtureLoc::Reg(n) => Expression::raw(vec![gimli::DW_OP_reg0.0 + n]),
            };
            entry.set(gimli::DW_AT_location, AttributeValue::Exprloc(expr));
        }
        self
    }

    pub fn into_sections(mut self) -> Vec<(String, Vec<u8>)> {
        let mut sections = Sections::new(EndianVec::new(LittleEndian));
        self.dwarf
            .write(&mut sections)
            .expect("failed to emit fixture DWARF");
        let mut out = Vec::new();
        sections
            .for_each(|id, data| {
                if !data.slice().is_empty() {
                    out.push((id.name().to_string(), data.slice().to_vec()));
                }
                Ok::<(), gimli::Error>(())
            })
            .unwrap();
        out
    }
}

fn write_sleb128(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            break;
        }
        out.push(byte | 0x80);
    }
}

// ---------------------------------------------------------------------------
// Canned binaries

/// A plain C-style binary: not Go, no OpenSSL.
pub fn write_plain_binary(path: &Path) -> PathBuf {
    let mut fixture = ElfFixture::new();
    fixture.add_function("main", CODE_ONE_RET);
    fixture.write_to(path)
}

/// A libssl.so.1.1 stand-in exporting the probed API.
pub fn write_libssl(path: &Path) -> PathBuf {
    let mut fixture = ElfFixture::new();
    fixture.add_function("SSL_write", CODE_ONE_RET);
    fixture.add_function("SSL_read", CODE_ONE_RET);
    fixture.write_to(path)
}

/// A stripped libcrypto.so.1.1 stand-in carrying the 1.1 version marker.
pub fn write_libcrypto(path: &Path) -> PathBuf {
    let mut fixture = ElfFixture::new();
    fixture.add_function("OPENSSL_init_crypto", CODE_ONE_RET);
    fixture.write_to(path)
}

/// Expected attach counts for [`write_go_binary`], per family.
pub const GO_TLS_EXPECTED_ATTACHES: u64 = 5; // 2 entries + 1 + 2 return sites
pub const GO_HTTP2_EXPECTED_ATTACHES: u64 = 6; // 4 entries + 2 return sites

/// A Go binary stand-in using TLS and the gRPC HTTP/2 transport, with the
/// debug info the symbol resolvers consult.
pub fn write_go_binary(path: &Path) -> PathBuf {
    let mut fixture = go_fixture();
    fixture.add_data_symbol("runtime.buildVersion", &[0u8; 16]);
    fixture.write_to(path)
}

/// The same layout minus the Go runtime marker: everything the resolvers
/// want is present, but the binary must still be skipped as non-Go.
pub fn write_go_binary_without_runtime(path: &Path) -> PathBuf {
    go_fixture().write_to(path)
}

fn go_fixture() -> ElfFixture {
    const TRANSPORT: &str = "google.golang.org/grpc/internal/transport";

    let mut fixture = ElfFixture::new();
    fixture.add_function("crypto/tls.(*Conn).Write", CODE_ONE_RET);
    fixture.add_function("crypto/tls.(*Conn).Read", CODE_TWO_RETS);
    fixture.add_function(&format!("{TRANSPORT}.(*loopyWriter).writeHeader"), CODE_RET_ONLY);
    fixture.add_function(
        &format!("{TRANSPORT}.(*http2Client).operateHeaders"),
        CODE_RET_ONLY,
    );
    fixture.add_function(
        &format!("{TRANSPORT}.(*http2Server).operateHeaders"),
        CODE_RET_ONLY,
    );
    fixture.add_function(
        "golang.org/x/net/http2.(*Framer).checkFrameOrder",
        &[0x90, 0xc3, 0x90, 0xc3],
    );

    fixture.add_data_symbol("go.itab.*net.TCPConn,net.Conn", &[0u8; 8]);
    fixture.add_data_symbol("go.itab.*crypto/tls.Conn,net.Conn", &[0u8; 8]);
    fixture.add_data_symbol(
        "go.itab.*google.golang.org/grpc/credentials/internal.syscallConn,net.Conn",
        &[0u8; 8],
    );
    fixture.add_data_symbol(
        "go.itab.*google.golang.org/grpc/internal/transport.bufWriter,io.Writer",
        &[0u8; 8],
    );

    let mut dwarf = DwarfFixture::new();
    dwarf
        .add_struct("internal/poll.FD", &[("Sysfd", 16)])
        .add_struct("crypto/tls.Conn", &[("conn", 0)])
        .add_struct(
            "google.golang.org/grpc/credentials/internal.syscallConn",
            &[("conn", 0)],
        )
        .add_struct(&format!("{TRANSPORT}.loopyWriter"), &[("framer", 40)])
        .add_struct(&format!("{TRANSPORT}.framer"), &[("writer", 0)])
        .add_struct(&format!("{TRANSPORT}.bufWriter"), &[("conn", 40)])
        .add_struct(&format!("{TRANSPORT}.http2Client"), &[("conn", 64)])
        .add_struct(&format!("{TRANSPORT}.http2Server"), &[("conn", 32)])
        .add_struct("golang.org/x/net/http2.MetaHeadersFrame", &[("Fields", 8)])
        .add_struct(
            "golang.org/x/net/http2.HeadersFrame",
            &[("FrameHeader", 0)],
        )
        .add_struct("golang.org/x/net/http2.FrameHeader", &[("StreamID", 8)])
        .add_struct(
            "golang.org/x/net/http2/hpack.HeaderField",
            &[("Name", 0), ("Value", 16)],
        )
        .add_function(
            "crypto/tls.(*Conn).Write",
            &[
                ("c", FixtureLoc::FrameBase(0)),
                ("b", FixtureLoc::FrameBase(8)),
                ("~r1", FixtureLoc::FrameBase(32)),
            ],
        )
        .add_function(
            "crypto/tls.(*Conn).Read",
            &[
                ("c", FixtureLoc::FrameBase(0)),
                ("b", FixtureLoc::FrameBase(8)),
                ("~r1", FixtureLoc::FrameBase(32)),
            ],
        )
        .add_function(
            &format!("{TRANSPORT}.(*loopyWriter).writeHeader"),
            &[
                ("l", FixtureLoc::FrameBase(0)),
                ("streamID", FixtureLoc::FrameBase(8)),
                ("hf", FixtureLoc::FrameBase(16)),
            ],
        )
        .add_function(
            &format!("{TRANSPORT}.(*http2Client).operateHeaders"),
            &[
                ("t", FixtureLoc::FrameBase(0)),
                ("frame", FixtureLoc::FrameBase(8)),
            ],
        );
    fixture.set_dwarf(dwarf);

    fixture
}

// ---------------------------------------------------------------------------
// Recording back end

#[derive(Default)]
pub struct RecordState {
    pub attaches: Vec<UProbeSpec>,
    pub openssl_table: HashMap<u32, OpensslSymaddrs>,
    pub go_common_table: HashMap<u32, GoCommonSymaddrs>,
    pub go_tls_table: HashMap<u32, GoTlsSymaddrs>,
    pub go_http2_table: HashMap<u32, GoHttp2Symaddrs>,
    pub mmap_events: Vec<RawUpid>,
    /// Handlers whose attach calls should fail, for error-path tests.
    pub fail_handlers: HashSet<String>,
}

/// [`ProbeBackend`] that records every registration instead of talking to
/// the kernel. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct RecordingBackend(pub Arc<Mutex<RecordState>>);

impl RecordingBackend {
    pub fn state(&self) -> MutexGuard<'_, RecordState> {
        self.0.lock().unwrap()
    }

    pub fn push_mmap_event(&self, upid: Upid) {
        self.state().mmap_events.push(RawUpid {
            pid: upid.pid,
            _pad: 0,
            start_time_ticks: upid.start_time_ticks,
        });
    }

    pub fn attach_count(&self) -> usize {
        self.state().attaches.len()
    }

    pub fn attached_handlers(&self) -> Vec<String> {
        self.state()
            .attaches
            .iter()
            .map(|spec| spec.handler.clone())
            .collect()
    }
}

impl ProbeBackend for RecordingBackend {
    fn attach_uprobe(&mut self, spec: &UProbeSpec) -> Result<(), DeployError> {
        let mut state = self.0.lock().unwrap();
        if state.fail_handlers.contains(&spec.handler) {
            return Err(DeployError::ProbeAttachFailed {
                handler: spec.handler.clone(),
                binary: spec.binary_path.clone(),
                reason: "injected failure".to_string(),
            });
        }
        state.attaches.push(spec.clone());
        Ok(())
    }

    fn update_openssl_symaddrs(
        &mut self,
        pid: u32,
        addrs: &OpensslSymaddrs,
    ) -> Result<(), DeployError> {
        self.state().openssl_table.insert(pid, *addrs);
        Ok(())
    }

    fn update_go_common_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoCommonSymaddrs,
    ) -> Result<(), DeployError> {
        self.state().go_common_table.insert(pid, *addrs);
        Ok(())
    }

    fn update_go_tls_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoTlsSymaddrs,
    ) -> Result<(), DeployError> {
        self.state().go_tls_table.insert(pid, *addrs);
        Ok(())
    }

    fn update_go_http2_symaddrs(
        &mut self,
        pid: u32,
        addrs: &GoHttp2Symaddrs,
    ) -> Result<(), DeployError> {
        self.state().go_http2_table.insert(pid, *addrs);
        Ok(())
    }

    fn remove_openssl_symaddrs(&mut self, pid: u32) {
        self.state().openssl_table.remove(&pid);
    }

    fn remove_go_common_symaddrs(&mut self, pid: u32) {
        self.state().go_common_table.remove(&pid);
    }

    fn remove_go_tls_symaddrs(&mut self, pid: u32) {
        self.state().go_tls_table.remove(&pid);
    }

    fn remove_go_http2_symaddrs(&mut self, pid: u32) {
        self.state().go_http2_table.remove(&pid);
    }

    fn drain_mmap_events(&mut self) -> Vec<RawUpid> {
        std::mem::take(&mut self.state().mmap_events)
    }
}

// ---------------------------------------------------------------------------
// Fake /proc surface

#[derive(Default)]
pub struct FakeProcState {
    pub procs: HashMap<u32, (PathBuf, HashSet<PathBuf>)>,
}

/// [`ProcReader`] over an in-memory process table. All paths are treated as
/// already host-visible. Cloning shares the underlying state.
#[derive(Clone, Default)]
pub struct FakeProc(pub Arc<Mutex<FakeProcState>>);

impl FakeProc {
    pub fn insert(&self, pid: u32, exe: &Path, mapped: &[&Path]) {
        let mut mapped_set: HashSet<PathBuf> =
            mapped.iter().map(|p| p.to_path_buf()).collect();
        mapped_set.insert(exe.to_path_buf());
        self.0
            .lock()
            .unwrap()
            .procs
            .insert(pid, (exe.to_path_buf(), mapped_set));
    }

    pub fn set_mapped(&self, pid: u32, mapped: &[&Path]) {
        let mut state = self.0.lock().unwrap();
        let entry = state.procs.get_mut(&pid).expect("unknown fake pid");
        entry.1 = mapped.iter().map(|p| p.to_path_buf()).collect();
        let exe = entry.0.clone();
        entry.1.insert(exe);
    }
}

impl ProcReader for FakeProc {
    fn executable(&self, pid: u32) -> Result<PathBuf, DeployError> {
        self.0
            .lock()
            .unwrap()
            .procs
            .get(&pid)
            .map(|(exe, _)| exe.clone())
            .ok_or(DeployError::ProcessGone { pid })
    }

    fn mapped_paths(&self, pid: u32) -> Result<HashSet<PathBuf>, DeployError> {
        self.0
            .lock()
            .unwrap()
            .procs
            .get(&pid)
            .map(|(_, mapped)| mapped.clone())
            .ok_or(DeployError::ProcessGone { pid })
    }

    fn resolve_path(&self, _pid: u32, path: &Path) -> Result<PathBuf, DeployError> {
        Ok(path.to_path_buf())
    }
}

// ---------------------------------------------------------------------------

pub fn upid(pid: u32) -> Upid {
    Upid {
        asid: 1,
        pid,
        start_time_ticks: u64::from(pid) * 1000,
    }
}

pub fn upid_set(pids: &[u32]) -> HashSet<Upid> {
    pids.iter().copied().map(upid).collect()
}
