//! Per-family symbol address resolution: each function maps a binary's
//! readers to the fixed-shape record its probe family publishes kernel-side.
//! A record is only produced when every mandatory field resolved; optional
//! fields fall back to absent sentinels.

use std::path::Path;

use stinger_common::{
    ArgLocation, GoCommonSymaddrs, GoHttp2Symaddrs, GoTlsSymaddrs, OpensslSymaddrs,
    ABSENT_ADDRESS, ABSENT_OFFSET, LOC_TYPE_REGISTER, LOC_TYPE_STACK,
};

use crate::errors::DeployError;
use crate::obj::{DwarfReader, ElfReader, VarLocation};

pub const TCP_CONN_ITAB: &str = "go.itab.*net.TCPConn,net.Conn";
pub const TLS_CONN_ITAB: &str = "go.itab.*crypto/tls.Conn,net.Conn";
pub const SYSCALL_CONN_ITAB: &str =
    "go.itab.*google.golang.org/grpc/credentials/internal.syscallConn,net.Conn";
pub const TRANSPORT_BUF_WRITER_ITAB: &str =
    "go.itab.*google.golang.org/grpc/internal/transport.bufWriter,io.Writer";

const GO_TLS_WRITE_FN: &str = "crypto/tls.(*Conn).Write";
const GO_TLS_READ_FN: &str = "crypto/tls.(*Conn).Read";

// struct ssl_st / struct bio_st layout of OpenSSL 1.1.1, for stripped
// builds without debug info.
const SSL_RBIO_OFFSET_1_1: i32 = 0x10;
const RBIO_NUM_OFFSET_1_1: i32 = 0x30;

/// Offsets for the OpenSSL probes, from the libcrypto binary the target
/// process has mapped. Prefers debug info; falls back to the known 1.1.1
/// layout when the library is stripped.
pub fn openssl_symaddrs(libcrypto: &Path) -> Result<OpensslSymaddrs, DeployError> {
    let elf = ElfReader::open(libcrypto)?;

    if let Ok(dwarf) = DwarfReader::open(libcrypto) {
        let rbio = dwarf.struct_member_offset("ssl_st", "rbio");
        let num = dwarf.struct_member_offset("bio_st", "num");
        if let (Some(rbio), Some(num)) = (rbio, num) {
            return Ok(OpensslSymaddrs {
                ssl_rbio_offset: rbio as i32,
                rbio_num_offset: num as i32,
            });
        }
    }

    if elf.symbol_address("OPENSSL_init_crypto").is_some() {
        return Ok(OpensslSymaddrs {
            ssl_rbio_offset: SSL_RBIO_OFFSET_1_1,
            rbio_num_offset: RBIO_NUM_OFFSET_1_1,
        });
    }

    Err(DeployError::SymbolsIncomplete {
        family: "openssl",
        symbol: "ssl_st.rbio".to_string(),
    })
}

/// Interface-table addresses and member offsets shared by every Go probe.
/// A binary without a TCPConn itab is of no interest to any Go family.
pub fn go_common_symaddrs(
    elf: &ElfReader,
    dwarf: &DwarfReader,
) -> Result<GoCommonSymaddrs, DeployError> {
    const FAMILY: &str = "go-common";

    Ok(GoCommonSymaddrs {
        tcp_conn: require_symbol(elf, FAMILY, TCP_CONN_ITAB)?,
        tls_conn: require_symbol(elf, FAMILY, TLS_CONN_ITAB)?,
        internal_syscall_conn: symbol_or_absent(elf, SYSCALL_CONN_ITAB),
        fd_sysfd_offset: require_member(dwarf, FAMILY, "internal/poll.FD", "Sysfd")?,
        tls_conn_conn_offset: require_member(dwarf, FAMILY, "crypto/tls.Conn", "conn")?,
        syscall_conn_conn_offset: member_or_absent(
            dwarf,
            "google.golang.org/grpc/credentials/internal.syscallConn",
            "conn",
        ),
        _pad: 0,
    })
}

/// Argument locations for the Go TLS read/write probes. The connection and
/// buffer arguments are mandatory; return values may be absent.
pub fn go_tls_symaddrs(
    elf: &ElfReader,
    dwarf: &DwarfReader,
) -> Result<GoTlsSymaddrs, DeployError> {
    const FAMILY: &str = "go-tls";

    // The functions must exist before their arguments are worth resolving.
    require_symbol(elf, FAMILY, GO_TLS_WRITE_FN)?;
    require_symbol(elf, FAMILY, GO_TLS_READ_FN)?;

    Ok(GoTlsSymaddrs {
        write_c_loc: require_argument(dwarf, FAMILY, GO_TLS_WRITE_FN, "c")?,
        write_b_loc: require_argument(dwarf, FAMILY, GO_TLS_WRITE_FN, "b")?,
        write_retval0_loc: argument_or_absent(dwarf, GO_TLS_WRITE_FN, "~r1"),
        read_c_loc: require_argument(dwarf, FAMILY, GO_TLS_READ_FN, "c")?,
        read_b_loc: require_argument(dwarf, FAMILY, GO_TLS_READ_FN, "b")?,
        read_retval0_loc: argument_or_absent(dwarf, GO_TLS_READ_FN, "~r1"),
    })
}

/// Member offsets and argument locations for the HTTP/2 header probes.
/// Mandatory fields cover the client/loopy-writer walk down to the
/// connection fd; the server-side offset and argument locations are
/// best-effort.
pub fn go_http2_symaddrs(
    elf: &ElfReader,
    dwarf: &DwarfReader,
) -> Result<GoHttp2Symaddrs, DeployError> {
    const FAMILY: &str = "go-http2";
    const TRANSPORT: &str = "google.golang.org/grpc/internal/transport";

    let loopy_writer = format!("{TRANSPORT}.loopyWriter");
    let framer = format!("{TRANSPORT}.framer");
    let buf_writer = format!("{TRANSPORT}.bufWriter");
    let http2_client = format!("{TRANSPORT}.http2Client");
    let http2_server = format!("{TRANSPORT}.http2Server");
    let write_header = format!("{TRANSPORT}.(*loopyWriter).writeHeader");
    let operate_headers = format!("{TRANSPORT}.(*http2Client).operateHeaders");

    Ok(GoHttp2Symaddrs {
        transport_buf_writer: symbol_or_absent(elf, TRANSPORT_BUF_WRITER_ITAB),
        loopy_writer_framer_offset: require_member(dwarf, FAMILY, &loopy_writer, "framer")?,
        framer_writer_offset: require_member(dwarf, FAMILY, &framer, "writer")?,
        buf_writer_conn_offset: require_member(dwarf, FAMILY, &buf_writer, "conn")?,
        http2_client_conn_offset: require_member(dwarf, FAMILY, &http2_client, "conn")?,
        http2_server_conn_offset: member_or_absent(dwarf, &http2_server, "conn"),
        meta_headers_frame_fields_offset: require_member(
            dwarf,
            FAMILY,
            "golang.org/x/net/http2.MetaHeadersFrame",
            "Fields",
        )?,
        headers_frame_frame_header_offset: require_member(
            dwarf,
            FAMILY,
            "golang.org/x/net/http2.HeadersFrame",
            "FrameHeader",
        )?,
        frame_header_stream_id_offset: require_member(
            dwarf,
            FAMILY,
            "golang.org/x/net/http2.FrameHeader",
            "StreamID",
        )?,
        header_field_name_offset: require_member(
            dwarf,
            FAMILY,
            "golang.org/x/net/http2/hpack.HeaderField",
            "Name",
        )?,
        header_field_value_offset: require_member(
            dwarf,
            FAMILY,
            "golang.org/x/net/http2/hpack.HeaderField",
            "Value",
        )?,
        write_header_l_loc: argument_or_absent(dwarf, &write_header, "l"),
        write_header_stream_id_loc: argument_or_absent(dwarf, &write_header, "streamID"),
        write_header_hf_loc: argument_or_absent(dwarf, &write_header, "hf"),
        operate_headers_t_loc: argument_or_absent(dwarf, &operate_headers, "t"),
        operate_headers_frame_loc: argument_or_absent(dwarf, &operate_headers, "frame"),
    })
}

fn require_symbol(
    elf: &ElfReader,
    family: &'static str,
    name: &str,
) -> Result<i64, DeployError> {
    elf.symbol_address(name)
        .map(|addr| addr as i64)
        .ok_or_else(|| DeployError::SymbolsIncomplete {
            family,
            symbol: name.to_string(),
        })
}

fn symbol_or_absent(elf: &ElfReader, name: &str) -> i64 {
    elf.symbol_address(name)
        .map(|addr| addr as i64)
        .unwrap_or(ABSENT_ADDRESS)
}

fn require_member(
    dwarf: &DwarfReader,
    family: &'static str,
    struct_name: &str,
    member: &str,
) -> Result<i32, DeployError> {
    dwarf
        .struct_member_offset(struct_name, member)
        .map(|offset| offset as i32)
        .ok_or_else(|| DeployError::SymbolsIncomplete {
            family,
            symbol: format!("{struct_name}.{member}"),
        })
}

fn member_or_absent(dwarf: &DwarfReader, struct_name: &str, member: &str) -> i32 {
    dwarf
        .struct_member_offset(struct_name, member)
        .map(|offset| offset as i32)
        .unwrap_or(ABSENT_OFFSET)
}

fn require_argument(
    dwarf: &DwarfReader,
    family: &'static str,
    function: &str,
    param: &str,
) -> Result<ArgLocation, DeployError> {
    dwarf
        .argument_location(function, param)
        .map(to_arg_location)
        .ok_or_else(|| DeployError::SymbolsIncomplete {
            family,
            symbol: format!("{function}({param})"),
        })
}

fn argument_or_absent(dwarf: &DwarfReader, function: &str, param: &str) -> ArgLocation {
    dwarf
        .argument_location(function, param)
        .map(to_arg_location)
        .unwrap_or_default()
}

fn to_arg_location(location: VarLocation) -> ArgLocation {
    match location {
        VarLocation::Stack(offset) => ArgLocation {
            loc_type: LOC_TYPE_STACK,
            offset,
        },
        VarLocation::Register(reg) => ArgLocation {
            loc_type: LOC_TYPE_REGISTER,
            offset: i32::from(reg),
        },
    }
}
