#![no_std]

// Shared data structures between the kernel-side probe handlers and userspace.
// Field order and sizes are a contract with the probe C code; keep repr(C)
// and layouts identical on both sides.

/// Sentinel for a struct-member offset that could not be resolved.
pub const ABSENT_OFFSET: i32 = -1;
/// Sentinel for a symbol virtual address that could not be resolved.
pub const ABSENT_ADDRESS: i64 = -1;

pub const LOC_TYPE_INVALID: i32 = 0;
pub const LOC_TYPE_STACK: i32 = 1;
pub const LOC_TYPE_REGISTER: i32 = 2;

/// Location of a function argument at the probe site: either a stack slot
/// (offset from SP at function entry) or a machine register number.
/// `loc_type == LOC_TYPE_INVALID` means the argument was not resolved.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct ArgLocation {
    pub loc_type: i32,
    pub offset: i32,
}

/// Key of the kernel-populated mmap event map. Start time distinguishes a
/// reused kernel pid.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawUpid {
    pub pid: u32,
    pub _pad: u32,
    pub start_time_ticks: u64,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for RawUpid {}

/// Offsets the OpenSSL read/write probes need to walk from an SSL* to the
/// underlying file descriptor.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpensslSymaddrs {
    /// Offset of `rbio` inside `struct ssl_st`.
    pub ssl_rbio_offset: i32,
    /// Offset of `num` inside `struct bio_st`.
    pub rbio_num_offset: i32,
}

impl Default for OpensslSymaddrs {
    fn default() -> Self {
        Self {
            ssl_rbio_offset: ABSENT_OFFSET,
            rbio_num_offset: ABSENT_OFFSET,
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for OpensslSymaddrs {}

/// Interface-table addresses and member offsets shared by every Go probe:
/// enough to walk a `net.Conn` interface value down to `Sysfd`.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GoCommonSymaddrs {
    /// Address of `go.itab.*google.golang.org/grpc/credentials/internal.syscallConn,net.Conn`.
    pub internal_syscall_conn: i64,
    /// Address of `go.itab.*crypto/tls.Conn,net.Conn`.
    pub tls_conn: i64,
    /// Address of `go.itab.*net.TCPConn,net.Conn`.
    pub tcp_conn: i64,
    /// Offset of `Sysfd` inside `internal/poll.FD`.
    pub fd_sysfd_offset: i32,
    /// Offset of `conn` inside `crypto/tls.Conn`.
    pub tls_conn_conn_offset: i32,
    /// Offset of `conn` inside the gRPC credentials `syscallConn`.
    pub syscall_conn_conn_offset: i32,
    pub _pad: i32,
}

impl Default for GoCommonSymaddrs {
    fn default() -> Self {
        Self {
            internal_syscall_conn: ABSENT_ADDRESS,
            tls_conn: ABSENT_ADDRESS,
            tcp_conn: ABSENT_ADDRESS,
            fd_sysfd_offset: ABSENT_OFFSET,
            tls_conn_conn_offset: ABSENT_OFFSET,
            syscall_conn_conn_offset: ABSENT_OFFSET,
            _pad: 0,
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for GoCommonSymaddrs {}

/// Argument locations of `crypto/tls.(*Conn).Write` and `Read`, read off the
/// stack by the Go TLS entry and return-site probes.
#[repr(C)]
#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub struct GoTlsSymaddrs {
    pub write_c_loc: ArgLocation,
    pub write_b_loc: ArgLocation,
    pub write_retval0_loc: ArgLocation,
    pub read_c_loc: ArgLocation,
    pub read_b_loc: ArgLocation,
    pub read_retval0_loc: ArgLocation,
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for GoTlsSymaddrs {}

/// Everything the HTTP/2 header probes need to walk from a gRPC transport
/// object down to the connection fd and the HPACK header slice.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GoHttp2Symaddrs {
    /// Address of `go.itab.*google.golang.org/grpc/internal/transport.bufWriter,io.Writer`.
    pub transport_buf_writer: i64,
    /// Offset of `framer` inside `transport.loopyWriter`.
    pub loopy_writer_framer_offset: i32,
    /// Offset of `writer` inside `transport.framer`.
    pub framer_writer_offset: i32,
    /// Offset of `conn` inside `transport.bufWriter`.
    pub buf_writer_conn_offset: i32,
    /// Offset of `conn` inside `transport.http2Client`.
    pub http2_client_conn_offset: i32,
    /// Offset of `conn` inside `transport.http2Server`.
    pub http2_server_conn_offset: i32,
    /// Offset of `Fields` inside `http2.MetaHeadersFrame`.
    pub meta_headers_frame_fields_offset: i32,
    /// Offset of `FrameHeader` inside `http2.HeadersFrame`.
    pub headers_frame_frame_header_offset: i32,
    /// Offset of `StreamID` inside `http2.FrameHeader`.
    pub frame_header_stream_id_offset: i32,
    /// Offset of `Name` inside `hpack.HeaderField`.
    pub header_field_name_offset: i32,
    /// Offset of `Value` inside `hpack.HeaderField`.
    pub header_field_value_offset: i32,
    pub write_header_l_loc: ArgLocation,
    pub write_header_stream_id_loc: ArgLocation,
    pub write_header_hf_loc: ArgLocation,
    pub operate_headers_t_loc: ArgLocation,
    pub operate_headers_frame_loc: ArgLocation,
}

impl Default for GoHttp2Symaddrs {
    fn default() -> Self {
        Self {
            transport_buf_writer: ABSENT_ADDRESS,
            loopy_writer_framer_offset: ABSENT_OFFSET,
            framer_writer_offset: ABSENT_OFFSET,
            buf_writer_conn_offset: ABSENT_OFFSET,
            http2_client_conn_offset: ABSENT_OFFSET,
            http2_server_conn_offset: ABSENT_OFFSET,
            meta_headers_frame_fields_offset: ABSENT_OFFSET,
            headers_frame_frame_header_offset: ABSENT_OFFSET,
            frame_header_stream_id_offset: ABSENT_OFFSET,
            header_field_name_offset: ABSENT_OFFSET,
            header_field_value_offset: ABSENT_OFFSET,
            write_header_l_loc: ArgLocation::default(),
            write_header_stream_id_loc: ArgLocation::default(),
            write_header_hf_loc: ArgLocation::default(),
            operate_headers_t_loc: ArgLocation::default(),
            operate_headers_frame_loc: ArgLocation::default(),
        }
    }
}

#[cfg(feature = "user")]
unsafe impl aya::Pod for GoHttp2Symaddrs {}

// Names of the kernel-shared maps, one symaddrs table per probe family plus
// the mmap event map drained by the rescan pass.
pub const OPENSSL_SYMADDRS_MAP: &str = "OPENSSL_SYMADDRS";
pub const GO_COMMON_SYMADDRS_MAP: &str = "GO_COMMON_SYMADDRS";
pub const GO_TLS_SYMADDRS_MAP: &str = "GO_TLS_SYMADDRS";
pub const GO_HTTP2_SYMADDRS_MAP: &str = "GO_HTTP2_SYMADDRS";
pub const MMAP_EVENTS_MAP: &str = "MMAP_EVENTS";
