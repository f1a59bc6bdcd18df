use crate::obj::SymbolMatchType;

use super::{AttachMode, AttachType, FixedProbe, UProbeTmpl};

/// OpenSSL exports a stable C API, so the probe list is fixed: entry and
/// return probes around the encrypted read/write calls.
pub const OPENSSL_UPROBES: &[FixedProbe] = &[
    FixedProbe {
        symbol: "SSL_write",
        mode: AttachMode::Entry,
        handler: "probe_entry_ssl_write",
    },
    FixedProbe {
        symbol: "SSL_write",
        mode: AttachMode::Return,
        handler: "probe_ret_ssl_write",
    },
    FixedProbe {
        symbol: "SSL_read",
        mode: AttachMode::Entry,
        handler: "probe_entry_ssl_read",
    },
    FixedProbe {
        symbol: "SSL_read",
        mode: AttachMode::Return,
        handler: "probe_ret_ssl_read",
    },
];

/// Go TLS templates. Return probes fan out over the return instructions of
/// the function body instead of using uretprobes.
pub const GO_TLS_UPROBE_TMPLS: &[UProbeTmpl] = &[
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Write",
        match_type: SymbolMatchType::Exact,
        attach_type: AttachType::Entry,
        handler: "probe_entry_tls_conn_write",
    },
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Write",
        match_type: SymbolMatchType::Exact,
        attach_type: AttachType::ReturnInsts,
        handler: "probe_ret_tls_conn_write",
    },
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Read",
        match_type: SymbolMatchType::Exact,
        attach_type: AttachType::Entry,
        handler: "probe_entry_tls_conn_read",
    },
    UProbeTmpl {
        symbol: "crypto/tls.(*Conn).Read",
        match_type: SymbolMatchType::Exact,
        attach_type: AttachType::ReturnInsts,
        handler: "probe_ret_tls_conn_read",
    },
];

/// Go HTTP/2 templates. Suffix matching keeps them effective for vendored
/// copies of the gRPC transport and x/net/http2 packages.
pub const GO_HTTP2_UPROBE_TMPLS: &[UProbeTmpl] = &[
    UProbeTmpl {
        symbol: "transport.(*loopyWriter).writeHeader",
        match_type: SymbolMatchType::Suffix,
        attach_type: AttachType::Entry,
        handler: "probe_loopy_writer_write_header",
    },
    UProbeTmpl {
        symbol: "transport.(*http2Client).operateHeaders",
        match_type: SymbolMatchType::Suffix,
        attach_type: AttachType::Entry,
        handler: "probe_http2_client_operate_headers",
    },
    UProbeTmpl {
        symbol: "transport.(*http2Server).operateHeaders",
        match_type: SymbolMatchType::Suffix,
        attach_type: AttachType::Entry,
        handler: "probe_http2_server_operate_headers",
    },
    UProbeTmpl {
        symbol: "http2.(*Framer).checkFrameOrder",
        match_type: SymbolMatchType::Suffix,
        attach_type: AttachType::Entry,
        handler: "probe_entry_http2_framer_check_frame_order",
    },
    UProbeTmpl {
        symbol: "http2.(*Framer).checkFrameOrder",
        match_type: SymbolMatchType::Suffix,
        attach_type: AttachType::ReturnInsts,
        handler: "probe_ret_http2_framer_check_frame_order",
    },
];
