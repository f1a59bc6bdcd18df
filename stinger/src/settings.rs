use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::deploy::UprobeConfig;

const DEFAULT_SCAN_INTERVAL_SECONDS: u64 = 30;

/// UProbe deployment configuration, e.g. `UPROBES__TRACE_HTTP2=true`.
#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct UprobeSettings {
    pub trace_http2: Option<bool>,
    pub disable_self_probing: Option<bool>,
    /// Use mmap tracing to rescan known processes for delay-loaded
    /// libraries like OpenSSL.
    pub rescan_for_dlopen: Option<bool>,
    pub cleanup_all_symaddr_tables: Option<bool>,
    /// Seconds between process scans.
    pub scan_interval: Option<u64>,
}

#[derive(Debug, Deserialize, Clone, Default)]
#[allow(unused)]
pub struct Settings {
    /// Path to the compiled probe bytecode.
    pub bytecode_path: Option<String>,
    #[serde(default)]
    pub uprobes: UprobeSettings,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let s = Config::builder()
            .add_source(Environment::default().separator("__"))
            .build()?;

        s.try_deserialize()
    }

    pub fn to_uprobe_config(&self) -> UprobeConfig {
        UprobeConfig {
            trace_http2: self.uprobes.trace_http2.unwrap_or(false),
            disable_self_probing: self.uprobes.disable_self_probing.unwrap_or(false),
            rescan_for_dlopen: self.uprobes.rescan_for_dlopen.unwrap_or(false),
            cleanup_all_symaddr_tables: self
                .uprobes
                .cleanup_all_symaddr_tables
                .unwrap_or(false),
        }
    }

    pub fn scan_interval(&self) -> u64 {
        self.uprobes
            .scan_interval
            .unwrap_or(DEFAULT_SCAN_INTERVAL_SECONDS)
    }
}
