use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::{self, EnvFilter};

#[derive(Debug, Parser)]
struct Opt {
    /// Enable verbose output (sets log level to INFO)
    #[clap(short, long)]
    verbose: bool,

    /// Path to the compiled probe bytecode (overrides BYTECODE_PATH)
    #[clap(long)]
    bytecode: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let opt = Opt::parse();

    // RUST_LOG wins; otherwise --verbose selects info, default is warn.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(if opt.verbose { "info" } else { "warn" })),
        )
        .init();

    let settings = stinger::settings::Settings::new().context("Failed to load settings")?;

    let bytecode_path = opt
        .bytecode
        .or_else(|| settings.bytecode_path.clone().map(PathBuf::from))
        .context("No probe bytecode configured; pass --bytecode or set BYTECODE_PATH")?;
    let bpf = aya::Ebpf::load_file(&bytecode_path).with_context(|| {
        format!(
            "Failed to load probe bytecode from {}",
            bytecode_path.display()
        )
    })?;

    let engine = stinger::StingerEngine::new(settings, bpf)?;
    engine.run().await?;

    Ok(())
}
