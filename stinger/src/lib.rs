pub mod deploy;
pub mod errors;
pub mod obj;
pub mod proc;
pub mod settings;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use aya::Ebpf;
use log::{info, warn};

use crate::deploy::{EbpfBackend, UProbeManager};
use crate::proc::SysProcReader;
use crate::settings::Settings;

/// The agent engine: owns the deployment orchestrator and drives it from a
/// periodic process scan. Each scan runs the blocking deployment pass on a
/// background worker; the orchestrator's internal mutex keeps passes from
/// overlapping when a scan is slow.
pub struct StingerEngine {
    settings: Settings,
    manager: Arc<UProbeManager<EbpfBackend, SysProcReader>>,
    deploy_workers: Arc<AtomicUsize>,
}

impl StingerEngine {
    pub fn new(settings: Settings, bpf: Ebpf) -> Result<Self> {
        let backend = EbpfBackend::new(bpf)?;
        let manager = Arc::new(UProbeManager::new(
            settings.to_uprobe_config(),
            backend,
            SysProcReader::new(),
        ));
        Ok(Self {
            settings,
            manager,
            deploy_workers: Arc::new(AtomicUsize::new(0)),
        })
    }

    /// Number of deployment workers currently in flight.
    pub fn deploy_workers_in_flight(&self) -> usize {
        self.deploy_workers.load(Ordering::SeqCst)
    }

    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_secs(self.settings.scan_interval());
        info!(
            "UProbe deployment engine started; scanning processes every {}s",
            interval.as_secs()
        );

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let observed = match proc::snapshot_upids() {
                        Ok(observed) => observed,
                        Err(e) => {
                            warn!("Process snapshot failed: {e}");
                            continue;
                        }
                    };

                    let manager = self.manager.clone();
                    let workers = self.deploy_workers.clone();
                    // Increment before spawning so a late-starting worker
                    // cannot race the counter.
                    workers.fetch_add(1, Ordering::SeqCst);
                    tokio::task::spawn_blocking(move || {
                        manager.deploy(observed);
                        workers.fetch_sub(1, Ordering::SeqCst);
                    });
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Shutting down");
                    break;
                }
            }
        }
        Ok(())
    }
}
