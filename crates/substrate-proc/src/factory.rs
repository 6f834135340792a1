use async_trait::async_trait;
use sha2::{Digest, Sha256};
use substrate::{IsolationUnit, Substrate, SubstrateError, UnitConfig};
use tracing::{info, warn};

use crate::config::ProcConfig;
use crate::paths::UnitPaths;
use crate::unit::ProcUnit;

pub struct ProcSubstrate {
    config: ProcConfig,
    started: bool,
}

impl ProcSubstrate {
    pub fn new(config: ProcConfig) -> Self {
        Self {
            config,
            started: false,
        }
    }
}

#[async_trait]
impl Substrate for ProcSubstrate {
    fn name(&self) -> &str {
        "proc"
    }

    fn profile_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(b"substrate:proc");
        hasher.update(b"base_dir:");
        hasher.update(self.config.base_dir.to_string_lossy().as_bytes());
        format!("{:x}", hasher.finalize())
    }

    async fn startup(&mut self) -> substrate::Result<()> {
        if self.started {
            return Err(SubstrateError::NotAvailable("already started".into()));
        }
        tokio::fs::create_dir_all(self.config.base_dir.join("units"))
            .await
            .map_err(|e| SubstrateError::NotAvailable(format!("base dir: {e}")))?;
        self.started = true;
        info!(base_dir = %self.config.base_dir.display(), "proc substrate started");
        Ok(())
    }

    async fn create(&self, config: UnitConfig) -> substrate::Result<Box<dyn IsolationUnit>> {
        if !self.started {
            return Err(SubstrateError::NotAvailable("substrate not started".into()));
        }
        let id = config.id.to_string();
        let paths = UnitPaths::new(&self.config.base_dir, &id);
        tokio::fs::create_dir_all(paths.scratch())
            .await
            .map_err(|e| SubstrateError::CreationFailed(format!("mkdir scratch: {e}")))?;

        info!(id = %id, runtime = %config.runtime, "unit created");
        Ok(Box::new(ProcUnit::new(config.id, config.runtime, paths)))
    }

    async fn destroy(&self, unit: Box<dyn IsolationUnit>) {
        let unit = match (unit as Box<dyn std::any::Any>).downcast::<ProcUnit>() {
            Ok(u) => *u,
            Err(_) => {
                warn!("destroy called with a non-proc unit, ignoring");
                return;
            }
        };

        unit.terminate().await;

        let unit_id = unit.id();
        if let Err(e) = tokio::fs::remove_dir_all(unit.paths().root()).await {
            warn!(id = %unit_id, error = %e, "failed to delete unit dir");
        }
        info!(id = %unit_id, "unit destroyed");
    }

    async fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        info!("proc substrate shutdown complete");
    }
}
