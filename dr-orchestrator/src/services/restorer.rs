//! Per-service restore step used by the orchestrator.

use crate::error::Result;
use async_trait::async_trait;
use backup_core::drivers::{driver_for, Toolbox};
use backup_core::layout;
use backup_core::notify::Notifier;
use backup_core::restore::confirm::StdinConfirmer;
use backup_core::restore::session::{RestoreMode, RestoreSession};
use backup_core::restore::{verify_artifact, RestoreRequest, RestoreRunner};
use backup_core::{Config, ServiceKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[async_trait]
pub trait ServiceRestorer: Send + Sync {
    /// Resolve the artifact for `kind` and check it without mutating anything.
    fn locate(&self, kind: ServiceKind, explicit: Option<&Path>, skip_verify: bool) -> Result<PathBuf>;

    async fn restore(
        &self,
        kind: ServiceKind,
        artifact: &Path,
        mode: RestoreMode,
        timeout: Duration,
    ) -> Result<RestoreSession>;
}

/// Restores through the service drivers.
pub struct DriverRestorer {
    config: Config,
    notifier: Notifier,
    tools: Toolbox,
}

impl DriverRestorer {
    pub fn new(config: Config, notifier: Notifier, tools: Toolbox) -> Self {
        Self {
            config,
            notifier,
            tools,
        }
    }
}

#[async_trait]
impl ServiceRestorer for DriverRestorer {
    fn locate(&self, kind: ServiceKind, explicit: Option<&Path>, skip_verify: bool) -> Result<PathBuf> {
        let artifact = layout::resolve_artifact(&self.config.service_dir(kind), kind, explicit)?;
        if !skip_verify {
            verify_artifact(&artifact, self.config.min_size_bytes(kind))?;
        }
        Ok(artifact)
    }

    async fn restore(
        &self,
        kind: ServiceKind,
        artifact: &Path,
        mode: RestoreMode,
        timeout: Duration,
    ) -> Result<RestoreSession> {
        let driver = driver_for(kind, &self.config, &self.tools);
        let request = RestoreRequest {
            artifact: Some(artifact.to_path_buf()),
            mode,
            timeout,
        };
        // Recovery was confirmed as a whole; sessions run forced.
        let confirmer = StdinConfirmer;
        let session = RestoreRunner::new(&self.config, &self.notifier, &confirmer)
            .run(driver.as_ref(), &request)
            .await?;
        Ok(session)
    }
}
