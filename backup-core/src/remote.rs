//! Best-effort copy of finished artifacts to remote storage.

use crate::config::{RemoteConfig, RemoteType};
use crate::process::{CommandRunner, CommandSpec};
use crate::service::ServiceKind;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

pub struct RemoteSync {
    config: RemoteConfig,
    runner: Arc<dyn CommandRunner>,
}

impl RemoteSync {
    pub fn new(config: RemoteConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    pub fn enabled(&self) -> bool {
        self.config.remote_type != RemoteType::None && self.config.uri.is_some()
    }

    /// Remote location of `file` for `kind`.
    fn destination(&self, kind: ServiceKind, file: &Path) -> Option<String> {
        let uri = self.config.uri.as_deref()?.trim_end_matches('/');
        let name = file.file_name()?.to_string_lossy();
        Some(format!("{}/{}/{}", uri, kind.name(), name))
    }

    fn command(&self, kind: ServiceKind, file: &Path) -> Option<CommandSpec> {
        let dest = self.destination(kind, file)?;
        let timeout = Duration::from_secs(self.config.timeout_secs);
        let src = file.to_string_lossy().to_string();
        match self.config.remote_type {
            RemoteType::None => None,
            RemoteType::S3 => Some(
                CommandSpec::new("aws", timeout)
                    .args(["s3", "cp", "--only-show-errors"])
                    .args([src, dest]),
            ),
            RemoteType::Rsync => Some(
                CommandSpec::new("rsync", timeout)
                    .args(["-a", "--partial", "--mkpath"])
                    .args([src, dest]),
            ),
        }
    }

    /// Upload each file. Failures are logged as warnings and never returned;
    /// the remote URI of the first file is returned when every upload worked.
    pub async fn sync(&self, kind: ServiceKind, files: &[&Path]) -> Option<String> {
        if !self.enabled() {
            return None;
        }

        let mut all_ok = true;
        for file in files {
            let Some(cmd) = self.command(kind, file) else {
                continue;
            };
            match self.runner.run(&cmd).await.and_then(|o| o.check(&cmd.program)) {
                Ok(_) => tracing::info!(service = %kind, file = %file.display(), "Synced to remote storage"),
                Err(e) => {
                    all_ok = false;
                    tracing::warn!(service = %kind, file = %file.display(), "Remote sync failed: {}", e);
                }
            }
        }

        if all_ok {
            files.first().and_then(|f| self.destination(kind, f))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{fail, ok, ScriptedRunner};

    fn config(remote_type: RemoteType) -> RemoteConfig {
        RemoteConfig {
            remote_type,
            uri: Some("s3://platform-backups/prod/".into()),
            timeout_secs: 60,
        }
    }

    #[tokio::test]
    async fn test_s3_upload_command() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        let sync = RemoteSync::new(config(RemoteType::S3), runner.clone());
        let file = Path::new("/backups/redis/redis_20240310_020000.tar.zst.enc");

        let uri = sync.sync(ServiceKind::KeyValue, &[file]).await;
        assert_eq!(
            uri.as_deref(),
            Some("s3://platform-backups/prod/redis/redis_20240310_020000.tar.zst.enc")
        );
        assert_eq!(
            runner.commands(),
            vec!["aws s3 cp --only-show-errors /backups/redis/redis_20240310_020000.tar.zst.enc \
                  s3://platform-backups/prod/redis/redis_20240310_020000.tar.zst.enc"]
        );
    }

    #[tokio::test]
    async fn test_failure_is_not_propagated() {
        let runner = Arc::new(ScriptedRunner::new(|_| fail("connection reset")));
        let sync = RemoteSync::new(config(RemoteType::Rsync), runner);
        let file = Path::new("/backups/postgres/postgres_20240310_020000.tar.zst.enc");
        assert!(sync.sync(ServiceKind::Postgres, &[file]).await.is_none());
    }

    #[tokio::test]
    async fn test_disabled_runs_nothing() {
        let runner = Arc::new(ScriptedRunner::new(|_| ok("")));
        let sync = RemoteSync::new(RemoteConfig::default(), runner.clone());
        assert!(sync.sync(ServiceKind::Postgres, &[Path::new("/x")]).await.is_none());
        assert!(runner.commands().is_empty());
    }
}
