//! Workload lifecycle control around a recovery.

use crate::error::{DrError, Result};
use async_trait::async_trait;
use backup_core::config::WorkloadConfig;
use backup_core::process::{CommandRunner, CommandSpec};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[async_trait]
pub trait WorkloadController: Send + Sync {
    /// Scale the workload to zero.
    async fn stop(&self, workload: &WorkloadConfig) -> Result<()>;

    /// Scale the workload back to its configured replica count.
    async fn start(&self, workload: &WorkloadConfig) -> Result<()>;

    /// Ready replicas right now.
    async fn count_running(&self, workload: &WorkloadConfig) -> Result<u32>;
}

/// Scales Kubernetes deployments through `kubectl`.
pub struct KubectlController {
    runner: Arc<dyn CommandRunner>,
    timeout: Duration,
}

impl KubectlController {
    pub fn new(runner: Arc<dyn CommandRunner>, timeout: Duration) -> Self {
        Self { runner, timeout }
    }

    fn kubectl(&self, workload: &WorkloadConfig) -> CommandSpec {
        CommandSpec::new("kubectl", self.timeout).args(["-n", workload.namespace.as_str()])
    }

    async fn scale(&self, workload: &WorkloadConfig, replicas: u32) -> Result<()> {
        let cmd = self.kubectl(workload).args([
            "scale".to_string(),
            format!("deployment/{}", workload.deployment),
            format!("--replicas={}", replicas),
        ]);
        self.runner
            .run(&cmd)
            .await?
            .check("kubectl scale")
            .map_err(|e| DrError::Workload(format!("{}/{}: {}", workload.namespace, workload.deployment, e)))?;
        tracing::info!(
            namespace = %workload.namespace,
            deployment = %workload.deployment,
            replicas,
            "Scaled deployment"
        );
        Ok(())
    }
}

#[async_trait]
impl WorkloadController for KubectlController {
    async fn stop(&self, workload: &WorkloadConfig) -> Result<()> {
        self.scale(workload, 0).await
    }

    async fn start(&self, workload: &WorkloadConfig) -> Result<()> {
        self.scale(workload, workload.replicas).await
    }

    async fn count_running(&self, workload: &WorkloadConfig) -> Result<u32> {
        let cmd = self.kubectl(workload).args([
            "get",
            "deployment",
            workload.deployment.as_str(),
            "-o",
            "jsonpath={.status.readyReplicas}",
        ]);
        let output = self.runner.run(&cmd).await?.check("kubectl get")?;
        let ready = output.stdout_string();
        if ready.is_empty() {
            return Ok(0);
        }
        ready
            .parse()
            .map_err(|_| DrError::Workload(format!("unexpected readyReplicas '{}'", ready)))
    }
}

/// Poll until `workload` reports `expected` ready replicas (at least, when
/// starting). Returns false when `timeout` expires first.
pub async fn wait_for(
    controller: &dyn WorkloadController,
    workload: &WorkloadConfig,
    expected: u32,
    timeout: Duration,
    poll: Duration,
) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match controller.count_running(workload).await {
            Ok(n) if expected == 0 && n == 0 => return true,
            Ok(n) if expected > 0 && n >= expected => return true,
            Ok(n) => tracing::debug!(deployment = %workload.deployment, running = n, expected, "Waiting for workload"),
            Err(e) => tracing::warn!(deployment = %workload.deployment, "Failed to count running replicas: {}", e),
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use backup_core::process::CommandOutput;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeKubectl {
        ready: String,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for FakeKubectl {
        async fn run(&self, cmd: &CommandSpec) -> backup_core::Result<CommandOutput> {
            self.calls.lock().unwrap().push(cmd.display());
            Ok(CommandOutput {
                code: Some(0),
                stdout: self.ready.as_bytes().to_vec(),
                stderr: Vec::new(),
                duration: Duration::from_millis(1),
            })
        }
    }

    fn workload() -> WorkloadConfig {
        WorkloadConfig {
            namespace: "platform".into(),
            deployment: "api".into(),
            replicas: 3,
        }
    }

    #[tokio::test]
    async fn test_kubectl_commands() {
        let runner = Arc::new(FakeKubectl {
            ready: "2".into(),
            calls: Mutex::new(Vec::new()),
        });
        let controller = KubectlController::new(runner.clone(), Duration::from_secs(30));

        controller.stop(&workload()).await.unwrap();
        controller.start(&workload()).await.unwrap();
        assert_eq!(controller.count_running(&workload()).await.unwrap(), 2);

        let calls = runner.calls.lock().unwrap().clone();
        assert_eq!(
            calls,
            vec![
                "kubectl -n platform scale deployment/api --replicas=0",
                "kubectl -n platform scale deployment/api --replicas=3",
                "kubectl -n platform get deployment api -o jsonpath={.status.readyReplicas}",
            ]
        );
    }

    #[tokio::test]
    async fn test_scaled_down_deployment_counts_zero() {
        let runner = Arc::new(FakeKubectl {
            ready: String::new(),
            calls: Mutex::new(Vec::new()),
        });
        let controller = KubectlController::new(runner, Duration::from_secs(30));
        assert_eq!(controller.count_running(&workload()).await.unwrap(), 0);
    }

    struct Draining {
        running: AtomicU32,
    }

    #[async_trait]
    impl WorkloadController for Draining {
        async fn stop(&self, _: &WorkloadConfig) -> Result<()> {
            Ok(())
        }
        async fn start(&self, _: &WorkloadConfig) -> Result<()> {
            Ok(())
        }
        async fn count_running(&self, _: &WorkloadConfig) -> Result<u32> {
            let n = self.running.load(Ordering::SeqCst);
            self.running.store(n.saturating_sub(1), Ordering::SeqCst);
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_wait_for_drain() {
        let controller = Draining {
            running: AtomicU32::new(2),
        };
        let drained = wait_for(
            &controller,
            &workload(),
            0,
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .await;
        assert!(drained);
    }

    #[tokio::test]
    async fn test_wait_for_gives_up_at_deadline() {
        let controller = Draining {
            running: AtomicU32::new(u32::MAX),
        };
        let started = Instant::now();
        let drained = wait_for(
            &controller,
            &workload(),
            0,
            Duration::from_millis(50),
            Duration::from_millis(10),
        )
        .await;
        assert!(!drained);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
