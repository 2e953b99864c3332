//! Typed external command execution.
//!
//! Native database tooling (`pg_dump`, `influx`, `kubectl`, ...) is invoked
//! through [`CommandRunner`] with argument vectors, never shell strings. Every
//! invocation carries its own timeout.

use crate::utils::{BackupError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Passed to the child only; values are never logged
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            stdin: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, data: Vec<u8>) -> Self {
        self.stdin = Some(data);
        self
    }

    /// `program arg1 arg2 ...` for logs and dry-run plans.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Value of the argument following `flag`, if present.
    pub fn flag_value(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }

    /// Turn a non-zero exit into `BackupError::Command`.
    pub fn check(self, program: &str) -> Result<Self> {
        if self.success() {
            Ok(self)
        } else {
            Err(BackupError::Command {
                program: program.to_string(),
                code: self.code,
                stderr: self.stderr_string(),
            })
        }
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. Exceeding `cmd.timeout` kills the child
    /// and returns `BackupError::CommandTimeout`; a non-zero exit is returned
    /// as a normal output for the caller to `check`.
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;
}

/// Runs commands as child processes of this process.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(command = %cmd.display(), timeout_secs = cmd.timeout.as_secs(), "Running command");
        let start = Instant::now();

        let mut command = tokio::process::Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| BackupError::Command {
            program: cmd.program.clone(),
            code: None,
            stderr: format!("failed to start: {}", e),
        })?;

        if let (Some(data), Some(mut stdin)) = (cmd.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&data).await {
                    tracing::warn!("Failed to write child stdin: {}", e);
                }
            });
        }

        match tokio::time::timeout(cmd.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => Ok(CommandOutput {
                code: output.status.code(),
                stdout: output.stdout,
                stderr: output.stderr,
                duration: start.elapsed(),
            }),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => {
                tracing::error!(program = %cmd.program, "Command timed out after {:?}", cmd.timeout);
                Err(BackupError::CommandTimeout {
                    program: cmd.program.clone(),
                    seconds: cmd.timeout.as_secs(),
                })
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    type Handler = dyn Fn(&CommandSpec) -> CommandOutput + Send + Sync;

    /// Records every command and answers with a scripted handler.
    pub struct ScriptedRunner {
        handler: Box<Handler>,
        pub calls: Mutex<Vec<CommandSpec>>,
    }

    impl ScriptedRunner {
        pub fn new<F>(handler: F) -> Self
        where
            F: Fn(&CommandSpec) -> CommandOutput + Send + Sync + 'static,
        {
            Self {
                handler: Box::new(handler),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn commands(&self) -> Vec<String> {
            self.calls.lock().unwrap().iter().map(|c| c.display()).collect()
        }
    }

    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.as_bytes().to_vec(),
            stderr: Vec::new(),
            duration: Duration::from_millis(1),
        }
    }

    pub fn fail(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stdout: Vec::new(),
            stderr: stderr.as_bytes().to_vec(),
            duration: Duration::from_millis(1),
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(cmd.clone());
            Ok((self.handler)(cmd))
        }
    }
}
